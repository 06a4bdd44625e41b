pub mod amount;
pub mod date;
pub mod error;
pub mod field;
pub mod format;
pub mod normalize;
pub mod registry;
pub mod tabular;
pub mod transform;

pub use amount::{AmountFormat, DirectionValues};
pub use date::DateFormat;
pub use error::{ConfigError, FileError, RowError};
pub use field::{CanonicalField, ColumnRef};
pub use format::{CompiledFormat, Derivation, FileKind, FormatDescriptor};
pub use normalize::{strip_bank_code, Normalizer};
pub use registry::{FormatRegistry, RegistrySnapshot};
pub use tabular::{ParseStats, RawRecord, RecordStream};
pub use transform::Transformation;
