pub mod category;
pub mod money;
pub mod period;
pub mod transaction;

pub use category::{CategoryPath, CategoryTree, ReservedCategories, TaxonomyError, Tier1Node, Tier2Node};
pub use money::{round_minor, CurrencyCode};
pub use period::DateRange;
pub use transaction::{
    BankingSymbols, Counterparty, Provenance, RateSource, Transaction, TransactionId,
};
