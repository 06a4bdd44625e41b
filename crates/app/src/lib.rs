pub mod cli;
pub mod config;
pub mod pipeline;
pub mod watch;

pub use cli::{Cli, Command, ImportArgs, UsageError};
pub use config::{ConfigError, Settings};
pub use pipeline::{ImportReport, ImportRequest, JobError, Pipeline};
