use std::path::PathBuf;
use thiserror::Error;

use crate::field::{CanonicalField, ColumnRef};

/// A format descriptor that cannot be loaded. Always fatal at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse descriptor: {0}")]
    Parse(String),
    #[error("{0}")]
    UnknownField(String),
    #[error("Unknown encoding '{0}'")]
    UnknownEncoding(String),
    #[error("Delimiter must be a single ASCII character, got '{0}'")]
    Delimiter(char),
    #[error("Invalid regex '{pattern}': {message}")]
    Regex { pattern: String, message: String },
    #[error("Field '{0}' must be mapped to a column or given a default")]
    MissingRequiredField(CanonicalField),
    #[error("Direction values configured but no 'direction' column mapped")]
    DirectionUnmapped,
    #[error("Transformation cycle: {0}")]
    TransformCycle(String),
    #[error("Transformation {step} reads {column} before a later step produces it")]
    ForwardReference { step: usize, column: ColumnRef },
    #[error("Split index {0} listed twice")]
    DuplicateSplitIndex(usize),
    #[error("Duplicate institution id '{0}'")]
    DuplicateInstitution(String),
    #[error("{path}: {source}")]
    InFile {
        path: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub(crate) fn regex(pattern: &str, err: regex::Error) -> Self {
        ConfigError::Regex { pattern: pattern.to_string(), message: err.to_string() }
    }
}

/// A file that could not be opened as a table at all.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("Workbook error: {0}")]
    Workbook(String),
    #[error("Sheet '{0}' not found")]
    SheetNotFound(String),
    #[error("Workbook has no sheets")]
    NoSheets,
    #[error("Transformations do not fit the file header: {0}")]
    Transforms(ConfigError),
}

/// A single source row that was skipped. Never aborts the file.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RowError {
    #[error("row {row}: undecodable record: {message}")]
    Decode { row: usize, message: String },
    #[error("row {row}: missing column {column}")]
    MissingColumn { row: usize, column: String },
    #[error("row {row}: transformation failed: {message}")]
    Transform { row: usize, message: String },
    #[error("row {row}: no value for '{field}'")]
    MissingField { row: usize, field: CanonicalField },
    #[error("row {row}: unparseable date '{value}'")]
    InvalidDate { row: usize, value: String },
    #[error("row {row}: unparseable amount '{value}'")]
    InvalidAmount { row: usize, value: String },
}

impl RowError {
    pub fn row(&self) -> usize {
        match self {
            RowError::Decode { row, .. }
            | RowError::MissingColumn { row, .. }
            | RowError::Transform { row, .. }
            | RowError::MissingField { row, .. }
            | RowError::InvalidDate { row, .. }
            | RowError::InvalidAmount { row, .. } => *row,
        }
    }
}
