//! Error types for the haven engine.

use thiserror::Error;

/// All possible errors from the haven engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Query parsing errors
    #[error("unknown query operator: {0}")]
    UnknownOperator(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),

    #[error("unsupported regex flags: {0}")]
    UnsupportedRegexFlags(String),

    // Option parsing errors
    #[error("cannot mix inclusion and exclusion in a field projection")]
    MixedProjection,

    #[error("invalid query options: {0}")]
    InvalidOptions(String),

    // Schema errors
    #[error("invalid collection config: {0}")]
    InvalidConfig(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
