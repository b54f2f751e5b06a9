//! Query error types
//!
//! Filters are validated once, when they are parsed. Evaluation against a
//! document never fails.

use thiserror::Error;

/// Errors that can occur while parsing a filter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Filter has the wrong shape or an operand of the wrong type
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// `$`-prefixed key that is not a supported operator
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// `$limit` is not a non-negative integer
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
