//! Error types for geobatch.
//!
//! Taxonomy:
//! - Expected failures: bad input, unreadable files, config problems
//! - Infrastructure failures: SQL layer, filesystem
//! - Invariant violations: internal bugs
//!
//! Chunk-level failures are deliberately *not* represented here: they are
//! localized to one chunk and aggregated into `ProcessingStats`, never
//! propagated as a run-level error. See `engine::ChunkError`.

use thiserror::Error;

/// Top-level error type for geobatch.
#[derive(Debug, Error)]
pub enum GeobatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    /// Type-contract failure at an API boundary, e.g. a dataset without a
    /// geometry field handed to the chunked engine.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    /// A guarded table mutation could not be rolled back cleanly.
    ///
    /// The original error from a transaction body is returned unchanged;
    /// this variant only appears when the restore path itself is the thing
    /// that went wrong.
    #[error("Transaction on table '{table}' failed: {message}")]
    Transaction { table: String, message: String },

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GeobatchError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors raised by the transaction restore path.
    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction { .. })
    }
}

/// Result type alias for geobatch.
pub type Result<T> = std::result::Result<T, GeobatchError>;
