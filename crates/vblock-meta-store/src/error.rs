//! Metadata store error types

use thiserror::Error;

/// Metadata store error
#[derive(Error, Debug)]
pub enum StoreError {
    /// No working connection could be supplied
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    /// A transaction commit was not applied
    #[error("Transaction aborted: {0}")]
    TxAborted(String),

    /// The connection was used outside its contract
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Backing storage engine error
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for metadata store operations
pub type StoreResult<T> = Result<T, StoreError>;
