use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Datafile is opened in read-only mode")]
    ReadOnly,

    /// The background log writer hit an I/O failure. The original error is
    /// shared so every producer that touches the poisoned queue sees it.
    #[error("Log writer failed: {0}")]
    WriterFailed(Arc<DbError>),
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_failed_wraps_source() {
        let io = DbError::Io(std::io::Error::other("disk gone"));
        let err = DbError::WriterFailed(Arc::new(io));
        assert!(err.to_string().contains("disk gone"));
    }
}
