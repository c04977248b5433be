use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the transfer protocol, the transport and storage.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Peer ended the stream before the exchange completed
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Read or write on the transport failed
    #[error("connection error: {0}")]
    ConnectionError(#[source] std::io::Error),

    /// Upload source does not exist on the client
    #[error("local file not found: {}", .0.display())]
    LocalFileNotFound(PathBuf),

    /// Server answered a download with the not-found sentinel
    #[error("remote file not found: {0}")]
    RemoteFileNotFound(String),

    /// Unknown command token or malformed header
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Name cannot be mapped into the storage directory
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("file too large for transfer: {0} bytes")]
    FileTooLarge(u64),

    /// Local filesystem failure while reading or writing a transferred file
    #[error("storage error: {0}")]
    Storage(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransferError {
    /// Whether the connection can no longer be used after this error.
    ///
    /// Fatal errors leave the byte stream in an unknown position, so the
    /// session must be closed. The rest are reported to the caller and the
    /// next command may proceed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::ConnectionClosed
                | TransferError::ConnectionError(_)
                | TransferError::ProtocolMismatch(_)
                | TransferError::Timeout(_)
        )
    }

    /// Map a transport read failure, folding EOF into `ConnectionClosed`
    pub(crate) fn from_read(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => TransferError::ConnectionClosed,
            _ => TransferError::ConnectionError(err),
        }
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TransferError::ConnectionClosed.is_fatal());
        assert!(TransferError::ProtocolMismatch("x".into()).is_fatal());
        assert!(TransferError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!TransferError::RemoteFileNotFound("a".into()).is_fatal());
        assert!(!TransferError::LocalFileNotFound("a".into()).is_fatal());
        assert!(!TransferError::InvalidFileName("..".into()).is_fatal());
    }

    #[test]
    fn test_eof_maps_to_closed() {
        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(matches!(
            TransferError::from_read(eof),
            TransferError::ConnectionClosed
        ));

        let other = std::io::Error::other("boom");
        assert!(matches!(
            TransferError::from_read(other),
            TransferError::ConnectionError(_)
        ));
    }
}
