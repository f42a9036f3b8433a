//! Error types for transfer sessions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Frame size {len} exceeds maximum allowed size {max}")]
    FrameTooLarge { len: u32, max: u32 },

    /// Message carried by an Error packet from the peer.
    #[error("{0}")]
    Remote(String),

    #[error("Invalid item path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Invalid metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Transfer timed out after {0} seconds of inactivity")]
    Timeout(u64),

    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the peer should be told about this failure with an Error packet.
    pub fn should_notify_peer(&self) -> bool {
        !matches!(self, Self::Remote(_) | Self::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_displays_peer_message() {
        let err = TransferError::Remote("disk full".to_string());
        assert_eq!(err.to_string(), "disk full");
        assert!(!err.should_notify_peer());
    }

    #[test]
    fn test_local_errors_notify_peer() {
        assert!(TransferError::protocol("bad state").should_notify_peer());
        assert!(TransferError::Cancelled.should_notify_peer());
        assert!(!TransferError::ConnectionClosed.should_notify_peer());
    }
}
