//! Error types for the bridge.

use std::time::Duration;

use thiserror::Error;

use crate::types::FrameErrors;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, AstmError>;

#[derive(Debug, Error)]
pub enum AstmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {after:?} during {phase}")]
    Timeout { phase: &'static str, after: Duration },

    #[error("exchange cancelled by shutdown")]
    Cancelled,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("establishment failed: {0}")]
    EstablishmentFailed(String),

    #[error("gave up after {attempts} attempts, last errors: {last_errors:?}")]
    TooManyRetries {
        attempts: usize,
        last_errors: FrameErrors,
    },

    #[error("peer aborted the transmission")]
    PeerAborted,

    #[error("unrecognized frame terminator 0x{0:02X}, message cannot be reconstructed")]
    UnrecognizedFrameType(u8),

    #[error("failed to load configuration from '{path}': {reason}")]
    Config { path: String, reason: String },
}

impl AstmError {
    pub fn config(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(phase: &'static str, after: Duration) -> Self {
        Self::Timeout { phase, after }
    }

    /// Timeouts, I/O failures and cancellation. Never retried automatically.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout { .. } | Self::Cancelled | Self::ConnectionClosed
        )
    }

    /// Protocol violations that escalated past the retry bound or ended the exchange.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::EstablishmentFailed(_) | Self::TooManyRetries { .. } | Self::PeerAborted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AstmError::timeout("establishment", Duration::from_secs(15));
        assert_eq!(err.to_string(), "timed out after 15s during establishment");

        let err = AstmError::TooManyRetries {
            attempts: 6,
            last_errors: FrameErrors::BAD_CHECKSUM,
        };
        assert!(err.to_string().contains("BAD_CHECKSUM"));
    }

    #[test]
    fn test_error_classification() {
        assert!(AstmError::Cancelled.is_transport());
        assert!(AstmError::PeerAborted.is_protocol());
        assert!(!AstmError::UnrecognizedFrameType(0x41).is_transport());
        assert!(!AstmError::config("x.toml", "missing").is_protocol());
    }
}
