use std::time::Duration;

use thiserror::Error;

/// Why a remote file operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileErrorKind {
    NotFound,
    Unknown,
}

impl std::fmt::Display for FileErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileErrorKind::NotFound => write!(f, "file not found"),
            FileErrorKind::Unknown => write!(f, "unknown failure"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Pending receive was superseded by a newer request")]
    Cancelled,

    #[error("File transfer failed for {path}: {kind}")]
    FileTransfer {
        path: String,
        kind: FileErrorKind,
        detail: String,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Target not found or not responding: {0}")]
    NotResponding(String),

    #[error("Data integrity failure: {0}")]
    Integrity(String),

    #[error("Target rejected the operation at {address:#010x} (code {code})")]
    Rejected { address: u32, code: i32 },

    #[error("Firmware error: {0}")]
    FirmwareError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Board is busy: {0}")]
    Busy(String),

    #[error("Board is not connected")]
    NotConnected,

    #[error("{0} does not support this operation")]
    Unsupported(&'static str),
}

impl BoardError {
    /// Timeouts are advisory: polling callers may retry or treat them as "no news".
    pub fn is_timeout(&self) -> bool {
        matches!(self, BoardError::Timeout(_))
    }

    pub(crate) fn file(path: &str, kind: FileErrorKind, detail: impl Into<String>) -> Self {
        BoardError::FileTransfer {
            path: path.to_owned(),
            kind,
            detail: detail.into(),
        }
    }
}

pub type BoardResult<T> = std::result::Result<T, BoardError>;
