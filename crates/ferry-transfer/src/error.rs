//! Error types for ferry-transfer.

use std::io;

use thiserror::Error;

/// A datagram (or a value about to become one) that does not fit the wire grammar.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid filename {0:?}")]
    InvalidFilename(String),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Outcome of a failed transfer step, on either side of the wire.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Server has no such file. Terminal, never retried.
    #[error("{0} not found on server")]
    NotFound(String),

    /// Server refused to serve the name at all (`ERR <name> INVALID`).
    #[error("server rejected filename {0}")]
    Rejected(String),

    /// No response within the whole backoff budget.
    #[error("no response after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error(transparent)]
    Malformed(#[from] ProtocolError),

    /// Well-formed, but not an answer to what was asked.
    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("byte range {start}-{end} outside file of {size} bytes")]
    OutOfRange { start: u64, end: u64, size: u64 },

    #[error("storage error: {0}")]
    Storage(#[source] io::Error),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("no free data port")]
    PortsExhausted,
}

/// An environment setting that does not parse.
#[derive(Debug, Error)]
#[error("{key} has invalid value {value:?}: {reason}")]
pub struct SettingError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl TransferError {
    /// True for failed attempts that a fresh request may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Timeout { .. }
                | TransferError::Malformed(_)
                | TransferError::Unexpected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
