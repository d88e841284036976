//! Engine error type.
//!
//! Every failure the engine reports belongs to a closed set of kinds
//! (see [`ErrorKind`]). Transport failures are folded into the same set so
//! callers only ever match on one enum.

use std::fmt;

use thiserror::Error;

use crate::transport::TransportError;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InitFailed,
    DeviceNotFound,
    OpenFailed,
    TransferFailed,
    Timeout,
    TransferTimeout,
    InvalidParameter,
    MemoryAllocation,
    FileIo,
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InitFailed => "initialization failed",
            ErrorKind::DeviceNotFound => "device not found",
            ErrorKind::OpenFailed => "failed to open device",
            ErrorKind::TransferFailed => "transfer failed",
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::TransferTimeout => "transfer timed out",
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::MemoryAllocation => "memory allocation failed",
            ErrorKind::FileIo => "file I/O error",
            ErrorKind::Protocol => "protocol error",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum ClonerError {
    #[error("USB initialization failed: {0}")]
    InitFailed(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Data phase gave up after exhausting retries.
    #[error(
        "Transfer timed out at 0x{address:08X} after {completed}/{total} bytes ({attempts} attempts)"
    )]
    TransferTimeout {
        address: u32,
        completed: u64,
        total: u64,
        attempts: u32,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Failed to allocate {0} bytes")]
    MemoryAllocation(usize),

    #[error("File I/O error: {0}")]
    FileIo(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ClonerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClonerError::InitFailed(_) => ErrorKind::InitFailed,
            ClonerError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            ClonerError::OpenFailed(_) => ErrorKind::OpenFailed,
            ClonerError::TransferFailed(_) => ErrorKind::TransferFailed,
            ClonerError::Timeout { .. } => ErrorKind::Timeout,
            ClonerError::TransferTimeout { .. } => ErrorKind::TransferTimeout,
            ClonerError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            ClonerError::MemoryAllocation(_) => ErrorKind::MemoryAllocation,
            ClonerError::FileIo(_) => ErrorKind::FileIo,
            ClonerError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether the sequencer may retry the step that produced this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

impl From<TransportError> for ClonerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InitFailed(msg) => ClonerError::InitFailed(msg),
            TransportError::DeviceNotFound { bus, address } => {
                ClonerError::DeviceNotFound(format!("bus {bus} address {address}"))
            }
            TransportError::OpenFailed(msg) => ClonerError::OpenFailed(msg),
            e @ TransportError::ClaimInterfaceFailed { .. } => {
                ClonerError::OpenFailed(e.to_string())
            }
            e @ TransportError::EndpointNotFound { .. } => ClonerError::OpenFailed(e.to_string()),
            TransportError::Timeout { timeout_ms } => ClonerError::Timeout { timeout_ms },
            e @ (TransportError::WriteFailed(_)
            | TransportError::ReadFailed(_)
            | TransportError::Stall
            | TransportError::Disconnected
            | TransportError::Closed) => ClonerError::TransferFailed(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClonerError>;
