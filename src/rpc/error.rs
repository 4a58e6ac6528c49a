use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The address or executable is not an existing absolute path. Raised
    /// before any transport is opened.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("child process {0} is not available")]
    MissingStdio(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The payload cannot be described by a `u32` frame length. Nothing is
    /// written.
    #[error("payload of {0} bytes does not fit in one frame")]
    PayloadTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("proxy closed")]
    ProxyClosed,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,
}

pub type Result<T, E = RpcError> = std::result::Result<T, E>;
