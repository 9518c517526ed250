//! Controller-facing error type.

use std::time::Duration;

use crate::protocol::{ChannelError, DecodeError};
use crate::runtime::RuntimeError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Execution context not ready (state: {0})")]
    NotReady(&'static str),

    #[error("Execution context busy: {pending} already in progress")]
    Busy { pending: &'static str },

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: &'static str, after: Duration },

    /// `error` message sent by the execution context in reply to a request.
    #[error("{0}")]
    Executor(String),

    #[error("{0}")]
    Filesystem(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid init options: {0}")]
    InvalidOptions(String),

    #[error("No input request is pending")]
    NoPendingInput,

    #[error("Execution context destroyed")]
    Destroyed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Unexpected reply: {0}")]
    Protocol(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<ChannelError> for Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => Error::ChannelClosed,
            ChannelError::Encode(e) => Error::Protocol(e.to_string()),
        }
    }
}

impl Error {
    /// Whether the execution context is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Initialization(_) | Error::Destroyed | Error::ChannelClosed | Error::Runtime(_)
        )
    }
}
