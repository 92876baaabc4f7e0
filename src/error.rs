//! Error types for stream servers, clients and pipes.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Transient failure raised by the RPC layer itself. Safe to retry.
    #[error("communication failure: {0}")]
    Communication(String),

    /// The local resource behind a stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A client presented a sequence id lower than the last one seen.
    #[error("sequence id {id} is behind last seen id {last}")]
    InvalidSequence { id: u32, last: u32 },

    /// The stream was intentionally killed via `abort()`.
    #[error("stream aborted")]
    Aborted,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("stream is closed or aborted")]
    ClosedOrAborted,

    /// Object encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StreamError {
    /// Only failures of the transport itself are worth another attempt. Every
    /// other error reflects a real outcome on the server side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Communication(_))
    }

    pub fn communication(message: impl Into<String>) -> Self {
        StreamError::Communication(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        StreamError::Unsupported(message.into())
    }

    /// Short stable name used when an error crosses the wire.
    pub(crate) fn class(&self) -> ErrorClass {
        match self {
            StreamError::Communication(_) => ErrorClass::Communication,
            StreamError::Io(_) => ErrorClass::Io,
            StreamError::InvalidSequence { .. } => ErrorClass::InvalidSequence,
            StreamError::Aborted => ErrorClass::Aborted,
            StreamError::Unsupported(_) => ErrorClass::Unsupported,
            StreamError::ClosedOrAborted => ErrorClass::ClosedOrAborted,
            StreamError::Codec(_) => ErrorClass::Codec,
            StreamError::Config(_) => ErrorClass::Config,
        }
    }
}

/// Wire tag for each error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ErrorClass {
    Communication = 1,
    Io = 2,
    InvalidSequence = 3,
    Aborted = 4,
    Unsupported = 5,
    ClosedOrAborted = 6,
    Codec = 7,
    Config = 8,
}

impl ErrorClass {
    pub(crate) fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Communication),
            2 => Some(Self::Io),
            3 => Some(Self::InvalidSequence),
            4 => Some(Self::Aborted),
            5 => Some(Self::Unsupported),
            6 => Some(Self::ClosedOrAborted),
            7 => Some(Self::Codec),
            8 => Some(Self::Config),
            _ => None,
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            StreamError::Aborted => io::Error::new(io::ErrorKind::ConnectionAborted, err),
            StreamError::InvalidSequence { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            StreamError::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, err),
            StreamError::ClosedOrAborted => io::Error::new(io::ErrorKind::BrokenPipe, err),
            StreamError::Communication(_) => io::Error::new(io::ErrorKind::NotConnected, err),
            StreamError::Codec(_) | StreamError::Config(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
        }
    }
}

/// Recover a `StreamError` that was previously folded into an `io::Error`.
pub(crate) fn from_io(err: io::Error) -> StreamError {
    if err.get_ref().map_or(false, |inner| inner.is::<StreamError>()) {
        match err.into_inner() {
            Some(inner) => match inner.downcast::<StreamError>() {
                Ok(stream_err) => *stream_err,
                Err(other) => StreamError::Io(io::Error::new(io::ErrorKind::Other, other)),
            },
            None => StreamError::Io(io::Error::new(io::ErrorKind::Other, "unknown")),
        }
    } else {
        StreamError::Io(err)
    }
}
