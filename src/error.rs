//! Error types used throughout the crate.
//!
//! All fallible operations return [`Result`]. Protocol violations and codec
//! parse failures carry a description of the offending input; flow-control
//! conditions (`EndOfStream`, `Canceled`) are distinct variants so callers
//! can tell a clean shutdown from a failure.

use std::time::Duration;
use thiserror::Error;

/// Application error code: a stream with the same name is already running.
pub const CODE_DUPLICATE_STREAM: i32 = 1001;
/// Application error code: the named stream does not exist.
pub const CODE_STREAM_NOT_EXIST: i32 = 1002;
/// Application error code: the given URL could not be connected or parsed.
pub const CODE_CONNECT_URL: i32 = 2001;
/// Application error code: unclassified failure.
pub const CODE_UNKNOWN: i32 = 9999;

/// Primary error type for the streamer library.
#[derive(Error, Debug)]
pub enum StreamerError {
    /// I/O errors from sockets and files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec-level parse failures (SPS/PPS/ADTS fields out of range).
    #[error("codec error: {0}")]
    Codec(String),

    /// Container-level parse failures (FLV tags, TS sections, AMF0).
    #[error("parser error: {0}")]
    Parser(String),

    /// Streaming-protocol violations (RTMP chunking, handshake, commands).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed or unexpected input data.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A read or write did not complete within the connection deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The source is drained or the queue was closed; a clean end, not a
    /// failure.
    #[error("end of stream")]
    EndOfStream,

    /// The enclosing context was canceled.
    #[error("canceled")]
    Canceled,

    /// Typed application error surfaced by the manager/control layer.
    #[error("{msg} (code {code})")]
    App {
        /// One of the `CODE_*` constants.
        code: i32,
        /// Human-readable description.
        msg: String,
    },
}

impl StreamerError {
    /// Builds a typed application error.
    pub fn app(code: i32, msg: impl Into<String>) -> Self {
        StreamerError::App {
            code,
            msg: msg.into(),
        }
    }

    /// A `CODE_DUPLICATE_STREAM` error.
    pub fn duplicate_stream(name: impl Into<String>) -> Self {
        Self::app(CODE_DUPLICATE_STREAM, format!("duplicate stream: {}", name.into()))
    }

    /// A `CODE_STREAM_NOT_EXIST` error.
    pub fn stream_not_exist(name: impl Into<String>) -> Self {
        Self::app(CODE_STREAM_NOT_EXIST, format!("stream not exist: {}", name.into()))
    }

    /// A `CODE_CONNECT_URL` error.
    pub fn connect_url(url: impl Into<String>) -> Self {
        Self::app(CODE_CONNECT_URL, format!("connect url error: {}", url.into()))
    }

    /// The application code attached to this error, `CODE_UNKNOWN` for
    /// untyped errors and 0 for flow-control variants.
    pub fn code(&self) -> i32 {
        match self {
            StreamerError::App { code, .. } => *code,
            StreamerError::EndOfStream | StreamerError::Canceled => 0,
            _ => CODE_UNKNOWN,
        }
    }

    /// True when this error means the peer or queue ended cleanly.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, StreamerError::EndOfStream)
    }
}

/// Specialized `Result` for streamer operations.
pub type Result<T> = std::result::Result<T, StreamerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_codes() {
        assert_eq!(StreamerError::duplicate_stream("a").code(), CODE_DUPLICATE_STREAM);
        assert_eq!(StreamerError::stream_not_exist("a").code(), CODE_STREAM_NOT_EXIST);
        assert_eq!(StreamerError::connect_url("u").code(), CODE_CONNECT_URL);
        assert_eq!(StreamerError::Codec("x".into()).code(), CODE_UNKNOWN);
        assert_eq!(StreamerError::EndOfStream.code(), 0);
    }

    #[test]
    fn end_of_stream_is_distinct() {
        assert!(StreamerError::EndOfStream.is_end_of_stream());
        assert!(!StreamerError::Canceled.is_end_of_stream());
        assert!(!StreamerError::Protocol("x".into()).is_end_of_stream());
    }
}
