use std::time::Duration;

use thiserror::Error;

use crate::model::UpstreamError;

/// Why a single stream stopped short of `Completed`.
///
/// Unlike [`ChatStreamError`] this is `Clone` + `PartialEq`: the reassembler
/// keeps a copy as the recorded cause while the same value is handed to the
/// caller that observed the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("frame decode error: {0}")]
    FrameDecode(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport severed: {0}")]
    TransportSevered(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream error: {0}")]
    Upstream(UpstreamError),

    #[error("stream cancelled")]
    Cancelled,
}

impl StreamError {
    /// Short stable label used for telemetry and span fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FrameDecode(_) => "frame_decode",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::TransportSevered(_) => "transport_severed",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Core error type for chatstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatStreamError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("http error: {code} {message}")]
    Http { code: u16, message: String },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, ChatStreamError>;
