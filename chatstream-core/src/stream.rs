//! Streaming primitives shared by the server and client halves.
//!
//! Contract:
//! - A stream is a sequence of `StreamEvent`s with indices `0, 1, 2, ...`.
//! - Exactly one event carries `terminal = true`, and it is the last one.
//! - An event with `error` set is always terminal; its delta is empty.

use serde::{Deserialize, Serialize};

/// Failure reported by the producing side mid-generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamError {
    pub code: String,
    pub message: String,
}

impl UpstreamError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// The unit of transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub seq: u64,
    #[serde(default)]
    pub delta: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UpstreamError>,
}

impl StreamEvent {
    pub fn delta(seq: u64, delta: impl Into<String>) -> Self {
        Self {
            seq,
            delta: delta.into(),
            terminal: false,
            error: None,
        }
    }

    pub fn last(seq: u64, delta: impl Into<String>) -> Self {
        Self {
            seq,
            delta: delta.into(),
            terminal: true,
            error: None,
        }
    }

    pub fn failed(seq: u64, error: UpstreamError) -> Self {
        Self {
            seq,
            delta: String::new(),
            terminal: true,
            error: Some(error),
        }
    }

    /// Returns true if no event may follow this one.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Lifecycle of one stream. Only `InProgress` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}
