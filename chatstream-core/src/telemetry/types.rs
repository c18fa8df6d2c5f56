use serde::{Deserialize, Serialize};

/// Which half of the protocol finalized the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Client,
    Server,
}

/// Summary of one finished stream, emitted once per stream and side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamTrace {
    pub side: Side,

    /// Caller-supplied correlation id, if any.
    pub request_id: Option<String>,

    /// Model identifier from the request.
    pub model: Option<String>,

    /// Final status as a normalized string ("completed", "failed", ...).
    pub status: Option<String>,

    /// Events applied (client) or emitted (server).
    pub events: u64,

    /// Length in bytes of the reassembled content (client only).
    pub content_len: Option<usize>,

    pub latency_ms: Option<u64>,

    /// Optional error metadata, if applicable.
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl StreamTrace {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            ..Default::default()
        }
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn request_id_opt(mut self, rid: Option<&str>) -> Self {
        self.request_id = rid.map(|s| s.to_string());
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn events(mut self, n: u64) -> Self {
        self.events = n;
        self
    }

    pub fn content_len(mut self, len: usize) -> Self {
        self.content_len = Some(len);
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn error(mut self, err: Option<&crate::error::StreamError>) -> Self {
        self.error_kind = err.map(|e| e.kind().to_string());
        self.error_message = err.map(|e| e.to_string());
        self
    }
}
