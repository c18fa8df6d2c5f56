//! Server-Sent-Events framing for `StreamEvent`s.
//!
//! One frame is `data: <json>\n\n`. The JSON serializer escapes control
//! characters, so the blank-line delimiter can never appear inside a payload.

use bytes::Bytes;

use crate::error::{ChatStreamError, CoreResult};
use crate::model::StreamEvent;

pub const CONTENT_TYPE: &str = "text/event-stream";
pub const DATA_PREFIX: &str = "data:";

/// Serialize one event into a self-delimited frame.
pub fn encode_frame(event: &StreamEvent) -> CoreResult<Bytes> {
    let json = serde_json::to_string(event).map_err(|e| ChatStreamError::Other(e.into()))?;
    let mut out = String::with_capacity(json.len() + 8);
    out.push_str(DATA_PREFIX);
    out.push(' ');
    out.push_str(&json);
    out.push_str("\n\n");
    Ok(Bytes::from(out))
}

/// Comment frame used to keep idle connections warm. Decoders skip it.
pub fn keepalive_frame() -> Bytes {
    Bytes::from_static(b": ping\n\n")
}
