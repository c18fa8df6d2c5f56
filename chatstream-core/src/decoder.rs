//! Client-side decoding of a framed event stream.
//!
//! `FrameDecoder` is sans-IO: feed it bytes in whatever chunks the transport
//! delivers and pull validated events out. `EventStream` wraps it around an
//! async byte stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::Stream;

use crate::error::StreamError;
use crate::model::StreamEvent;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already searched for a delimiter.
    scanned: usize,
    max_frame_bytes: usize,
    last_seq: Option<u64>,
    saw_terminal: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_frame_bytes,
            last_seq: None,
            saw_terminal: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn saw_terminal(&self) -> bool {
        self.saw_terminal
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Next complete event, `Ok(None)` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, StreamError> {
        loop {
            // a delimiter may straddle the old end by up to two bytes
            let from = self.scanned.saturating_sub(2);
            let Some((end, delim_len)) = find_delimiter(&self.buf, from) else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_frame_bytes {
                    return Err(StreamError::FrameDecode(format!(
                        "frame exceeds {} bytes without delimiter",
                        self.max_frame_bytes
                    )));
                }
                return Ok(None);
            };
            let frame = self.buf.split_to(end).freeze();
            self.buf.advance(delim_len);
            self.scanned = 0;

            if let Some(event) = parse_frame(&frame)? {
                self.validate(&event)?;
                return Ok(Some(event));
            }
        }
    }

    /// Called once the transport reports end of body.
    pub fn finish(&self) -> Result<(), StreamError> {
        if self.saw_terminal {
            return Ok(());
        }
        let tail = if self.buf.is_empty() {
            String::new()
        } else {
            format!(" ({} bytes of partial frame buffered)", self.buf.len())
        };
        Err(StreamError::TransportSevered(format!(
            "channel closed before terminal event{tail}"
        )))
    }

    fn validate(&mut self, event: &StreamEvent) -> Result<(), StreamError> {
        if self.saw_terminal {
            return Err(StreamError::ProtocolViolation(format!(
                "event {} received after terminal event",
                event.seq
            )));
        }
        let expected = self.last_seq.map_or(0, |s| s + 1);
        if event.seq != expected {
            return Err(StreamError::ProtocolViolation(format!(
                "expected sequence {expected}, got {}",
                event.seq
            )));
        }
        if event.error.is_some() && !event.terminal {
            return Err(StreamError::ProtocolViolation(format!(
                "error event {} is not flagged terminal",
                event.seq
            )));
        }
        self.last_seq = Some(event.seq);
        self.saw_terminal = event.terminal;
        Ok(())
    }
}

/// Position and length of the first blank-line delimiter at or after `from`.
fn find_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1] == b'\n' {
                return Some((i, 2));
            }
            if buf[i + 1] == b'\r' && buf.get(i + 2) == Some(&b'\n') {
                return Some((i, 3));
            }
        }
        i += 1;
    }
    None
}

/// Parse one frame body. Frames without `data:` lines carry no event.
fn parse_frame(frame: &Bytes) -> Result<Option<StreamEvent>, StreamError> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| StreamError::FrameDecode(format!("invalid utf-8: {e}")))?;

    let mut data: Option<String> = None;
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        // a line without a colon is a field name with an empty value
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => match data.as_mut() {
                Some(d) => {
                    d.push('\n');
                    d.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            "event" | "id" | "retry" => {}
            _ => return Err(StreamError::FrameDecode(format!("unknown field '{field}'"))),
        }
    }

    match data {
        None => Ok(None),
        Some(payload) => serde_json::from_str::<StreamEvent>(&payload)
            .map(Some)
            .map_err(|e| StreamError::FrameDecode(format!("bad event payload: {e}"))),
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// Lazy stream of validated events over a byte stream.
///
/// Ends right after the terminal event, after the first error, or with
/// `TransportSevered` when the bytes run out before a terminal event.
pub struct EventStream {
    inner: ByteStream,
    decoder: FrameDecoder,
    done: bool,
}

impl EventStream {
    pub fn new(inner: ByteStream, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_bytes),
            done: false,
        }
    }
}

impl Stream for EventStream {
    type Item = Result<StreamEvent, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            match self.decoder.next_event() {
                Ok(Some(event)) => {
                    if event.terminal {
                        self.done = true;
                    }
                    return Poll::Ready(Some(Ok(event)));
                }
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.decoder.push(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return match self.decoder.finish() {
                        Ok(()) => Poll::Ready(None),
                        Err(e) => Poll::Ready(Some(Err(e))),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
