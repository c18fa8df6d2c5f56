use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::decoder::ByteStream;
use crate::error::CoreResult;
use crate::framer::encode_frame;
use crate::generator::{FragmentStream, Generator};
use crate::model::{CompletionRequest, StreamEvent, UpstreamError};

/// Concatenated wire bytes for `events`.
pub fn frames(events: &[StreamEvent]) -> Vec<u8> {
    events
        .iter()
        .flat_map(|e| encode_frame(e).unwrap().to_vec())
        .collect()
}

/// Deliver `wire` in chunks of `size` bytes.
pub fn chunked_bytes(wire: Vec<u8>, size: usize) -> ByteStream {
    let chunks: Vec<_> = wire
        .chunks(size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(chunks).boxed()
}

/// Fixed fragments, optionally followed by a failure.
pub fn scripted(fragments: &[&str], fail: Option<UpstreamError>) -> FragmentStream {
    let mut items: Vec<Result<String, UpstreamError>> =
        fragments.iter().map(|f| Ok(f.to_string())).collect();
    if let Some(err) = fail {
        items.push(Err(err));
    }
    futures::stream::iter(items).boxed()
}

/// Generator that replays a script regardless of the request.
pub struct ScriptedGenerator {
    pub fragments: Vec<String>,
    pub fail: Option<UpstreamError>,
    /// When set, the stream never ends after the script; it waits for cancellation.
    pub hang: bool,
}

impl ScriptedGenerator {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            fail: None,
            hang: false,
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _req: &CompletionRequest,
        cancel: CancellationToken,
    ) -> CoreResult<FragmentStream> {
        let refs: Vec<&str> = self.fragments.iter().map(String::as_str).collect();
        let head = scripted(&refs, self.fail.clone());
        if !self.hang {
            return Ok(head);
        }
        let tail = futures::stream::pending::<Result<String, UpstreamError>>()
            .take_until(cancel.cancelled_owned());
        Ok(head.chain(tail).boxed())
    }
}
