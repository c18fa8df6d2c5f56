use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::CoreResult;
use crate::model::{CompletionRequest, Role, UpstreamError};

/// Fragments produced by a generation engine, in order.
pub type FragmentStream = BoxStream<'static, Result<String, UpstreamError>>;

/// The generation engine behind the service.
///
/// Implementations should stop producing once `cancel` fires; the encoder
/// also stops polling, so honouring it only saves work.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(
        &self,
        req: &CompletionRequest,
        cancel: CancellationToken,
    ) -> CoreResult<FragmentStream>;
}

/// Placeholder engine: streams the last user message back word by word.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator {
    delay: Duration,
}

impl EchoGenerator {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(
        &self,
        req: &CompletionRequest,
        cancel: CancellationToken,
    ) -> CoreResult<FragmentStream> {
        let text = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_text())
            .unwrap_or_default();
        let limit = req.params.max_output_tokens.map_or(usize::MAX, |n| n as usize);
        let words: Vec<String> = text
            .split_inclusive(char::is_whitespace)
            .take(limit)
            .map(str::to_string)
            .collect();

        let delay = self.delay;
        let fragments = stream::iter(words)
            .then(move |w| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, UpstreamError>(w)
            })
            .take_until(cancel.cancelled_owned());
        Ok(fragments.boxed())
    }
}
