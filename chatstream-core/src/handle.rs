//! One in-flight stream on the client side: transport, reassembly state,
//! deadlines and cancellation in a single owner.

use std::future::Future;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{field, info, info_span, Span};

use crate::config::StreamCfg;
use crate::decoder::{ByteStream, EventStream};
use crate::error::StreamError;
use crate::model::{CompletionRequest, StreamEvent, StreamStatus};
use crate::reassembly::{Completion, Reassembler, Transition};
use crate::telemetry::{self, Side, StreamTrace};

/// One successfully applied increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    pub sequence: u64,
    pub delta: String,
    pub terminal: bool,
}

/// Cloneable trigger that cancels a [`StreamHandle`] from any task.
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

enum Wake {
    Cancelled,
    TimedOut(Duration),
    Item(Option<Result<StreamEvent, StreamError>>),
}

enum Step {
    Update(StreamUpdate),
    Failed(StreamError),
    Nothing,
}

pub struct StreamHandle {
    events: Option<EventStream>,
    state: Reassembler,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
    model: String,
    request_id: Option<String>,
    span: Span,
    started: Instant,
    finalized: bool,
}

impl StreamHandle {
    /// Wrap the response body of a streamed completion.
    pub fn open(bytes: ByteStream, cfg: &StreamCfg, req: &CompletionRequest) -> Self {
        let span = info_span!(
            "chat_stream",
            model = %req.model,
            request_id = req.request_id.as_deref().unwrap_or(""),
            status = field::Empty,
            events = field::Empty,
        );
        span.in_scope(|| tracing::debug!("stream opened"));
        Self {
            events: Some(EventStream::new(bytes, cfg.max_frame_bytes)),
            state: Reassembler::new(),
            cancel: CancellationToken::new(),
            idle_timeout: cfg.idle_timeout(),
            model: req.model.clone(),
            request_id: req.request_id.clone(),
            span,
            started: Instant::now(),
            finalized: false,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Current status. A cancellation requested through a [`CancelHandle`]
    /// is reported immediately, before the next poll applies it.
    pub fn status(&self) -> StreamStatus {
        let status = self.state.status();
        if status == StreamStatus::InProgress && self.cancel.is_cancelled() {
            StreamStatus::Cancelled
        } else {
            status
        }
    }

    /// Accumulated content so far.
    pub fn content(&self) -> &str {
        self.state.content()
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.state.error()
    }

    /// Abandon the stream. Returns false if it had already reached a terminal status.
    pub fn cancel(&mut self) -> bool {
        if !self.state.cancel() {
            return false;
        }
        self.cancel.cancel();
        self.release();
        true
    }

    /// Next increment, waiting at most the configured idle timeout.
    pub async fn next(&mut self) -> Option<Result<StreamUpdate, StreamError>> {
        self.next_capped(None).await
    }

    /// Like [`next`](Self::next), but never waits past `overall` either.
    pub async fn next_capped(
        &mut self,
        overall: Option<Instant>,
    ) -> Option<Result<StreamUpdate, StreamError>> {
        let idle = self.idle_timeout.map(|d| Instant::now() + d);
        let deadline = match (idle, overall) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.next_until(deadline).await
    }

    /// Next increment, or `None` once the stream is terminal.
    ///
    /// Failures (including cancellation and deadline expiry) are yielded once
    /// as `Err`; afterwards the stream is frozen and this returns `None`.
    pub async fn next_until(
        &mut self,
        deadline: Option<Instant>,
    ) -> Option<Result<StreamUpdate, StreamError>> {
        if self.state.status().is_terminal() {
            return None;
        }
        if self.cancel.is_cancelled() {
            return Some(Err(self.observe_cancel()));
        }
        let events = self.events.as_mut()?;

        let waited = Instant::now();
        let wake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            item = with_deadline(deadline, events.next()) => match item {
                Some(item) => Wake::Item(item),
                None => Wake::TimedOut(waited.elapsed()),
            },
        };

        let step = match wake {
            Wake::Cancelled => return Some(Err(self.observe_cancel())),
            Wake::TimedOut(after) => {
                // same cleanup as cancellation, but recorded as a failure
                self.cancel.cancel();
                Step::Failed(StreamError::Timeout(after))
            }
            Wake::Item(None) => Step::Failed(StreamError::TransportSevered(
                "event stream ended before terminal event".into(),
            )),
            Wake::Item(Some(Err(e))) => Step::Failed(e),
            Wake::Item(Some(Ok(event))) => {
                let sequence = event.seq;
                match self.state.apply(event) {
                    Transition::Appended { delta, .. } => Step::Update(StreamUpdate {
                        sequence,
                        delta: delta.to_string(),
                        terminal: false,
                    }),
                    Transition::Completed { delta, .. } => Step::Update(StreamUpdate {
                        sequence,
                        delta: delta.to_string(),
                        terminal: true,
                    }),
                    Transition::Failed { error, .. } => Step::Failed(error.clone()),
                    Transition::Ignored => Step::Nothing,
                }
            }
        };

        let out = match step {
            Step::Update(update) => Some(Ok(update)),
            Step::Failed(err) => {
                self.state.fail(err.clone());
                Some(Err(err))
            }
            Step::Nothing => None,
        };
        if self.state.status().is_terminal() {
            self.release();
        }
        out
    }

    /// Drive the stream to a terminal status and return the assembled message.
    pub async fn collect(mut self) -> Completion {
        while self.next().await.is_some() {}
        self.into_completion()
    }

    /// Snapshot of the outcome; `status` is still in progress if called early.
    pub fn into_completion(mut self) -> Completion {
        std::mem::take(&mut self.state).finish()
    }

    fn observe_cancel(&mut self) -> StreamError {
        self.state.cancel();
        self.release();
        StreamError::Cancelled
    }

    /// Drop the transport and report the outcome once.
    fn release(&mut self) {
        self.events = None;
        if self.finalized || !self.state.status().is_terminal() {
            return;
        }
        self.finalized = true;

        let status = self.state.status();
        let events = self.state.events_applied();
        self.span.record("status", status.as_str());
        self.span.record("events", events);
        self.span.in_scope(|| {
            info!(
                status = status.as_str(),
                events,
                len = self.state.content().len(),
                error = ?self.state.error(),
                "stream finished"
            )
        });
        telemetry::emit(
            StreamTrace::new(Side::Client)
                .model(&self.model)
                .request_id_opt(self.request_id.as_deref())
                .status(status.as_str())
                .events(events)
                .content_len(self.state.content().len())
                .latency_ms(self.started.elapsed().as_millis() as u64)
                .error(self.state.error()),
        );
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        // releases the server side as well when both live in one process
        self.cancel.cancel();
    }
}

async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}
