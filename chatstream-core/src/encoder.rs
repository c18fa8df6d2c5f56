//! Server-side emission discipline.
//!
//! `IncrementEncoder` assigns sequence numbers and guarantees exactly one
//! terminal event; `pump` drives a generator through it and hands every
//! event to the transport as soon as it exists.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::generator::FragmentStream;
use crate::model::{StreamEvent, UpstreamError};

#[derive(Debug, Default)]
pub struct IncrementEncoder {
    next_seq: u64,
    finished: bool,
}

impl IncrementEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_seq
    }

    /// Non-terminal event for one fragment. `None` once the stream has ended.
    pub fn delta(&mut self, fragment: impl Into<String>) -> Option<StreamEvent> {
        self.emit(|seq| StreamEvent::delta(seq, fragment))
    }

    /// Terminal event for a normal end of generation; `fragment` may be empty.
    pub fn finish(&mut self, fragment: impl Into<String>) -> Option<StreamEvent> {
        self.emit(|seq| StreamEvent::last(seq, fragment))
    }

    /// Terminal event carrying the upstream failure.
    pub fn fail(&mut self, error: UpstreamError) -> Option<StreamEvent> {
        self.emit(|seq| StreamEvent::failed(seq, error))
    }

    fn emit(&mut self, make: impl FnOnce(u64) -> StreamEvent) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = make(self.next_seq);
        self.next_seq += 1;
        self.finished = event.terminal;
        Some(event)
    }
}

/// What `pump` hands to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Event(StreamEvent),
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Terminal event sent after a normal end of generation.
    Completed,
    /// Terminal error event sent after a generator failure.
    Failed,
    /// Stopped by the cancellation token; no terminal event sent.
    Cancelled,
    /// The receiving side went away; no terminal event delivered.
    Disconnected,
}

impl PumpOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub outcome: PumpOutcome,
    pub events: u64,
}

/// Drive `fragments` into `sink` until a terminal event, cancellation, or
/// disconnect. Fires `cancel` on disconnect so the generator can stop too.
pub async fn pump(
    mut fragments: FragmentStream,
    sink: mpsc::Sender<Emission>,
    cancel: CancellationToken,
    keepalive: Option<Duration>,
) -> PumpReport {
    let mut encoder = IncrementEncoder::new();
    let mut ticker = keepalive.filter(|d| !d.is_zero()).map(|every| {
        let mut t = tokio::time::interval_at(Instant::now() + every, every);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    let report = |encoder: &IncrementEncoder, outcome| PumpReport {
        outcome,
        events: encoder.emitted(),
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(events = encoder.emitted(), "pump cancelled");
                return report(&encoder, PumpOutcome::Cancelled);
            }
            _ = sink.closed() => {
                debug!(events = encoder.emitted(), "receiver dropped, stopping generation");
                cancel.cancel();
                return report(&encoder, PumpOutcome::Disconnected);
            }
            _ = tick(&mut ticker) => {
                if sink.send(Emission::KeepAlive).await.is_err() {
                    cancel.cancel();
                    return report(&encoder, PumpOutcome::Disconnected);
                }
                continue;
            }
            item = fragments.next() => item,
        };

        let event = match next {
            Some(Ok(fragment)) => encoder.delta(fragment),
            Some(Err(err)) => {
                warn!(code = %err.code, message = %err.message, "generator failed mid-stream");
                encoder.fail(err)
            }
            None => encoder.finish(""),
        };
        let Some(event) = event else {
            // the encoder never yields after its terminal event, and we return on it
            return report(&encoder, PumpOutcome::Completed);
        };

        let terminal = event.terminal;
        let failed = event.is_error();
        if sink.send(Emission::Event(event)).await.is_err() {
            cancel.cancel();
            return report(&encoder, PumpOutcome::Disconnected);
        }
        if let Some(t) = ticker.as_mut() {
            t.reset();
        }
        if terminal {
            let outcome = if failed {
                PumpOutcome::Failed
            } else {
                PumpOutcome::Completed
            };
            return report(&encoder, outcome);
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}
