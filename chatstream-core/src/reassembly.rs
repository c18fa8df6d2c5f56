//! Folds an ordered event sequence into one assistant message.
//!
//! ```text
//! in_progress ──terminal──────────▶ completed
//!      │ ──error / bad seq / fail()─▶ failed
//!      └──cancel()─────────────────▶ cancelled
//! ```
//! Terminal states are frozen: later events are ignored.

use tracing::{debug, warn};

use crate::error::StreamError;
use crate::model::{Message, StreamEvent, StreamStatus};

/// Outcome of feeding one event (or an external signal) to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Transition<'a> {
    /// Delta appended, stream still running.
    Appended { delta: &'a str, content: &'a str },
    /// Terminal delta appended, stream completed.
    Completed { delta: &'a str, content: &'a str },
    /// Stream failed; `content` is the partial text kept so far.
    Failed {
        error: &'a StreamError,
        content: &'a str,
    },
    /// The stream was already terminal; nothing changed.
    Ignored,
}

/// Final outcome handed to the caller once the stream is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub message: Message,
    pub status: StreamStatus,
    pub error: Option<StreamError>,
    /// True unless the stream completed normally.
    pub partial: bool,
}

impl Completion {
    pub fn text(&self) -> String {
        self.message.content.as_text()
    }

    pub fn is_completed(&self) -> bool {
        self.status == StreamStatus::Completed
    }
}

#[derive(Debug)]
pub struct Reassembler {
    content: String,
    last_seq: Option<u64>,
    status: StreamStatus,
    error: Option<StreamError>,
    events: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            content: String::new(),
            last_seq: None,
            status: StreamStatus::InProgress,
            error: None,
            events: 0,
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    /// Number of events successfully applied.
    pub fn events_applied(&self) -> u64 {
        self.events
    }

    pub fn apply(&mut self, event: StreamEvent) -> Transition<'_> {
        if self.status.is_terminal() {
            debug!(seq = event.seq, status = self.status.as_str(), "dropping event on frozen stream");
            return Transition::Ignored;
        }

        let expected = self.last_seq.map_or(0, |s| s + 1);
        if event.seq != expected {
            let reason = if let Some(last) = self.last_seq.filter(|last| event.seq <= *last) {
                format!("duplicate or regressed sequence {} (last applied {last})", event.seq)
            } else {
                format!("gap in sequence: expected {expected}, got {}", event.seq)
            };
            warn!(%reason, "protocol violation");
            return self.fail(StreamError::ProtocolViolation(reason));
        }

        if let Some(err) = event.error {
            self.last_seq = Some(event.seq);
            self.events += 1;
            return self.fail(StreamError::Upstream(err));
        }

        self.last_seq = Some(event.seq);
        self.events += 1;
        let start = self.content.len();
        self.content.push_str(&event.delta);

        if event.terminal {
            self.status = StreamStatus::Completed;
            debug!(events = self.events, len = self.content.len(), "stream completed");
            Transition::Completed {
                delta: &self.content[start..],
                content: &self.content,
            }
        } else {
            Transition::Appended {
                delta: &self.content[start..],
                content: &self.content,
            }
        }
    }

    /// Fail the stream with an externally detected cause.
    pub fn fail(&mut self, error: StreamError) -> Transition<'_> {
        if self.status.is_terminal() {
            return Transition::Ignored;
        }
        debug!(kind = error.kind(), "stream failed");
        self.status = StreamStatus::Failed;
        let error = self.error.insert(error);
        Transition::Failed {
            error,
            content: &self.content,
        }
    }

    /// Returns false when the stream was already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = StreamStatus::Cancelled;
        self.error = Some(StreamError::Cancelled);
        true
    }

    pub fn finish(self) -> Completion {
        Completion {
            message: Message::assistant(self.content),
            partial: self.status != StreamStatus::Completed,
            status: self.status,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpstreamError;

    fn run(events: Vec<StreamEvent>) -> Reassembler {
        let mut r = Reassembler::new();
        for ev in events {
            r.apply(ev);
        }
        r
    }

    #[test]
    fn hello_example_completes() {
        let r = run(vec![StreamEvent::delta(0, "Hel"), StreamEvent::last(1, "lo!")]);
        assert_eq!(r.status(), StreamStatus::Completed);
        let done = r.finish();
        assert_eq!(done.text(), "Hello!");
        assert!(!done.partial);
        assert_eq!(done.error, None);
    }

    #[test]
    fn gap_example_fails_with_partial_content() {
        let r = run(vec![StreamEvent::delta(0, "A"), StreamEvent::delta(2, "B")]);
        assert_eq!(r.status(), StreamStatus::Failed);
        assert!(matches!(r.error(), Some(StreamError::ProtocolViolation(_))));
        assert_eq!(r.content(), "A");
        assert!(r.finish().partial);
    }

    #[test]
    fn content_is_concatenation_for_many_shapes() {
        let shapes: Vec<Vec<&str>> = vec![
            vec![""],
            vec!["only"],
            vec!["a", "", "b", "c"],
            vec!["multi\nline ", "ünïcödé ", "🦀", ""],
        ];
        for deltas in shapes {
            let n = deltas.len();
            let events = deltas
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    if i + 1 == n {
                        StreamEvent::last(i as u64, *d)
                    } else {
                        StreamEvent::delta(i as u64, *d)
                    }
                })
                .collect();
            let r = run(events);
            assert_eq!(r.status(), StreamStatus::Completed);
            assert_eq!(r.content(), deltas.concat());
            assert_eq!(r.events_applied(), n as u64);
        }
    }

    #[test]
    fn each_transition_yields_delta_and_content() {
        let mut r = Reassembler::new();
        assert_eq!(
            r.apply(StreamEvent::delta(0, "Hel")),
            Transition::Appended {
                delta: "Hel",
                content: "Hel"
            }
        );
        assert_eq!(
            r.apply(StreamEvent::last(1, "lo!")),
            Transition::Completed {
                delta: "lo!",
                content: "Hello!"
            }
        );
    }

    #[test]
    fn duplicate_fails_and_later_events_are_ignored() {
        let mut r = Reassembler::new();
        r.apply(StreamEvent::delta(0, "A"));
        r.apply(StreamEvent::delta(1, "B"));
        match r.apply(StreamEvent::delta(1, "B")) {
            Transition::Failed { error, content } => {
                assert!(matches!(error, StreamError::ProtocolViolation(_)));
                assert_eq!(content, "AB");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(r.apply(StreamEvent::delta(2, "C")), Transition::Ignored);
        assert_eq!(r.apply(StreamEvent::last(3, "D")), Transition::Ignored);
        assert_eq!(r.content(), "AB");
        assert_eq!(r.status(), StreamStatus::Failed);
    }

    #[test]
    fn regression_fails() {
        let r = run(vec![
            StreamEvent::delta(0, "A"),
            StreamEvent::delta(1, "B"),
            StreamEvent::delta(0, "A"),
        ]);
        assert!(matches!(r.error(), Some(StreamError::ProtocolViolation(_))));
    }

    #[test]
    fn upstream_error_keeps_partial_content() {
        let r = run(vec![
            StreamEvent::delta(0, "par"),
            StreamEvent::delta(1, "tial"),
            StreamEvent::failed(2, UpstreamError::new("engine", "overloaded")),
        ]);
        assert_eq!(r.status(), StreamStatus::Failed);
        let done = r.finish();
        assert_eq!(done.text(), "partial");
        assert!(done.partial);
        assert_eq!(
            done.error,
            Some(StreamError::Upstream(UpstreamError::new("engine", "overloaded")))
        );
    }

    #[test]
    fn cancel_freezes_state_and_is_idempotent() {
        let mut r = Reassembler::new();
        r.apply(StreamEvent::delta(0, "A"));
        assert!(r.cancel());
        assert!(!r.cancel());
        assert_eq!(r.apply(StreamEvent::last(1, "B")), Transition::Ignored);
        assert_eq!(r.status(), StreamStatus::Cancelled);
        assert_eq!(r.content(), "A");
        assert_eq!(r.error(), Some(&StreamError::Cancelled));
    }

    #[test]
    fn cancel_after_completion_is_noop() {
        let mut r = run(vec![StreamEvent::last(0, "done")]);
        assert!(!r.cancel());
        assert_eq!(r.status(), StreamStatus::Completed);
        assert_eq!(r.error(), None);
    }

    #[test]
    fn external_failure_does_not_override_terminal_state() {
        let mut r = run(vec![StreamEvent::last(0, "x")]);
        assert_eq!(
            r.fail(StreamError::TransportSevered("late".into())),
            Transition::Ignored
        );
        assert_eq!(r.status(), StreamStatus::Completed);
    }
}
