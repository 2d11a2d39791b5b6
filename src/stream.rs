//! Reconciles a streamed reply with the local message list.
//!
//! ```text
//! Idle ──begin──▶ PlaceholderCreated ──chunk──▶ Accumulating ──complete──▶ Finalized
//!                        │                           │
//!                        └───────error / abort───────┴──────────────────▶ Aborted
//! ```
//!
//! The reconciler never touches the message list itself; it returns the
//! [`Step`] the owner has to apply.

use crate::backend::StreamEvent;
use crate::models::{Delivery, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    PlaceholderCreated,
    Accumulating,
    Finalized,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Append `delta` to the placeholder's content.
    Append {
        placeholder_id: String,
        delta: String,
    },
    /// Insert an independent message next to the placeholder.
    Insert(Message),
    /// Replace the placeholder with the authoritative message.
    Finalize {
        placeholder_id: String,
        message: Message,
    },
    /// Drop the placeholder.
    Abort {
        placeholder_id: String,
        reason: String,
    },
    Ignore,
}

pub struct StreamReconciler {
    chat_id: String,
    placeholder: Option<Message>,
    content: String,
    phase: StreamPhase,
}

impl StreamReconciler {
    pub fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            placeholder: None,
            content: String::new(),
            phase: StreamPhase::Idle,
        }
    }

    /// Creates the placeholder row. Starting over discards any earlier one.
    pub fn begin(&mut self) -> Message {
        let placeholder = Message::placeholder(&self.chat_id);
        self.placeholder = Some(placeholder.clone());
        self.content.clear();
        self.phase = StreamPhase::PlaceholderCreated;
        placeholder
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.phase, StreamPhase::Finalized | StreamPhase::Aborted)
    }

    fn is_open(&self) -> bool {
        matches!(
            self.phase,
            StreamPhase::PlaceholderCreated | StreamPhase::Accumulating
        )
    }

    pub fn apply(&mut self, event: StreamEvent) -> Step {
        if !self.is_open() {
            return Step::Ignore;
        }
        let Some(placeholder) = self.placeholder.as_ref() else {
            return Step::Ignore;
        };
        let placeholder_id = placeholder.id.clone();

        match event {
            StreamEvent::Chunk(delta) => {
                self.content.push_str(&delta);
                self.phase = StreamPhase::Accumulating;
                Step::Append {
                    placeholder_id,
                    delta,
                }
            }
            StreamEvent::Command(message) => Step::Insert(message),
            StreamEvent::Complete(server) => {
                let message = match server {
                    Some(mut message) => {
                        message.delivery = Delivery::sent();
                        message
                    }
                    None => {
                        let mut message = placeholder.clone();
                        message.content = self.content.clone();
                        message.delivery = Delivery::sent();
                        message
                    }
                };
                self.phase = StreamPhase::Finalized;
                Step::Finalize {
                    placeholder_id,
                    message,
                }
            }
            StreamEvent::Error(reason) => self.abort(reason),
        }
    }

    pub fn abort(&mut self, reason: impl Into<String>) -> Step {
        if !self.is_open() {
            return Step::Ignore;
        }
        let Some(placeholder) = self.placeholder.as_ref() else {
            return Step::Ignore;
        };
        let placeholder_id = placeholder.id.clone();
        self.phase = StreamPhase::Aborted;
        Step::Abort {
            placeholder_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryState;

    #[test]
    fn idle_ignores_events() {
        let mut reconciler = StreamReconciler::new("c1");
        assert_eq!(reconciler.phase(), StreamPhase::Idle);
        assert_eq!(reconciler.apply(StreamEvent::Chunk("x".into())), Step::Ignore);
        assert_eq!(reconciler.abort("nope"), Step::Ignore);
    }

    #[test]
    fn chunks_accumulate_then_complete_finalizes() {
        let mut reconciler = StreamReconciler::new("c1");
        let placeholder = reconciler.begin();
        assert_eq!(reconciler.phase(), StreamPhase::PlaceholderCreated);

        let step = reconciler.apply(StreamEvent::Chunk("Hel".into()));
        assert_eq!(
            step,
            Step::Append {
                placeholder_id: placeholder.id.clone(),
                delta: "Hel".into()
            }
        );
        reconciler.apply(StreamEvent::Chunk("lo".into()));
        assert_eq!(reconciler.phase(), StreamPhase::Accumulating);
        assert_eq!(reconciler.content(), "Hello");

        let mut server = Message::assistant("c1", "Hello");
        server.id = "srv-1".into();
        server.delivery = Delivery::sending();
        match reconciler.apply(StreamEvent::Complete(Some(server))) {
            Step::Finalize {
                placeholder_id,
                message,
            } => {
                assert_eq!(placeholder_id, placeholder.id);
                assert_eq!(message.id, "srv-1");
                assert_eq!(message.delivery.state, DeliveryState::Sent);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert!(reconciler.is_settled());
        assert_eq!(reconciler.apply(StreamEvent::Chunk("late".into())), Step::Ignore);
    }

    #[test]
    fn complete_without_row_keeps_local_content() {
        let mut reconciler = StreamReconciler::new("c1");
        let placeholder = reconciler.begin();
        reconciler.apply(StreamEvent::Chunk("partial answer".into()));

        match reconciler.apply(StreamEvent::Complete(None)) {
            Step::Finalize { message, .. } => {
                assert_eq!(message.id, placeholder.id);
                assert_eq!(message.content, "partial answer");
                assert_eq!(message.delivery.state, DeliveryState::Sent);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn commands_pass_through_without_touching_placeholder() {
        let mut reconciler = StreamReconciler::new("c1");
        reconciler.begin();
        let command = Message::assistant("c1", "Created folder Projects");
        assert_eq!(
            reconciler.apply(StreamEvent::Command(command.clone())),
            Step::Insert(command)
        );
        assert_eq!(reconciler.phase(), StreamPhase::PlaceholderCreated);
        assert_eq!(reconciler.content(), "");
    }

    #[test]
    fn error_aborts_once() {
        let mut reconciler = StreamReconciler::new("c1");
        let placeholder = reconciler.begin();
        reconciler.apply(StreamEvent::Chunk("half".into()));

        assert_eq!(
            reconciler.apply(StreamEvent::Error("boom".into())),
            Step::Abort {
                placeholder_id: placeholder.id,
                reason: "boom".into()
            }
        );
        assert_eq!(reconciler.phase(), StreamPhase::Aborted);
        assert_eq!(reconciler.abort("again"), Step::Ignore);
        assert_eq!(reconciler.apply(StreamEvent::Complete(None)), Step::Ignore);
    }
}
