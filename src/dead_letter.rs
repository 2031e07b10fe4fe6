//! Terminal storage for tasks the gateway could not deliver.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::event::DomainEvent;
use crate::outbox::PublishTask;

/// Why a task ended up in the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Retried `max_attempts` times without an Ack.
    AttemptsExhausted,
    /// Dropped by the evict-oldest overflow policy.
    Evicted,
    /// Still queued when the shutdown flush deadline expired.
    ShutdownFlush,
}

/// A task in its terminal state, with enough context for manual recovery.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub event: DomainEvent,
    pub attempts: u32,
    pub first_enqueued_at: SystemTime,
    pub last_error: Option<String>,
    pub reason: DeadLetterReason,
}

impl DeadLetter {
    pub fn from_task(task: PublishTask, reason: DeadLetterReason) -> Self {
        Self {
            event: task.event,
            attempts: task.attempts,
            first_enqueued_at: task.first_enqueued_at,
            last_error: task.last_error,
            reason,
        }
    }
}

/// Where dead letters go. Implementations must not block for long; the drain
/// worker calls this inline.
pub trait DeadLetterSink: Send + Sync {
    fn record(&self, letter: DeadLetter);
}

/// Default sink: logs the loss loudly and drops the payload.
pub struct LogDeadLetterSink;

impl DeadLetterSink for LogDeadLetterSink {
    fn record(&self, letter: DeadLetter) {
        tracing::error!(
            kind = %letter.event.kind,
            entity = %letter.event.entity_id,
            sequence = letter.event.sequence,
            attempts = letter.attempts,
            reason = ?letter.reason,
            last_error = letter.last_error.as_deref().unwrap_or(""),
            "event dead-lettered"
        );
    }
}

/// Sink that keeps dead letters in memory for inspection.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn record(&self, letter: DeadLetter) {
        if let Ok(mut letters) = self.letters.lock() {
            letters.push(letter);
        }
    }
}
