use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::event::DomainEvent;
use crate::routing::RoutingDescriptor;

/// A queued publish: the event, its pre-encoded wire form, and retry metadata.
///
/// Owned by the outbox buffer while queued, handed to the drain worker for
/// the duration of one attempt, and destroyed on Ack or dead-lettered after
/// exhausting attempts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishTask {
    pub event: DomainEvent,
    pub routing: RoutingDescriptor,
    pub body: Vec<u8>,
    pub attempts: u32,
    pub first_enqueued_at: SystemTime,
    pub last_error: Option<String>,
    /// Earliest instant the task may be retried. Not persisted: a spilled
    /// task is immediately eligible after reload.
    #[serde(skip)]
    pub(crate) not_before: Option<Instant>,
}

impl PublishTask {
    pub fn new(event: DomainEvent, routing: RoutingDescriptor, body: Vec<u8>) -> Self {
        Self {
            event,
            routing,
            body,
            attempts: 0,
            first_enqueued_at: SystemTime::now(),
            last_error: None,
            not_before: None,
        }
    }

    /// Record a failed attempt.
    pub(crate) fn note_failure(&mut self, error: Option<String>) {
        self.attempts += 1;
        self.last_error = error;
    }

    pub(crate) fn hold_for(&mut self, delay: Duration) {
        self.not_before = Some(Instant::now() + delay);
    }

    pub(crate) fn eligible_at(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}
