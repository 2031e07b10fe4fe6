//! Bounded outbox buffer with per-entity FIFO ordering.
//!
//! ## Architecture
//!
//! ```text
//! submit ──▶ enqueue ──▶ ┌──────────────────────────────┐
//!                        │ entity "ABC123": [t1, t2]    │
//!                        │ entity "XY999":  [t5]        │──▶ next_task ──▶ Publisher
//!                        │ entity "cust-7": [t3, t4]    │◀── requeue_front (Nack)
//!                        └──────────────────────────────┘
//!                          round-robin across entities,
//!                          FIFO within each entity
//! ```
//!
//! A single drain worker round-robins across non-empty entity queues so one
//! noisy entity cannot starve the rest; FIFO within an entity preserves the
//! caller-assigned sequence order. Capacity is enforced on total occupancy
//! (queued tasks plus the one the worker holds), so overflow triggers at a
//! deterministic boundary.

mod spill;
mod task;

pub use task::PublishTask;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use spill::SpillDir;

/// What to do with a new task when the buffer is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse the new task; the caller sees `Overloaded`.
    RejectNew,
    /// Drop the oldest queued task of the same entity. Falls back to
    /// rejecting when the entity has nothing queued, so other entities'
    /// backlogs are never sacrificed.
    EvictOldest,
    /// Persist the new task to the disk spool and reload it later.
    SpillToDisk,
}

/// The buffer is at capacity under the reject-new policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overloaded;

impl fmt::Display for Overloaded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbox buffer at capacity")
    }
}

impl std::error::Error for Overloaded {}

/// How an accepted task was stored.
#[derive(Debug)]
pub enum Enqueued {
    Queued,
    Spilled,
    /// Queued after dropping the entity's oldest task, which the caller must
    /// route to the dead-letter sink — nothing is dropped silently.
    Evicted(PublishTask),
}

struct Inner {
    queues: HashMap<String, VecDeque<PublishTask>>,
    /// Round-robin rotation. Invariant: an entity appears here exactly when
    /// its queue is non-empty.
    rotation: VecDeque<String>,
    /// Queued tasks plus the one the drain worker may be holding; capacity
    /// is enforced against this.
    occupancy: usize,
    spill: Option<SpillDir>,
}

// The guarded value is plain bookkeeping; a poisoned lock still holds it.
fn relock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bounded collection of per-entity FIFO queues.
pub struct OutboxBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: OverflowPolicy,
    retry_backoff: BackoffConfig,
}

impl OutboxBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy, retry_backoff: BackoffConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                rotation: VecDeque::new(),
                occupancy: 0,
                spill: None,
            }),
            capacity,
            policy,
            retry_backoff,
        }
    }

    /// Attach a disk spool. Required for [`OverflowPolicy::SpillToDisk`];
    /// also used by graceful shutdown to persist whatever could not be
    /// flushed. Tasks already in the directory are recovered.
    pub fn with_spill_dir(self, dir: impl AsRef<Path>) -> io::Result<Self> {
        let OutboxBuffer {
            inner,
            capacity,
            policy,
            retry_backoff,
        } = self;
        let mut inner = inner.into_inner().unwrap_or_else(|p| p.into_inner());
        inner.spill = Some(SpillDir::open(dir.as_ref())?);
        Ok(Self {
            inner: Mutex::new(inner),
            capacity,
            policy,
            retry_backoff,
        })
    }

    pub fn has_spill(&self) -> bool {
        relock(&self.inner).spill.is_some()
    }

    /// Queued tasks plus any in-flight one.
    pub fn depth(&self) -> usize {
        relock(&self.inner).occupancy
    }

    /// Tasks currently parked in the disk spool.
    pub fn spilled(&self) -> usize {
        relock(&self.inner).spill.as_ref().map_or(0, |s| s.total())
    }

    pub fn is_idle(&self) -> bool {
        let inner = relock(&self.inner);
        inner.occupancy == 0 && inner.spill.as_ref().map_or(0, |s| s.total()) == 0
    }

    /// Accept a task, applying the overflow policy at capacity.
    pub fn enqueue(&self, task: PublishTask) -> Result<Enqueued, Overloaded> {
        let mut inner = relock(&self.inner);
        let Inner {
            queues,
            rotation,
            occupancy,
            spill,
        } = &mut *inner;

        // An entity with a spilled backlog keeps spilling so its FIFO order
        // survives the detour through disk.
        if let Some(sp) = spill.as_mut() {
            if sp.has(&task.event.entity_id) {
                return write_spill(sp, &task);
            }
        }

        if *occupancy >= self.capacity {
            return match self.policy {
                OverflowPolicy::RejectNew => Err(Overloaded),
                OverflowPolicy::EvictOldest => {
                    let entity = task.event.entity_id.clone();
                    match queues.get_mut(&entity).and_then(|q| q.pop_front()) {
                        Some(evicted) => {
                            push_task(queues, rotation, task);
                            Ok(Enqueued::Evicted(evicted))
                        }
                        None => Err(Overloaded),
                    }
                }
                OverflowPolicy::SpillToDisk => match spill.as_mut() {
                    Some(sp) => write_spill(sp, &task),
                    None => {
                        tracing::error!("spill-to-disk policy configured without a spill dir");
                        Err(Overloaded)
                    }
                },
            };
        }

        push_task(queues, rotation, task);
        *occupancy += 1;
        Ok(Enqueued::Queued)
    }

    /// Hand out the next eligible task, round-robining across entities.
    ///
    /// The task's occupancy slot stays reserved until the worker reports the
    /// attempt's outcome via [`requeue_front`](Self::requeue_front) or
    /// [`finish_task`](Self::finish_task). Each entity is considered at most
    /// once per call.
    pub fn next_task(&self, now: Instant) -> Option<PublishTask> {
        let mut inner = relock(&self.inner);
        let Inner {
            queues,
            rotation,
            occupancy,
            spill,
        } = &mut *inner;

        // Reload spilled tasks while there is room. Only an entity with an
        // empty in-memory queue may reload; its memory tasks are always older
        // than its spilled ones.
        if let Some(sp) = spill.as_mut() {
            if sp.total() > 0 {
                for entity in sp.entities() {
                    if *occupancy >= self.capacity {
                        break;
                    }
                    if queues.get(&entity).is_some_and(|q| !q.is_empty()) {
                        continue;
                    }
                    match sp.pop_oldest_for(&entity) {
                        Ok(Some(task)) => {
                            rotation.push_back(entity.clone());
                            queues.entry(entity).or_default().push_back(task);
                            *occupancy += 1;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::error!(error = %err, entity, "spill reload failed");
                        }
                    }
                }
            }
        }

        for _ in 0..rotation.len() {
            let entity = rotation.pop_front()?;
            let head_eligible = match queues.get(&entity).and_then(|q| q.front()) {
                Some(task) => task.eligible_at(now),
                // Stale rotation entry; drop it.
                None => {
                    queues.remove(&entity);
                    continue;
                }
            };
            if !head_eligible {
                rotation.push_back(entity);
                continue;
            }
            if let Some(queue) = queues.get_mut(&entity) {
                let task = queue.pop_front();
                if queue.is_empty() {
                    queues.remove(&entity);
                } else {
                    rotation.push_back(entity);
                }
                if task.is_some() {
                    return task;
                }
            }
        }
        None
    }

    /// Return a failed task to the FRONT of its entity's queue with a
    /// backoff delay derived from its attempt count.
    pub fn requeue_front(&self, mut task: PublishTask) {
        let delay = self.retry_backoff.delay(task.attempts);
        task.hold_for(delay);

        let mut inner = relock(&self.inner);
        let Inner {
            queues, rotation, ..
        } = &mut *inner;
        let entity = task.event.entity_id.clone();
        let queue = queues.entry(entity.clone()).or_default();
        if queue.is_empty() {
            rotation.push_back(entity);
        }
        queue.push_front(task);
    }

    /// Release the occupancy slot of a task that left the buffer for good
    /// (published or dead-lettered).
    pub fn finish_task(&self) {
        let mut inner = relock(&self.inner);
        inner.occupancy = inner.occupancy.saturating_sub(1);
    }

    /// Empty the in-memory queues. Used by graceful shutdown once the drain
    /// worker has stopped.
    pub(crate) fn take_remaining(&self) -> Vec<PublishTask> {
        let mut inner = relock(&self.inner);
        let Inner {
            queues,
            rotation,
            occupancy,
            ..
        } = &mut *inner;

        let mut remaining = Vec::new();
        while let Some(entity) = rotation.pop_front() {
            if let Some(mut queue) = queues.remove(&entity) {
                remaining.extend(queue.drain(..));
            }
        }
        for (_, mut queue) in queues.drain() {
            remaining.extend(queue.drain(..));
        }
        *occupancy = occupancy.saturating_sub(remaining.len());
        remaining
    }

    /// Persist the in-memory queues to the disk spool. Returns the number of
    /// tasks spilled plus any tasks the spool refused (I/O failure), which
    /// the caller must dead-letter.
    pub(crate) fn spill_remaining(&self) -> (usize, Vec<PublishTask>) {
        let mut inner = relock(&self.inner);
        let Inner {
            queues,
            rotation,
            occupancy,
            spill,
        } = &mut *inner;
        let sp = match spill.as_mut() {
            Some(sp) => sp,
            None => return (0, Vec::new()),
        };

        let mut spilled = 0;
        let mut failed = Vec::new();
        while let Some(entity) = rotation.pop_front() {
            if let Some(mut queue) = queues.remove(&entity) {
                for task in queue.drain(..) {
                    *occupancy = occupancy.saturating_sub(1);
                    match sp.write(&task) {
                        Ok(()) => spilled += 1,
                        Err(err) => {
                            tracing::error!(error = %err, "shutdown spill failed");
                            failed.push(task);
                        }
                    }
                }
            }
        }
        (spilled, failed)
    }
}

fn push_task(
    queues: &mut HashMap<String, VecDeque<PublishTask>>,
    rotation: &mut VecDeque<String>,
    task: PublishTask,
) {
    let entity = task.event.entity_id.clone();
    let queue = queues.entry(entity.clone()).or_default();
    if queue.is_empty() {
        rotation.push_back(entity);
    }
    queue.push_back(task);
}

fn write_spill(spill: &mut SpillDir, task: &PublishTask) -> Result<Enqueued, Overloaded> {
    match spill.write(task) {
        Ok(()) => Ok(Enqueued::Spilled),
        Err(err) => {
            tracing::error!(error = %err, "spill write failed");
            Err(Overloaded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DomainEvent, EventKind};
    use crate::routing::{RoutingDescriptor, DEFAULT_EXCHANGE};
    use serde_json::json;
    use std::time::Duration;

    fn no_backoff() -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 2.0,
        }
    }

    fn task(entity: &str, sequence: u64) -> PublishTask {
        let event = DomainEvent::new(EventKind::TransitRecorded, entity, sequence, json!({}));
        let routing = RoutingDescriptor::for_kind(event.kind, DEFAULT_EXCHANGE);
        PublishTask::new(event, routing, b"{}".to_vec())
    }

    #[test]
    fn drains_fifo_within_an_entity() {
        let buffer = OutboxBuffer::new(16, OverflowPolicy::RejectNew, no_backoff());
        for sequence in 1..=3 {
            buffer.enqueue(task("a", sequence)).unwrap();
        }

        for expected in 1..=3 {
            let popped = buffer.next_task(Instant::now()).unwrap();
            assert_eq!(popped.event.sequence, expected);
            buffer.finish_task();
        }
        assert!(buffer.next_task(Instant::now()).is_none());
        assert_eq!(buffer.depth(), 0);
    }

    #[test]
    fn round_robins_across_entities() {
        let buffer = OutboxBuffer::new(16, OverflowPolicy::RejectNew, no_backoff());
        buffer.enqueue(task("a", 1)).unwrap();
        buffer.enqueue(task("a", 2)).unwrap();
        buffer.enqueue(task("b", 1)).unwrap();
        buffer.enqueue(task("c", 1)).unwrap();

        let order: Vec<(String, u64)> = (0..4)
            .map(|_| {
                let t = buffer.next_task(Instant::now()).unwrap();
                buffer.finish_task();
                (t.event.entity_id.clone(), t.event.sequence)
            })
            .collect();

        // No entity is visited twice before every other non-empty entity
        // has had its turn.
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 1),
                ("c".to_string(), 1),
                ("a".to_string(), 2),
            ]
        );
    }

    #[test]
    fn requeued_task_keeps_its_place_at_the_front() {
        let buffer = OutboxBuffer::new(16, OverflowPolicy::RejectNew, no_backoff());
        buffer.enqueue(task("a", 1)).unwrap();
        buffer.enqueue(task("a", 2)).unwrap();

        let mut first = buffer.next_task(Instant::now()).unwrap();
        assert_eq!(first.event.sequence, 1);
        first.note_failure(Some("nack".to_string()));
        buffer.requeue_front(first);

        // Sequence 1 drains again before sequence 2.
        let again = buffer.next_task(Instant::now()).unwrap();
        assert_eq!(again.event.sequence, 1);
        assert_eq!(again.attempts, 1);
    }

    #[test]
    fn backoff_delays_retry_eligibility() {
        let backoff = BackoffConfig {
            base_delay_ms: 50,
            max_delay_ms: 50,
            multiplier: 2.0,
        };
        let buffer = OutboxBuffer::new(16, OverflowPolicy::RejectNew, backoff);
        buffer.enqueue(task("a", 1)).unwrap();

        let mut popped = buffer.next_task(Instant::now()).unwrap();
        popped.note_failure(None);
        buffer.requeue_front(popped);

        // Not eligible right away, but eligible once the ceiling has passed.
        assert!(buffer.next_task(Instant::now()).is_none());
        let later = Instant::now() + Duration::from_millis(60);
        assert!(buffer.next_task(later).is_some());
    }

    #[test]
    fn reject_new_overflows_at_the_capacity_boundary() {
        let buffer = OutboxBuffer::new(2, OverflowPolicy::RejectNew, no_backoff());
        buffer.enqueue(task("a", 1)).unwrap();
        buffer.enqueue(task("b", 1)).unwrap();
        assert!(matches!(buffer.enqueue(task("c", 1)), Err(Overloaded)));
        assert_eq!(buffer.depth(), 2);
    }

    #[test]
    fn in_flight_task_still_occupies_its_slot() {
        let buffer = OutboxBuffer::new(1, OverflowPolicy::RejectNew, no_backoff());
        buffer.enqueue(task("a", 1)).unwrap();

        let popped = buffer.next_task(Instant::now()).unwrap();
        assert!(matches!(buffer.enqueue(task("b", 1)), Err(Overloaded)));

        buffer.requeue_front(popped);
        assert!(matches!(buffer.enqueue(task("b", 1)), Err(Overloaded)));
    }

    #[test]
    fn evict_oldest_drops_only_the_same_entity() {
        let buffer = OutboxBuffer::new(2, OverflowPolicy::EvictOldest, no_backoff());
        buffer.enqueue(task("a", 1)).unwrap();
        buffer.enqueue(task("a", 2)).unwrap();

        match buffer.enqueue(task("a", 3)).unwrap() {
            Enqueued::Evicted(evicted) => assert_eq!(evicted.event.sequence, 1),
            other => panic!("expected eviction, got {:?}", other),
        }

        // A full buffer with nothing queued for the new entity rejects
        // rather than evicting someone else's task.
        assert!(matches!(buffer.enqueue(task("b", 1)), Err(Overloaded)));

        let order: Vec<u64> = (0..2)
            .map(|_| {
                let t = buffer.next_task(Instant::now()).unwrap();
                buffer.finish_task();
                t.event.sequence
            })
            .collect();
        assert_eq!(order, vec![2, 3]);
    }

    #[test]
    fn spill_policy_parks_overflow_on_disk_and_reloads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OutboxBuffer::new(1, OverflowPolicy::SpillToDisk, no_backoff())
            .with_spill_dir(dir.path())
            .unwrap();

        buffer.enqueue(task("a", 1)).unwrap();
        assert!(matches!(
            buffer.enqueue(task("b", 1)).unwrap(),
            Enqueued::Spilled
        ));
        // Entity b keeps spilling while it has a spilled backlog, even
        // though later capacity checks might admit it.
        assert!(matches!(
            buffer.enqueue(task("b", 2)).unwrap(),
            Enqueued::Spilled
        ));
        assert_eq!(buffer.spilled(), 2);

        let first = buffer.next_task(Instant::now()).unwrap();
        assert_eq!(first.event.entity_id, "a");
        buffer.finish_task();

        // With a free slot, b's oldest spilled task is reloaded first.
        let second = buffer.next_task(Instant::now()).unwrap();
        assert_eq!((second.event.entity_id.as_str(), second.event.sequence), ("b", 1));
        buffer.finish_task();
        let third = buffer.next_task(Instant::now()).unwrap();
        assert_eq!((third.event.entity_id.as_str(), third.event.sequence), ("b", 2));
        buffer.finish_task();

        assert!(buffer.is_idle());
    }

    #[test]
    fn spill_policy_without_a_dir_rejects() {
        let buffer = OutboxBuffer::new(1, OverflowPolicy::SpillToDisk, no_backoff());
        buffer.enqueue(task("a", 1)).unwrap();
        assert!(matches!(buffer.enqueue(task("b", 1)), Err(Overloaded)));
    }

    #[test]
    fn take_remaining_empties_the_buffer() {
        let buffer = OutboxBuffer::new(8, OverflowPolicy::RejectNew, no_backoff());
        buffer.enqueue(task("a", 1)).unwrap();
        buffer.enqueue(task("b", 1)).unwrap();
        buffer.enqueue(task("a", 2)).unwrap();

        let remaining = buffer.take_remaining();
        assert_eq!(remaining.len(), 3);
        assert_eq!(buffer.depth(), 0);
        assert!(buffer.next_task(Instant::now()).is_none());
    }

    #[test]
    fn spill_remaining_persists_queued_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OutboxBuffer::new(8, OverflowPolicy::RejectNew, no_backoff())
            .with_spill_dir(dir.path())
            .unwrap();
        buffer.enqueue(task("a", 1)).unwrap();
        buffer.enqueue(task("b", 1)).unwrap();

        let (spilled, failed) = buffer.spill_remaining();
        assert_eq!(spilled, 2);
        assert!(failed.is_empty());
        assert_eq!(buffer.depth(), 0);
        assert_eq!(buffer.spilled(), 2);
    }
}
