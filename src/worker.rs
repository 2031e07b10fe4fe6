//! Background thread draining the outbox buffer into the publisher.

use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::outbox::OutboxBuffer;
use crate::publisher::{PublishResult, Publisher};
use crate::transport::BrokerConnector;

/// Statistics from the drain worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub polls: usize,
}

/// The single background thread performing all broker publishes.
///
/// Pops one eligible task at a time from the buffer (which round-robins
/// across entities), publishes it, and feeds the outcome back: Ack discards
/// the task, Nack or an unavailable broker requeues it at the front of its
/// entity's queue with backoff, and exhausting `max_attempts` forwards it to
/// the dead-letter sink.
pub struct DrainWorkerThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<WorkerStats>>,
}

impl DrainWorkerThread {
    pub fn spawn<C>(
        buffer: Arc<OutboxBuffer>,
        publisher: Publisher<C>,
        sink: Arc<dyn DeadLetterSink>,
        max_attempts: u32,
        poll_interval: Duration,
    ) -> Self
    where
        C: BrokerConnector + 'static,
    {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = WorkerStats::default();

            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                stats.polls += 1;

                let mut task = match buffer.next_task(Instant::now()) {
                    Some(task) => task,
                    None => {
                        thread::sleep(poll_interval);
                        continue;
                    }
                };

                match publisher.publish(&task) {
                    PublishResult::Ack => {
                        tracing::debug!(
                            kind = %task.event.kind,
                            entity = %task.event.entity_id,
                            sequence = task.event.sequence,
                            "event published"
                        );
                        buffer.finish_task();
                        stats.published += 1;
                    }
                    PublishResult::Nack(reason) => {
                        task.note_failure(
                            reason.or_else(|| Some("rejected by broker".to_string())),
                        );
                        Self::retry_or_bury(&buffer, &sink, &mut stats, max_attempts, task);
                    }
                    PublishResult::BrokerUnavailable => {
                        task.note_failure(Some("broker unavailable".to_string()));
                        Self::retry_or_bury(&buffer, &sink, &mut stats, max_attempts, task);
                    }
                }
            }

            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    fn retry_or_bury(
        buffer: &OutboxBuffer,
        sink: &Arc<dyn DeadLetterSink>,
        stats: &mut WorkerStats,
        max_attempts: u32,
        task: crate::outbox::PublishTask,
    ) {
        if task.attempts >= max_attempts {
            buffer.finish_task();
            sink.record(DeadLetter::from_task(
                task,
                DeadLetterReason::AttemptsExhausted,
            ));
            stats.dead_lettered += 1;
        } else {
            buffer.requeue_front(task);
            stats.retried += 1;
        }
    }

    /// Signal the worker to stop and wait for it to finish.
    /// Returns the worker statistics.
    pub fn stop(mut self) -> WorkerStats {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap_or_default()
        } else {
            WorkerStats::default()
        }
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for DrainWorkerThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::codec::EventCodec;
    use crate::connection::{ConnectionManager, ConnectionState};
    use crate::dead_letter::InMemoryDeadLetterSink;
    use crate::event::{DomainEvent, EventKind};
    use crate::outbox::{OverflowPolicy, PublishTask};
    use crate::transport::memory::InMemoryBroker;
    use serde_json::json;

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn vehicle_task(entity: &str, sequence: u64) -> PublishTask {
        let event = DomainEvent::new(
            EventKind::VehicleUpserted,
            entity,
            sequence,
            json!({"vehicle_id": entity, "plate": entity, "category_id": "cat-1"}),
        );
        let (routing, body) = EventCodec::new("test").encode(&event).unwrap();
        PublishTask::new(event, routing, body)
    }

    #[test]
    fn drains_queued_tasks_to_the_broker() {
        let broker = InMemoryBroker::new();
        let (manager, supervisor) = ConnectionManager::start(broker.clone(), fast_backoff());
        wait_for(|| manager.state() == ConnectionState::Connected);

        let buffer = Arc::new(OutboxBuffer::new(
            16,
            OverflowPolicy::RejectNew,
            fast_backoff(),
        ));
        buffer.enqueue(vehicle_task("v1", 1)).unwrap();
        buffer.enqueue(vehicle_task("v2", 1)).unwrap();

        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let worker = DrainWorkerThread::spawn(
            Arc::clone(&buffer),
            Publisher::new(Arc::clone(&manager), Duration::from_secs(1)),
            sink.clone(),
            3,
            Duration::from_millis(2),
        );

        wait_for(|| broker.published().len() == 2);
        assert!(buffer.is_idle());

        let stats = worker.stop();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.dead_lettered, 0);
        supervisor.stop();
    }

    #[test]
    fn nacked_task_is_dead_lettered_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.reject_routing_key("vehicle.upserted");
        let (manager, supervisor) = ConnectionManager::start(broker, fast_backoff());
        wait_for(|| manager.state() == ConnectionState::Connected);

        let buffer = Arc::new(OutboxBuffer::new(
            16,
            OverflowPolicy::RejectNew,
            fast_backoff(),
        ));
        buffer.enqueue(vehicle_task("v1", 1)).unwrap();

        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let worker = DrainWorkerThread::spawn(
            Arc::clone(&buffer),
            Publisher::new(Arc::clone(&manager), Duration::from_secs(1)),
            sink.clone(),
            2,
            Duration::from_millis(2),
        );

        wait_for(|| sink.len() == 1);
        let letters = sink.letters();
        assert_eq!(letters[0].attempts, 2);
        assert!(buffer.is_idle());

        let stats = worker.stop();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.retried, 1);
        supervisor.stop();
    }
}
