//! Confirmed publishing of queued tasks.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectionManager;
use crate::outbox::PublishTask;
use crate::transport::{BrokerConnector, ChannelError, Confirmation};

/// Outcome of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// The broker confirmed delivery.
    Ack,
    /// The broker rejected the message, or the confirmation timed out.
    Nack(Option<String>),
    /// No channel was available; task state was left untouched.
    BrokerUnavailable,
}

/// Stateless publish executor.
///
/// All retry bookkeeping lives in [`PublishTask`] and the outbox buffer; the
/// publisher only performs a single confirmed publish per call and translates
/// transport outcomes into the gateway's vocabulary.
pub struct Publisher<C: BrokerConnector> {
    manager: Arc<ConnectionManager<C>>,
    confirm_timeout: Duration,
}

impl<C: BrokerConnector> Publisher<C> {
    pub fn new(manager: Arc<ConnectionManager<C>>, confirm_timeout: Duration) -> Self {
        Self {
            manager,
            confirm_timeout,
        }
    }

    /// Publish one task, blocking at most the confirm timeout.
    ///
    /// A confirm timeout counts as a `Nack`: the message may or may not have
    /// reached the broker, and at-least-once delivery means we retry.
    pub fn publish(&self, task: &PublishTask) -> PublishResult {
        let mut channel = match self.manager.acquire_channel() {
            Ok(guard) => guard,
            Err(_) => return PublishResult::BrokerUnavailable,
        };

        match channel.publish(&task.routing, &task.body, self.confirm_timeout) {
            Ok(Confirmation::Ack) => PublishResult::Ack,
            Ok(Confirmation::Nack(reason)) => PublishResult::Nack(reason),
            Err(ChannelError::ConfirmTimeout) => {
                PublishResult::Nack(Some("publish confirm timed out".to_string()))
            }
            Err(ChannelError::Closed(reason)) => {
                drop(channel);
                self.manager.mark_lost(&reason);
                PublishResult::BrokerUnavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::codec::EventCodec;
    use crate::connection::ConnectionState;
    use crate::event::{DomainEvent, EventKind};
    use crate::transport::memory::InMemoryBroker;
    use serde_json::json;
    use std::thread;
    use std::time::Instant;

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

    fn audit_task(entity: &str, sequence: u64) -> PublishTask {
        let event = DomainEvent::new(
            EventKind::AuditLogged,
            entity,
            sequence,
            json!({
                "event_id": format!("{}-{}", entity, sequence),
                "event_type": "login",
                "timestamp": "2026-08-27T10:15:00Z",
                "toll_name": "North Plaza",
                "details": "operator login"
            }),
        );
        let (routing, body) = EventCodec::new("test").encode(&event).unwrap();
        PublishTask::new(event, routing, body)
    }

    #[test]
    fn publish_acks_through_a_connected_channel() {
        let broker = InMemoryBroker::new();
        let (manager, supervisor) = ConnectionManager::start(broker.clone(), fast_backoff());
        wait_for(|| manager.state() == ConnectionState::Connected);

        let publisher = Publisher::new(Arc::clone(&manager), Duration::from_secs(1));
        assert_eq!(publisher.publish(&audit_task("e1", 1)), PublishResult::Ack);
        assert_eq!(broker.published().len(), 1);

        supervisor.stop();
    }

    #[test]
    fn broker_rejection_maps_to_nack() {
        let broker = InMemoryBroker::new();
        broker.reject_routing_key("audit.logged");
        let (manager, supervisor) = ConnectionManager::start(broker, fast_backoff());
        wait_for(|| manager.state() == ConnectionState::Connected);

        let publisher = Publisher::new(Arc::clone(&manager), Duration::from_secs(1));
        assert!(matches!(
            publisher.publish(&audit_task("e1", 1)),
            PublishResult::Nack(_)
        ));

        supervisor.stop();
    }

    #[test]
    fn no_connection_means_broker_unavailable() {
        let broker = InMemoryBroker::down();
        let (manager, supervisor) = ConnectionManager::start(broker, fast_backoff());

        let publisher = Publisher::new(Arc::clone(&manager), Duration::from_secs(1));
        assert_eq!(
            publisher.publish(&audit_task("e1", 1)),
            PublishResult::BrokerUnavailable
        );

        supervisor.stop();
    }

    #[test]
    fn closed_channel_reports_loss_to_the_manager() {
        let broker = InMemoryBroker::new();
        let (manager, supervisor) = ConnectionManager::start(broker.clone(), fast_backoff());
        wait_for(|| manager.state() == ConnectionState::Connected);

        broker.take_down();
        let publisher = Publisher::new(Arc::clone(&manager), Duration::from_secs(1));
        assert_eq!(
            publisher.publish(&audit_task("e1", 1)),
            PublishResult::BrokerUnavailable
        );
        assert_ne!(manager.state(), ConnectionState::Connected);

        supervisor.stop();
    }
}
