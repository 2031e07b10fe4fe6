//! Broker transport seam.
//!
//! The gateway is transport-agnostic: anything that can open a
//! publish-capable channel and confirm deliveries can sit behind it. The
//! crate ships [`memory::InMemoryBroker`] for tests and single-process
//! deployments; AMQP, Kafka or NATS connectors live in their own crates and
//! implement these two traits.

pub mod memory;

use std::fmt;
use std::time::Duration;

use crate::routing::RoutingDescriptor;

/// Broker-level verdict on a confirmed publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker accepted responsibility for the message.
    Ack,
    /// The broker rejected the message, with an optional reason.
    Nack(Option<String>),
}

/// Failure modes of a channel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel or its connection is gone; the caller should report the
    /// loss to the connection manager and fall back to buffering.
    Closed(String),
    /// No confirmation arrived within the allowed window.
    ConfirmTimeout,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed(reason) => write!(f, "channel closed: {}", reason),
            ChannelError::ConfirmTimeout => write!(f, "timed out waiting for publish confirm"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Error opening a connection to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectError(pub String);

impl ConnectError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker connect failed: {}", self.0)
    }
}

impl std::error::Error for ConnectError {}

/// A publish-capable channel on an open broker connection.
pub trait BrokerChannel: Send {
    /// Publish `body` under `routing` in confirm mode, blocking at most
    /// `timeout` for the broker's verdict.
    fn publish(
        &mut self,
        routing: &RoutingDescriptor,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Confirmation, ChannelError>;
}

/// Factory for broker connections.
///
/// Implementations might include:
/// - `InMemoryBroker` - included, for testing and single-process scenarios
/// - `AmqpConnector` - for RabbitMQ (external)
/// - `KafkaConnector` - for Apache Kafka (external)
pub trait BrokerConnector: Send + Sync {
    type Channel: BrokerChannel;

    /// Open a fresh connection and return a channel on it.
    fn connect(&self) -> Result<Self::Channel, ConnectError>;
}
