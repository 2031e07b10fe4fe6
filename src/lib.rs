//! Event publication gateway for the tolling message bus.
//!
//! Domain modules submit [`DomainEvent`]s to the [`Gateway`]; the gateway
//! validates and encodes them, buffers them in the [`outbox`], and a single
//! background worker publishes them to the broker with publisher confirms.
//! Submission never blocks on the network: broker outages are absorbed by
//! the buffer and a reconnect supervisor, and undeliverable events end up in
//! a [`DeadLetterSink`] rather than being silently dropped.

mod backoff;
mod codec;
mod config;
mod connection;
mod dead_letter;
mod event;
mod gateway;
mod outbox;
mod publisher;
mod routing;
pub mod transport;
mod worker;

pub use backoff::BackoffConfig;
pub use codec::{Envelope, EnvelopeMeta, EventCodec, FieldType, ValidationError, ENVELOPE_VERSION};
pub use config::{ConfigError, GatewayConfig, OutboxConfig};
pub use connection::{
    ChannelGuard, ConnectionManager, ConnectionState, ConnectionSupervisorThread,
    ConnectionUnavailable, CONNECTIVITY_EVENT,
};
pub use dead_letter::{
    DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink, LogDeadLetterSink,
};
pub use event::{DomainEvent, EventKind, UnknownEventKind};
pub use gateway::{
    Gateway, GatewayBuilder, GatewayStatus, ShutdownReport, StartError, SubmitError,
};
pub use outbox::{Enqueued, OutboxBuffer, Overloaded, OverflowPolicy, PublishTask};
pub use publisher::{PublishResult, Publisher};
pub use routing::{RoutingDescriptor, DEFAULT_EXCHANGE};
pub use worker::{DrainWorkerThread, WorkerStats};

// Re-export the EventEmitter from the event_emitter_rs crate
pub use event_emitter_rs::EventEmitter;
