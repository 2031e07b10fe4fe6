//! The single entry point external collaborators call.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{EventCodec, ValidationError};
use crate::config::GatewayConfig;
use crate::connection::{ConnectionManager, ConnectionState, ConnectionSupervisorThread};
use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink, LogDeadLetterSink};
use crate::event::DomainEvent;
use crate::outbox::{Enqueued, OutboxBuffer, OverflowPolicy, PublishTask};
use crate::publisher::Publisher;
use crate::transport::BrokerConnector;
use crate::worker::{DrainWorkerThread, WorkerStats};

/// Why `submit` refused an event. Transport trouble never shows up here;
/// it is absorbed by the outbox and retried behind the caller's back.
#[derive(Debug)]
pub enum SubmitError {
    /// The event is malformed. The caller's bug; never retried.
    Validation(ValidationError),
    /// The buffer is at capacity under the reject-new policy.
    Overloaded,
    /// The gateway is shutting down and no longer accepts events.
    ShuttingDown,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Validation(err) => write!(f, "event rejected: {}", err),
            SubmitError::Overloaded => write!(f, "gateway overloaded, retry later"),
            SubmitError::ShuttingDown => write!(f, "gateway is shutting down"),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmitError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for SubmitError {
    fn from(err: ValidationError) -> Self {
        SubmitError::Validation(err)
    }
}

/// Failure constructing the gateway.
#[derive(Debug)]
pub enum StartError {
    /// The spill spool could not be opened.
    Io(std::io::Error),
    /// Spill-to-disk overflow policy without a spill directory.
    MissingSpillDir,
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Io(err) => write!(f, "failed to open spill dir: {}", err),
            StartError::MissingSpillDir => {
                write!(f, "spill-to-disk policy requires outbox.spill_dir")
            }
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::Io(err) => Some(err),
            StartError::MissingSpillDir => None,
        }
    }
}

/// Read-only health snapshot for the external API layer to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStatus {
    pub connectivity: ConnectionState,
    /// Queued plus in-flight tasks.
    pub queue_depth: usize,
    /// Tasks parked in the disk spool.
    pub spilled: usize,
    /// Events routed to the dead-letter sink since startup.
    pub dead_lettered: usize,
    pub accepting: bool,
}

/// What graceful shutdown managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub worker: WorkerStats,
    /// Tasks dead-lettered because the flush deadline expired.
    pub dead_lettered: usize,
    /// Tasks persisted to the spool instead of being dead-lettered.
    pub spilled: usize,
}

/// The event publication gateway.
///
/// `submit` validates and encodes synchronously, buffers, and returns; the
/// actual broker publish always happens on the background drain worker, so
/// no caller ever blocks on network I/O. One gateway instance serves a whole
/// process and is safe to share across request-handling threads.
pub struct Gateway<C: BrokerConnector + 'static> {
    codec: EventCodec,
    buffer: Arc<OutboxBuffer>,
    manager: Arc<ConnectionManager<C>>,
    sink: Arc<dyn DeadLetterSink>,
    dead_letters: Arc<AtomicUsize>,
    worker: Option<DrainWorkerThread>,
    supervisor: Option<ConnectionSupervisorThread>,
    accepting: AtomicBool,
    flush_deadline: Duration,
}

/// Keeps the status surface's dead-letter total without asking the sink to
/// count for us.
struct CountingSink {
    inner: Arc<dyn DeadLetterSink>,
    count: Arc<AtomicUsize>,
}

impl DeadLetterSink for CountingSink {
    fn record(&self, letter: DeadLetter) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.record(letter);
    }
}

impl<C: BrokerConnector + 'static> Gateway<C> {
    /// Start with default configuration and the log dead-letter sink.
    pub fn start(connector: C) -> Result<Self, StartError> {
        Self::builder(connector).start()
    }

    pub fn builder(connector: C) -> GatewayBuilder<C> {
        GatewayBuilder {
            connector,
            config: GatewayConfig::default(),
            sink: None,
        }
    }

    /// Accept an event for eventual publication.
    ///
    /// Returns synchronously: `Ok` means the event is safely buffered (or
    /// spilled) and will be delivered at least once, broker permitting.
    pub fn submit(&self, event: DomainEvent) -> Result<(), SubmitError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }
        let (routing, body) = self.codec.encode(&event)?;
        let task = PublishTask::new(event, routing, body);
        match self.buffer.enqueue(task) {
            Ok(Enqueued::Queued) | Ok(Enqueued::Spilled) => Ok(()),
            Ok(Enqueued::Evicted(evicted)) => {
                self.sink
                    .record(DeadLetter::from_task(evicted, DeadLetterReason::Evicted));
                Ok(())
            }
            Err(_) => Err(SubmitError::Overloaded),
        }
    }

    /// Health snapshot: connectivity plus buffer occupancy.
    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            connectivity: self.manager.state(),
            queue_depth: self.buffer.depth(),
            spilled: self.buffer.spilled(),
            dead_lettered: self.dead_letters.load(Ordering::SeqCst),
            accepting: self.accepting.load(Ordering::SeqCst),
        }
    }

    /// Register a callback for broker connectivity transitions.
    pub fn on_connectivity_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.manager.on_transition(callback);
    }

    /// Stop accepting, flush the buffer within the configured deadline, then
    /// persist whatever is left: to the spool when one is configured, to the
    /// dead-letter sink otherwise. Nothing is silently dropped.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.accepting.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + self.flush_deadline;
        while !self.buffer.is_idle() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let worker = self.worker.take().map(|w| w.stop()).unwrap_or_default();

        let (spilled, unflushed) = if self.buffer.has_spill() {
            self.buffer.spill_remaining()
        } else {
            (0, self.buffer.take_remaining())
        };
        let dead_lettered = unflushed.len();
        for task in unflushed {
            self.sink
                .record(DeadLetter::from_task(task, DeadLetterReason::ShutdownFlush));
        }

        if let Some(supervisor) = self.supervisor.take() {
            supervisor.stop();
        }

        tracing::info!(
            published = worker.published,
            dead_lettered,
            spilled,
            "gateway shut down"
        );
        ShutdownReport {
            worker,
            dead_lettered,
            spilled,
        }
    }
}

/// Builder wiring the codec, buffer, connection manager and drain worker.
pub struct GatewayBuilder<C: BrokerConnector + 'static> {
    connector: C,
    config: GatewayConfig,
    sink: Option<Arc<dyn DeadLetterSink>>,
}

impl<C: BrokerConnector + 'static> GatewayBuilder<C> {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn start(self) -> Result<Gateway<C>, StartError> {
        let GatewayBuilder {
            connector,
            config,
            sink,
        } = self;

        if config.outbox.overflow == OverflowPolicy::SpillToDisk
            && config.outbox.spill_dir.is_none()
        {
            return Err(StartError::MissingSpillDir);
        }

        let codec = EventCodec::new(config.producer.clone()).with_exchange(config.exchange.clone());

        let mut buffer = OutboxBuffer::new(
            config.outbox.capacity,
            config.outbox.overflow,
            config.outbox.retry_backoff.clone(),
        );
        if let Some(dir) = &config.outbox.spill_dir {
            buffer = buffer.with_spill_dir(dir).map_err(StartError::Io)?;
        }
        let buffer = Arc::new(buffer);

        let dead_letters = Arc::new(AtomicUsize::new(0));
        let sink: Arc<dyn DeadLetterSink> = Arc::new(CountingSink {
            inner: sink.unwrap_or_else(|| Arc::new(LogDeadLetterSink)),
            count: Arc::clone(&dead_letters),
        });
        let (manager, supervisor) =
            ConnectionManager::start(connector, config.reconnect_backoff.clone());
        let publisher = Publisher::new(Arc::clone(&manager), config.confirm_timeout());
        let worker = DrainWorkerThread::spawn(
            Arc::clone(&buffer),
            publisher,
            Arc::clone(&sink),
            config.outbox.max_attempts,
            config.poll_interval(),
        );

        Ok(Gateway {
            codec,
            buffer,
            manager,
            sink,
            dead_letters,
            worker: Some(worker),
            supervisor: Some(supervisor),
            accepting: AtomicBool::new(true),
            flush_deadline: config.shutdown_flush(),
        })
    }
}
