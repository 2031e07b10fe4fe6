//! Broker connection lifecycle.
//!
//! `ConnectionManager` owns at most one logical connection at a time and
//! exposes it through non-blocking [`acquire_channel`](ConnectionManager::acquire_channel)
//! calls. Reconnection runs on its own supervisor thread with exponential
//! backoff and full jitter; broker unavailability is never fatal. State
//! transitions (`Disconnected` / `Reconnecting` / `Connected`) are emitted
//! through an [`EventEmitter`] so the facade can surface health changes.

use std::fmt;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use event_emitter_rs::EventEmitter;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::routing::RoutingDescriptor;
use crate::transport::{BrokerChannel, BrokerConnector, ChannelError, Confirmation};

/// Emitter event name for connectivity transitions.
pub const CONNECTIVITY_EVENT: &str = "connectivity";

/// How often the supervisor re-checks a healthy connection.
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Observable connection state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Reconnecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Returned by `acquire_channel` while no connected channel exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionUnavailable;

impl fmt::Display for ConnectionUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker connection unavailable")
    }
}

impl std::error::Error for ConnectionUnavailable {}

// The guarded values are plain state; a poisoned lock still holds them.
fn relock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the broker connection and its state machine.
pub struct ConnectionManager<C: BrokerConnector> {
    connector: C,
    channel: Mutex<Option<C::Channel>>,
    state: Mutex<ConnectionState>,
    emitter: Mutex<EventEmitter>,
    backoff: BackoffConfig,
}

impl<C: BrokerConnector + 'static> ConnectionManager<C> {
    /// Create the manager and start its reconnect supervisor.
    ///
    /// The supervisor connects as soon as the broker allows and keeps
    /// retrying forever with full-jitter backoff; dropping the returned
    /// thread handle (or calling [`ConnectionSupervisorThread::stop`])
    /// shuts it down.
    pub fn start(connector: C, backoff: BackoffConfig) -> (Arc<Self>, ConnectionSupervisorThread) {
        let manager = Arc::new(Self {
            connector,
            channel: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            emitter: Mutex::new(EventEmitter::new()),
            backoff,
        });

        let supervisor = ConnectionSupervisorThread::spawn(Arc::clone(&manager));
        (manager, supervisor)
    }
}

impl<C: BrokerConnector> ConnectionManager<C> {
    /// Current state of the connection state machine.
    pub fn state(&self) -> ConnectionState {
        *relock(&self.state)
    }

    /// Borrow the live channel for one publish.
    ///
    /// Non-blocking: while disconnected (or while another caller holds the
    /// channel) this returns [`ConnectionUnavailable`] immediately so callers
    /// fall back to buffering instead of stalling.
    pub fn acquire_channel(&self) -> Result<ChannelGuard<'_, C>, ConnectionUnavailable> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionUnavailable);
        }
        let slot = match self.channel.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(ConnectionUnavailable),
        };
        if slot.is_none() {
            return Err(ConnectionUnavailable);
        }
        Ok(ChannelGuard { slot })
    }

    /// Report a dead channel. Drops it and transitions to `Disconnected`;
    /// the supervisor picks reconnection up from there.
    pub fn mark_lost(&self, reason: &str) {
        relock(&self.channel).take();
        tracing::warn!(reason, "broker channel lost");
        self.transition(ConnectionState::Disconnected);
    }

    /// Register a callback for connectivity transitions.
    pub fn on_transition<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        relock(&self.emitter).on(CONNECTIVITY_EVENT, move |state: ConnectionState| {
            callback(state)
        });
    }

    fn transition(&self, next: ConnectionState) {
        {
            let mut state = relock(&self.state);
            if *state == next {
                return;
            }
            *state = next;
        }
        tracing::info!(state = %next, "broker connectivity changed");
        relock(&self.emitter).emit(CONNECTIVITY_EVENT, next);
    }

    fn try_connect(&self) -> bool {
        match self.connector.connect() {
            Ok(channel) => {
                *relock(&self.channel) = Some(channel);
                self.transition(ConnectionState::Connected);
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "broker connect failed");
                false
            }
        }
    }
}

/// Exclusive borrow of the live channel for a single publish attempt.
pub struct ChannelGuard<'a, C: BrokerConnector> {
    slot: MutexGuard<'a, Option<C::Channel>>,
}

impl<C: BrokerConnector> fmt::Debug for ChannelGuard<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGuard").finish_non_exhaustive()
    }
}

impl<C: BrokerConnector> ChannelGuard<'_, C> {
    /// Publish through the guarded channel.
    pub fn publish(
        &mut self,
        routing: &RoutingDescriptor,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Confirmation, ChannelError> {
        match self.slot.as_mut() {
            Some(channel) => channel.publish(routing, body, timeout),
            // The slot was emptied between acquire and use.
            None => Err(ChannelError::Closed("channel slot empty".to_string())),
        }
    }
}

/// Background thread driving reconnection.
///
/// Follows the same pattern as `DrainWorkerThread`: spawn, run until
/// signalled, stop and join.
pub struct ConnectionSupervisorThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionSupervisorThread {
    fn spawn<C: BrokerConnector + 'static>(manager: Arc<ConnectionManager<C>>) -> Self {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut attempt: u32 = 0;
            loop {
                let wait = match manager.state() {
                    ConnectionState::Connected => {
                        attempt = 0;
                        PROBE_INTERVAL
                    }
                    ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                        manager.transition(ConnectionState::Reconnecting);
                        attempt = attempt.saturating_add(1);
                        if manager.try_connect() {
                            attempt = 0;
                            PROBE_INTERVAL
                        } else {
                            manager.backoff.delay(attempt)
                        }
                    }
                };

                // The stop channel doubles as the backoff timer.
                match stop_rx.recv_timeout(wait.max(Duration::from_millis(1))) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the supervisor to stop and wait for it to finish.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Signal the supervisor to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for ConnectionSupervisorThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
