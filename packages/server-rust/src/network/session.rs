//! Broker session state and shutdown signalling.
//!
//! Uses `ArcSwap` for lock-free connection state reads on the publish path
//! and a `watch` channel to tell the event loop to stop.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Connection state of the broker session.
///
/// State machine: Disconnected -> Connecting -> Connected -> Disconnected.
/// Reconnects are driven by the transport and reported as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Shared session state read by every publisher.
#[derive(Debug)]
pub struct Session {
    state: ArcSwap<ConnectionState>,
    shutdown_signal: watch::Sender<bool>,
}

impl Session {
    /// Creates a session in the `Disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(ConnectionState::Disconnected),
            shutdown_signal: tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn set_connecting(&self) {
        self.state.store(Arc::new(ConnectionState::Connecting));
    }

    pub fn set_connected(&self) {
        self.state.store(Arc::new(ConnectionState::Connected));
    }

    pub fn set_disconnected(&self) {
        self.state.store(Arc::new(ConnectionState::Disconnected));
    }

    /// Returns a receiver that flips to `true` once shutdown is requested.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Asks the event loop to stop. Idempotent.
    pub fn trigger_shutdown(&self) {
        self.shutdown_signal.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
