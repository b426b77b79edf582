//! In-process transport.
//!
//! Behaves like a broker holding a single clean session: subscriptions are
//! matched with the usual wildcard rules, published messages are delivered
//! to matching subscriptions and to every outbound observer, and the
//! connection can be dropped and restored on demand. Used by the test suite
//! and by builds without a broker client.

use async_trait::async_trait;
use bytes::Bytes;
use nodewire_core::topic;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::config::ConnectOptions;
use super::transport::{EventReceiver, Transport, TransportError, TransportEvent};

/// One message seen leaving the transport.
pub type Published = (String, Bytes);

#[derive(Default)]
struct Inner {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    connected: bool,
    subscriptions: Vec<String>,
    observers: Vec<mpsc::UnboundedSender<Published>>,
}

impl Inner {
    fn emit(&mut self, event: TransportEvent) -> bool {
        match &self.events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn deliver(&mut self, topic_name: &str, payload: &Bytes) -> bool {
        if !self.connected || !self.subscriptions.iter().any(|f| topic::matches(f, topic_name)) {
            return false;
        }
        self.emit(TransportEvent::Message {
            topic: topic_name.to_string(),
            payload: payload.clone(),
        })
    }
}

/// In-process [`Transport`].
#[derive(Default)]
pub struct LoopbackTransport {
    inner: Mutex<Inner>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes every message published through this transport from now on.
    #[must_use]
    pub fn outbound(&self) -> mpsc::UnboundedReceiver<Published> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().observers.push(tx);
        rx
    }

    /// Publishes as a remote client would. Returns whether a subscription
    /// matched and the message was delivered.
    pub fn inject(&self, topic_name: &str, payload: impl Into<Bytes>) -> bool {
        self.inner.lock().deliver(topic_name, &payload.into())
    }

    /// Simulates a lost connection. Subscriptions are discarded, like a
    /// clean session.
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return;
        }
        inner.connected = false;
        inner.subscriptions.clear();
        inner.emit(TransportEvent::Disconnected {
            reason: Some("connection lost".to_string()),
        });
    }

    /// Simulates a successful reconnect.
    pub fn restore_connection(&self) {
        let mut inner = self.inner.lock();
        if inner.connected || inner.events.is_none() {
            return;
        }
        inner.connected = true;
        inner.emit(TransportEvent::Connected);
    }

    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscriptions.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, _options: &ConnectOptions) -> Result<EventReceiver, TransportError> {
        let mut inner = self.inner.lock();
        if inner.events.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.events = Some(tx);
        inner.connected = true;
        inner.emit(TransportEvent::Connected);
        Ok(rx)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if !inner.subscriptions.iter().any(|f| f == filter) {
            inner.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    fn publish(&self, topic_name: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner
            .observers
            .retain(|tx| tx.send((topic_name.to_string(), payload.clone())).is_ok());
        inner.deliver(topic_name, &payload);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        let was_connected = inner.connected;
        inner.connected = false;
        inner.subscriptions.clear();
        if was_connected {
            inner.emit(TransportEvent::Disconnected { reason: None });
        }
        inner.events = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_emits_connected_once() {
        let transport = LoopbackTransport::new();
        let mut events = transport.connect(&ConnectOptions::default()).await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        let err = transport.connect(&ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::AlreadyConnected));
    }

    #[tokio::test]
    async fn inject_respects_subscriptions() {
        let transport = LoopbackTransport::new();
        let mut events = transport.connect(&ConnectOptions::default()).await.unwrap();
        events.recv().await;

        assert!(!transport.inject("in/cam1", "x"));
        transport.subscribe("in/+").await.unwrap();
        assert!(transport.inject("in/cam1", "x"));
        assert!(!transport.inject("in/cam1/extra", "x"));

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Message {
                topic: "in/cam1".to_string(),
                payload: Bytes::from_static(b"x"),
            })
        );
    }

    #[tokio::test]
    async fn publish_reaches_observers_and_requires_connection() {
        let transport = LoopbackTransport::new();
        assert!(matches!(
            transport.publish("out/a", Bytes::new()),
            Err(TransportError::NotConnected)
        ));

        let mut outbound = transport.outbound();
        let _events = transport.connect(&ConnectOptions::default()).await.unwrap();
        transport.publish("out/a", Bytes::from_static(b"{}")).unwrap();
        assert_eq!(
            outbound.recv().await,
            Some(("out/a".to_string(), Bytes::from_static(b"{}")))
        );
    }

    #[tokio::test]
    async fn drop_and_restore_connection() {
        let transport = LoopbackTransport::new();
        let mut events = transport.connect(&ConnectOptions::default()).await.unwrap();
        events.recv().await;
        transport.subscribe("in").await.unwrap();

        transport.drop_connection();
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
        assert!(transport.subscriptions().is_empty());
        assert!(!transport.inject("in", "x"));

        transport.restore_connection();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn disconnect_ends_event_stream() {
        let transport = LoopbackTransport::new();
        let mut events = transport.connect(&ConnectOptions::default()).await.unwrap();
        events.recv().await;
        transport.disconnect().await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected { reason: None })
        );
        assert_eq!(events.recv().await, None);
    }
}
