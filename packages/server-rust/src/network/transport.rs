//! Pub/sub transport abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::config::ConnectOptions;

/// Everything the transport reports to the server's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established (initially or after a reconnect).
    Connected,
    /// Session lost. The transport keeps trying to reconnect.
    Disconnected { reason: Option<String> },
    /// Inbound publish on a subscribed topic.
    Message { topic: String, payload: Bytes },
}

/// Receiving half of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Errors returned by [`Transport`] operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport is already connected")]
    AlreadyConnected,
    #[error("transport client error: {0}")]
    Client(#[from] anyhow::Error),
}

/// A pub/sub broker connection.
///
/// `publish` is synchronous and must not block: it hands the payload to the
/// client's send buffer and returns.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens the session and returns its event stream.
    async fn connect(&self, options: &ConnectOptions) -> Result<EventReceiver, TransportError>;

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
