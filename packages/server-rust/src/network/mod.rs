//! Broker connectivity: transport abstraction, implementations, session
//! state, and the response publishing path.

pub mod config;
pub mod loopback;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod outbox;
pub mod session;
pub mod transport;

pub use config::{ConnectOptions, ReconnectPolicy};
pub use loopback::LoopbackTransport;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use outbox::Outbox;
pub use session::{ConnectionState, Session};
pub use transport::{EventReceiver, Transport, TransportError, TransportEvent};
