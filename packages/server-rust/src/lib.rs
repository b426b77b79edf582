//! `nodewire` server: runtime-created nodes behind a pub/sub command
//! dispatcher, with an async executor, per-id ordering, and pluggable
//! transports.

pub mod network;
pub mod node;
pub mod server;
pub mod service;

pub use network::{ConnectOptions, LoopbackTransport, Transport, TransportEvent};
pub use node::{Node, NodeError, NodeFactory, NodeHandle, NodeInit, NodeRegistry, Responder};
pub use server::{NodeServer, ServerError};
pub use service::{ExecutorConfig, ServerConfig};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
