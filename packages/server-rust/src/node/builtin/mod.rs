//! Node types shipped with the server.

pub mod echo;
pub mod ticker;

pub use echo::EchoNode;
pub use ticker::TickerNode;

use super::NodeRegistry;

/// Registers `echo` and the singleton `ticker` type.
pub fn register_builtin(registry: &NodeRegistry) {
    registry.register(echo::KIND, false, EchoNode::build);
    registry.register(ticker::KIND, true, TickerNode::build);
}
