//! Response publishing path shared by the dispatcher and every node.

use std::sync::Arc;

use nodewire_core::{Response, Topics};
use tracing::{debug, warn};

use super::session::Session;
use super::transport::Transport;
use crate::node::Publish;

/// Encodes responses and hands them to the transport.
///
/// Publishes while the session is not connected are dropped.
pub struct Outbox {
    transport: Arc<dyn Transport>,
    topics: Topics,
    session: Arc<Session>,
}

impl Outbox {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, topics: Topics, session: Arc<Session>) -> Self {
        Self {
            transport,
            topics,
            session,
        }
    }
}

impl Publish for Outbox {
    fn publish(&self, id: &str, response: Response) {
        if !self.session.is_connected() {
            debug!(id, name = %response.name, "not connected, response dropped");
            return;
        }
        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id, name = %response.name, error = %e, "response encoding failed");
                return;
            }
        };
        let topic = self.topics.response_topic(id);
        if let Err(e) = self.transport.publish(&topic, payload.into()) {
            warn!(topic = %topic, error = %e, "publish failed");
        }
    }
}
