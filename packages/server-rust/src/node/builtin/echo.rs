use async_trait::async_trait;
use serde_json::{json, Value};

use crate::node::{Node, NodeError, NodeInit, Responder};

pub const KIND: &str = "echo";

/// Replies to every command with the data it received.
///
/// `enabled` (bool) toggles whether replies are sent; `ping` always answers
/// `"pong"`. Config: `{"enabled": bool}`, default enabled.
pub struct EchoNode {
    id: String,
    responder: Responder,
    enabled: bool,
}

impl EchoNode {
    /// Factory entry point.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidArgument`] when `config.enabled` is present
    /// but not a boolean.
    pub async fn build(init: NodeInit) -> Result<Box<dyn Node>, NodeError> {
        let enabled = match init.config.get("enabled") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(NodeError::InvalidArgument(
                    "`enabled` must be a boolean".to_string(),
                ))
            }
        };
        Ok(Box::new(Self {
            id: init.id,
            responder: init.responder,
            enabled,
        }))
    }
}

#[async_trait]
impl Node for EchoNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        KIND
    }

    fn describe(&self) -> Value {
        json!({ "id": self.id, "type": KIND, "enabled": self.enabled })
    }

    async fn on_control(&mut self, command: &str, data: &Value) -> Result<(), NodeError> {
        match command {
            "enabled" => {
                let Value::Bool(enabled) = data else {
                    return Err(NodeError::InvalidArgument(
                        "`enabled` expects a boolean".to_string(),
                    ));
                };
                self.enabled = *enabled;
                self.responder.ok(command, json!({ "enabled": self.enabled }));
            }
            "ping" => self.responder.ok(command, Value::String("pong".to_string())),
            _ if self.enabled => self.responder.ok(command, data.clone()),
            _ => {}
        }
        Ok(())
    }

    async fn on_destroy(&mut self) -> Result<(), NodeError> {
        Ok(())
    }
}
