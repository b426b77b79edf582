//! Command types flowing through the dispatch pipeline.

use std::time::Duration;

use nodewire_core::{Request, Status};
use serde_json::Value;

use crate::node::{NodeError, RegistryError};

/// Control-channel command names, matched after lower-casing.
pub mod control {
    pub const CREATE: &str = "create";
    pub const DESTROY: &str = "destroy";
    pub const CLEAR: &str = "clear";
    pub const HEALTH: &str = "health";

    /// Whether `command` is handled by the server rather than a node.
    #[must_use]
    pub fn is_control(command: &str) -> bool {
        matches!(command, CREATE | DESTROY | CLEAR | HEALTH)
    }
}

/// Per-attempt context carried with every command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Monotonic id assigned when the request was accepted.
    pub call_id: u64,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Deadline for this attempt, if any.
    pub timeout: Option<Duration>,
}

/// One dispatch attempt of a request.
#[derive(Debug, Clone)]
pub struct Command {
    pub ctx: CommandContext,
    /// Correlation id; empty for the control channel.
    pub id: String,
    /// Lower-cased command name.
    pub name: String,
    pub data: Value,
}

impl Command {
    #[must_use]
    pub fn from_request(request: &Request, ctx: CommandContext) -> Self {
        Self {
            ctx,
            id: request.id.clone(),
            name: request.command(),
            data: request.data.clone(),
        }
    }
}

/// Successful result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Publish a code-0 response carrying this data.
    Reply(Value),
    /// Nothing to publish (the node answered itself, or the target is gone).
    Silent,
    /// Precondition not met; run the command again later.
    Retry,
}

/// Errors turned into error responses at the task boundary.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            DispatchError::InvalidArgument(_) => Status::InvalidArgument,
            DispatchError::Registry(e) => e.status(),
            DispatchError::Node(e) => e.status(),
            DispatchError::Timeout { .. } => Status::Timeout,
            DispatchError::Internal(_) => Status::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn command_lowercases_name_only() {
        let request = Request::new("cam1", "SetExposure", json!({"Value": "AUTO"}));
        let ctx = CommandContext {
            call_id: 7,
            attempt: 1,
            timeout: None,
        };
        let cmd = Command::from_request(&request, ctx);
        assert_eq!(cmd.name, "setexposure");
        assert_eq!(cmd.data, json!({"Value": "AUTO"}));
        assert_eq!(cmd.id, "cam1");
    }

    #[test]
    fn control_names() {
        assert!(control::is_control("create"));
        assert!(control::is_control("health"));
        assert!(!control::is_control("Create"));
        assert!(!control::is_control("configure"));
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            DispatchError::InvalidArgument("x".into()).status(),
            Status::InvalidArgument
        );
        assert_eq!(
            DispatchError::Registry(RegistryError::AlreadyExists("a".into())).status(),
            Status::AlreadyExists
        );
        assert_eq!(
            DispatchError::Node(NodeError::Busy("b".into())).status(),
            Status::Busy
        );
        assert_eq!(DispatchError::Timeout { timeout_ms: 5 }.status(), Status::Timeout);
        assert_eq!(DispatchError::Internal("p".into()).status(), Status::Internal);
    }
}
