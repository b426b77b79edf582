//! Command routing: control commands go to the registry, everything else to
//! the addressed node.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::{json, Value};
use tower::Service;
use tracing::debug;

use super::command::{control, Command, Dispatch, DispatchError};
use crate::node::{NodeRegistry, NodeSpec, Publish, RegistryError, Responder};

type RouterFuture = Pin<Box<dyn Future<Output = Result<Dispatch, DispatchError>> + Send>>;

/// Innermost service of the dispatch pipeline.
#[derive(Clone)]
pub struct CommandRouter {
    registry: Arc<NodeRegistry>,
    sink: Arc<dyn Publish>,
}

impl CommandRouter {
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, sink: Arc<dyn Publish>) -> Self {
        Self { registry, sink }
    }

    async fn route(self, cmd: Command) -> Result<Dispatch, DispatchError> {
        match cmd.name.as_str() {
            control::CREATE => self.create(cmd).await,
            control::DESTROY => {
                self.registry.destroy(&cmd.id).await;
                Ok(Dispatch::Reply(Value::String(String::new())))
            }
            control::CLEAR => {
                self.registry.clear().await;
                Ok(Dispatch::Reply(Value::String(String::new())))
            }
            control::HEALTH => Ok(Dispatch::Reply(Value::String(String::new()))),
            _ => self.forward(cmd).await,
        }
    }

    async fn create(&self, cmd: Command) -> Result<Dispatch, DispatchError> {
        let kind = cmd
            .data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::InvalidArgument("missing string field `type`".into()))?;
        let config = match cmd.data.get("config") {
            None | Some(Value::Null) => json!({}),
            Some(config) => config.clone(),
        };
        let spec = NodeSpec::new(cmd.id.clone(), kind, config)
            .depends_on(id_list(&cmd.data, "dependencies")?)
            .with_dependents(id_list(&cmd.data, "dependents")?);

        let responder = Responder::new(&cmd.id, Arc::clone(&self.sink));
        match self.registry.create(spec, responder).await {
            Ok(handle) => Ok(Dispatch::Reply(handle.describe().await)),
            Err(RegistryError::NotReady(id)) => {
                debug!(id = %id, "node not ready, create will be retried");
                Ok(Dispatch::Retry)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn forward(&self, cmd: Command) -> Result<Dispatch, DispatchError> {
        let Some(handle) = self.registry.find(&cmd.id) else {
            debug!(id = %cmd.id, command = %cmd.name, "no such node, command dropped");
            return Ok(Dispatch::Silent);
        };
        match handle.control(&cmd.name, &cmd.data).await {
            Ok(delivered) => {
                if !delivered {
                    debug!(id = %cmd.id, command = %cmd.name, "node destroyed before delivery");
                }
                Ok(Dispatch::Silent)
            }
            Err(e) if e.is_retryable() => Ok(Dispatch::Retry),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reads an optional array of string ids.
fn id_list(data: &Value, field: &str) -> Result<Vec<String>, DispatchError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    DispatchError::InvalidArgument(format!("`{field}` must contain only strings"))
                })
            })
            .collect(),
        Some(_) => Err(DispatchError::InvalidArgument(format!(
            "`{field}` must be an array of ids"
        ))),
    }
}

impl Service<Command> for CommandRouter {
    type Response = Dispatch;
    type Error = DispatchError;
    type Future = RouterFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, cmd: Command) -> Self::Future {
        Box::pin(self.clone().route(cmd))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use nodewire_core::Status;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    use super::*;
    use crate::node::builtin::register_builtin;
    use crate::node::testing::{CaptureSink, RecordingNode};
    use crate::node::{Node, NodeError, NodeInit};
    use crate::service::command::CommandContext;

    struct Fixture {
        router: CommandRouter,
        registry: Arc<NodeRegistry>,
        sink: Arc<CaptureSink>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(NodeRegistry::new());
        register_builtin(&registry);
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory_log = Arc::clone(&log);
        registry.register("recording", false, move |init: NodeInit| {
            let log = Arc::clone(&factory_log);
            async move {
                Ok::<Box<dyn Node>, NodeError>(Box::new(RecordingNode {
                    id: init.id,
                    log,
                    responder: init.responder,
                }))
            }
        });
        let sink = Arc::new(CaptureSink::default());
        Fixture {
            router: CommandRouter::new(Arc::clone(&registry), sink.clone()),
            registry,
            sink,
            log,
        }
    }

    fn cmd(id: &str, name: &str, data: Value) -> Command {
        Command {
            ctx: CommandContext {
                call_id: 1,
                attempt: 1,
                timeout: None,
            },
            id: id.to_string(),
            name: name.to_string(),
            data,
        }
    }

    async fn send(fx: &Fixture, command: Command) -> Result<Dispatch, DispatchError> {
        fx.router.clone().oneshot(command).await
    }

    #[tokio::test]
    async fn create_replies_with_description() {
        let fx = fixture();
        let out = send(&fx, cmd("e1", "create", json!({"type": "echo"}))).await.unwrap();
        assert_eq!(
            out,
            Dispatch::Reply(json!({"id": "e1", "type": "echo", "enabled": true}))
        );
        assert!(fx.registry.contains("e1"));
    }

    #[tokio::test]
    async fn create_without_type_is_invalid() {
        let fx = fixture();
        let err = send(&fx, cmd("e1", "create", json!({}))).await.unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);

        let err = send(&fx, cmd("e1", "create", json!({"type": 4}))).await.unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_bad_dependency_lists() {
        let fx = fixture();
        let err = send(
            &fx,
            cmd("e1", "create", json!({"type": "echo", "dependencies": "cam"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);

        let err = send(
            &fx,
            cmd("e1", "create", json!({"type": "echo", "dependents": [1]})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let fx = fixture();
        send(&fx, cmd("e1", "create", json!({"type": "echo"}))).await.unwrap();
        let err = send(&fx, cmd("e1", "create", json!({"type": "echo"}))).await.unwrap_err();
        assert_eq!(err.status(), Status::AlreadyExists);
    }

    #[tokio::test]
    async fn create_not_ready_retries() {
        let fx = fixture();
        fx.registry.register("warming", false, |_init: NodeInit| async {
            Err::<Box<dyn Node>, NodeError>(NodeError::Again)
        });
        let out = send(&fx, cmd("w", "create", json!({"type": "warming"}))).await.unwrap();
        assert_eq!(out, Dispatch::Retry);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn destroy_and_clear_always_ack() {
        let fx = fixture();
        let empty = Dispatch::Reply(Value::String(String::new()));
        assert_eq!(send(&fx, cmd("ghost", "destroy", json!({}))).await.unwrap(), empty);

        send(&fx, cmd("a", "create", json!({"type": "echo"}))).await.unwrap();
        send(&fx, cmd("b", "create", json!({"type": "echo"}))).await.unwrap();
        assert_eq!(send(&fx, cmd("", "clear", json!({}))).await.unwrap(), empty);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn health_needs_no_node() {
        let fx = fixture();
        let out = send(&fx, cmd("", "health", Value::Null)).await.unwrap();
        assert_eq!(out, Dispatch::Reply(Value::String(String::new())));
    }

    #[tokio::test]
    async fn unknown_node_is_silent() {
        let fx = fixture();
        let out = send(&fx, cmd("ghost", "configure", json!({}))).await.unwrap();
        assert_eq!(out, Dispatch::Silent);
        assert!(fx.sink.take().is_empty());
    }

    #[tokio::test]
    async fn node_commands_are_forwarded() {
        let fx = fixture();
        send(&fx, cmd("r", "create", json!({"type": "recording"}))).await.unwrap();
        let out = send(&fx, cmd("r", "setexposure", json!({"v": "AUTO"}))).await.unwrap();
        assert_eq!(out, Dispatch::Silent);
        assert_eq!(*fx.log.lock(), vec!["r:start", "r:setexposure"]);

        let published = fx.sink.take();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.data, json!({"v": "AUTO"}));

        let err = send(&fx, cmd("r", "fail", json!({}))).await.unwrap_err();
        assert_eq!(err.status(), Status::Io);
    }
}
