//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::command::{Command, Dispatch, DispatchError};
use crate::service::router::CommandRouter;

/// Type-erased, cloneable dispatch pipeline shared by all dispatch tasks.
pub type CommandPipeline = BoxCloneService<Command, Dispatch, DispatchError>;

/// Build the command pipeline by wrapping the `CommandRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- record timing and outcome, including timeouts
/// 2. `TimeoutLayer` -- enforce the per-command deadline, if any
#[must_use]
pub fn build_command_pipeline(router: CommandRouter) -> CommandPipeline {
    let svc = ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(TimeoutLayer)
        .service(router);
    BoxCloneService::new(svc)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::node::testing::CaptureSink;
    use crate::node::{Node, NodeError, NodeInit, NodeRegistry, NodeState};
    use crate::service::command::CommandContext;

    struct Sleepy {
        id: String,
    }

    #[async_trait]
    impl Node for Sleepy {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &str {
            "sleepy"
        }

        async fn on_start(&mut self) -> Result<(), NodeError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }

        async fn on_control(&mut self, _command: &str, _data: &Value) -> Result<(), NodeError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }

        async fn on_destroy(&mut self) -> Result<(), NodeError> {
            Ok(())
        }
    }

    fn make_cmd(id: &str, name: &str, data: Value, timeout: Option<Duration>) -> Command {
        Command {
            ctx: CommandContext {
                call_id: 42,
                attempt: 1,
                timeout,
            },
            id: id.to_string(),
            name: name.to_string(),
            data,
        }
    }

    fn sleepy_pipeline() -> (Arc<NodeRegistry>, CommandPipeline) {
        let registry = Arc::new(NodeRegistry::new());
        registry.register("sleepy", false, |init: NodeInit| async move {
            Ok::<Box<dyn Node>, NodeError>(Box::new(Sleepy { id: init.id }))
        });
        let router = CommandRouter::new(Arc::clone(&registry), Arc::new(CaptureSink::default()));
        (registry, build_command_pipeline(router))
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_routes_through_all_layers() {
        let (_registry, pipeline) = sleepy_pipeline();

        let resp = pipeline
            .clone()
            .oneshot(make_cmd("s", "create", json!({"type": "sleepy"}), None))
            .await
            .unwrap();
        assert_eq!(resp, Dispatch::Reply(json!({"id": "s", "type": "sleepy"})));

        let err = pipeline
            .clone()
            .oneshot(make_cmd("s", "nap", Value::Null, Some(Duration::from_millis(100))))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { timeout_ms: 100 }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_start_completes_under_a_deadline() {
        let (registry, pipeline) = sleepy_pipeline();
        let deadline = Some(Duration::from_millis(50));

        let resp = pipeline
            .clone()
            .oneshot(make_cmd("s", "create", json!({"type": "sleepy"}), deadline))
            .await
            .unwrap();
        assert_eq!(resp, Dispatch::Reply(json!({"id": "s", "type": "sleepy"})));
        assert_eq!(registry.find("s").unwrap().state(), NodeState::Started);

        pipeline
            .clone()
            .oneshot(make_cmd("s", "destroy", Value::Null, deadline))
            .await
            .unwrap();
        assert!(registry.find("s").is_none());
    }
}
