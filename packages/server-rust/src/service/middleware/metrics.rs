//! Metrics middleware for commands.
//!
//! Wraps each attempt in a `tracing` span and records
//! `nodewire_commands_total{command,outcome}` and
//! `nodewire_command_duration_seconds{command}` through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{debug_span, Instrument};

use crate::service::command::{control, Command, Dispatch, DispatchError};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments commands with timing and outcome counters.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records command duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Metric label for a command. Node commands are free-form, so they share
/// one label to keep cardinality bounded.
fn command_label(name: &str) -> &'static str {
    match name {
        control::CREATE => control::CREATE,
        control::DESTROY => control::DESTROY,
        control::CLEAR => control::CLEAR,
        control::HEALTH => control::HEALTH,
        _ => "node",
    }
}

fn outcome_label(result: &Result<Dispatch, DispatchError>) -> &'static str {
    match result {
        Ok(Dispatch::Reply(_)) => "reply",
        Ok(Dispatch::Silent) => "silent",
        Ok(Dispatch::Retry) => "retry",
        Err(e) => e.status().as_str(),
    }
}

impl<S> Service<Command> for MetricsService<S>
where
    S: Service<Command, Response = Dispatch, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Dispatch;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatch, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, cmd: Command) -> Self::Future {
        let command = command_label(&cmd.name);
        let span = debug_span!(
            "command",
            call_id = cmd.ctx.call_id,
            attempt = cmd.ctx.attempt,
            id = %cmd.id,
            name = %cmd.name,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(cmd);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                tracing::Span::current().record("outcome", outcome);
                metrics::counter!("nodewire_commands_total", "command" => command, "outcome" => outcome)
                    .increment(1);
                metrics::histogram!("nodewire_command_duration_seconds", "command" => command)
                    .record(elapsed.as_secs_f64());

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::debug!(command, outcome, duration_ms, "command complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::node::NodeError;
    use crate::service::command::CommandContext;

    /// Service answering from a fixed script keyed by command name.
    struct ScriptedService;

    impl Service<Command> for ScriptedService {
        type Response = Dispatch;
        type Error = DispatchError;
        type Future = Pin<Box<dyn Future<Output = Result<Dispatch, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, cmd: Command) -> Self::Future {
            Box::pin(async move {
                match cmd.name.as_str() {
                    "fail" => Err(DispatchError::Node(NodeError::Busy("held".into()))),
                    _ => Ok(Dispatch::Reply(cmd.data)),
                }
            })
        }
    }

    fn make_cmd(name: &str) -> Command {
        Command {
            ctx: CommandContext {
                call_id: 42,
                attempt: 1,
                timeout: None,
            },
            id: "cam1".to_string(),
            name: name.to_string(),
            data: json!({"k": 1}),
        }
    }

    #[tokio::test]
    async fn passes_through_response_and_error() {
        let svc = MetricsLayer.layer(ScriptedService);
        let resp = svc.oneshot(make_cmd("health")).await.unwrap();
        assert_eq!(resp, Dispatch::Reply(json!({"k": 1})));

        let svc = MetricsLayer.layer(ScriptedService);
        let err = svc.oneshot(make_cmd("fail")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Node(NodeError::Busy(_))));
    }

    #[test]
    fn labels_are_bounded() {
        assert_eq!(command_label("create"), "create");
        assert_eq!(command_label("setexposure"), "node");
        assert_eq!(outcome_label(&Ok(Dispatch::Retry)), "retry");
        assert_eq!(outcome_label(&Ok(Dispatch::Reply(Value::Null))), "reply");
        assert_eq!(
            outcome_label(&Err(DispatchError::Timeout { timeout_ms: 1 })),
            "timeout"
        );
    }
}
