//! Timeout middleware for commands.
//!
//! Fails a node command that exceeds `ctx.timeout` with
//! `DispatchError::Timeout`. Control commands and commands without a deadline
//! pass through untouched: create, destroy and clear always run to completion
//! so the registry never holds a half-started or half-torn-down node.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use crate::service::command::{control, Command, Dispatch, DispatchError};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that enforces the deadline carried in each command's context.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces per-command timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Command> for TimeoutService<S>
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
        let deadline = cmd.ctx.timeout.filter(|_| !control::is_control(&cmd.name));
        let fut = self.inner.call(cmd);
        Box::pin(async move {
            let Some(duration) = deadline else {
                return fut.await;
            };
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = duration.as_millis() as u64;
                    Err(DispatchError::Timeout { timeout_ms })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::service::command::CommandContext;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<Command> for SlowService {
        type Response = Dispatch;
        type Error = DispatchError;
        type Future = Pin<Box<dyn Future<Output = Result<Dispatch, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _cmd: Command) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Dispatch::Silent)
            })
        }
    }

    fn make_cmd(timeout_ms: Option<u64>) -> Command {
        named_cmd("configure", timeout_ms)
    }

    fn named_cmd(name: &str, timeout_ms: Option<u64>) -> Command {
        Command {
            ctx: CommandContext {
                call_id: 1,
                attempt: 1,
                timeout: timeout_ms.map(Duration::from_millis),
            },
            id: "cam1".to_string(),
            name: name.to_string(),
            data: Value::Null,
        }
    }

    #[tokio::test]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer.layer(SlowService { delay_ms: 10 });
        let resp = svc.oneshot(make_cmd(Some(1000))).await.unwrap();
        assert_eq!(resp, Dispatch::Silent);
    }

    #[tokio::test(start_paused = true)]
    async fn exceeds_timeout_returns_error() {
        let svc = TimeoutLayer.layer(SlowService { delay_ms: 200 });
        let err = svc.oneshot(make_cmd(Some(50))).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test(start_paused = true)]
    async fn no_deadline_waits_indefinitely() {
        let svc = TimeoutLayer.layer(SlowService { delay_ms: 60_000 });
        let resp = svc.oneshot(make_cmd(None)).await.unwrap();
        assert_eq!(resp, Dispatch::Silent);
    }

    #[tokio::test(start_paused = true)]
    async fn control_commands_ignore_the_deadline() {
        for name in ["create", "destroy", "clear"] {
            let svc = TimeoutLayer.layer(SlowService { delay_ms: 500 });
            let resp = svc.oneshot(named_cmd(name, Some(50))).await.unwrap();
            assert_eq!(resp, Dispatch::Silent, "{name}");
        }
    }
}
