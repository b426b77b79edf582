//! The executor task that applies one request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodewire_core::{Request, Response, Status};
use tower::ServiceExt;
use tracing::{debug, error, warn};

use super::command::{Command, CommandContext, Dispatch, DispatchError};
use super::middleware::CommandPipeline;
use super::sequencer::{Sequencer, Ticket};
use super::worker::{AbandonReason, Outcome, Task, Wakeup};
use crate::node::Publish;

/// Applies one request to the registry or its node.
///
/// The task stays parked until its ticket reaches the head of the id's lane,
/// runs the pipeline inside its own tokio task so a panicking node cannot
/// take a worker down, and publishes at most one envelope. It keeps its
/// ticket while the command answers `Retry`.
pub struct DispatchTask {
    request: Request,
    command: String,
    ticket: Ticket,
    call_id: u64,
    attempt: u32,
    timeout: Option<Duration>,
    pipeline: CommandPipeline,
    sequencer: Arc<Sequencer>,
    sink: Arc<dyn Publish>,
}

impl DispatchTask {
    #[must_use]
    pub fn new(
        request: Request,
        ticket: Ticket,
        call_id: u64,
        timeout: Option<Duration>,
        pipeline: CommandPipeline,
        sequencer: Arc<Sequencer>,
        sink: Arc<dyn Publish>,
    ) -> Self {
        let command = request.command();
        Self {
            request,
            command,
            ticket,
            call_id,
            attempt: 0,
            timeout,
            pipeline,
            sequencer,
            sink,
        }
    }

    async fn dispatch(&mut self) -> Result<Dispatch, DispatchError> {
        self.attempt += 1;
        let cmd = Command::from_request(
            &self.request,
            CommandContext {
                call_id: self.call_id,
                attempt: self.attempt,
                timeout: self.timeout,
            },
        );
        let call = self.pipeline.clone().oneshot(cmd);
        match tokio::spawn(call).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                error!(
                    id = %self.request.id,
                    command = %self.command,
                    "node panicked while handling command"
                );
                Err(DispatchError::Internal("command handler panicked".to_string()))
            }
            Err(join) => Err(DispatchError::Internal(join.to_string())),
        }
    }

    fn publish(&self, response: Response) {
        self.sink.publish(&self.request.id, response);
    }
}

#[async_trait]
impl Task for DispatchTask {
    fn blocked_on(&self) -> Option<Wakeup> {
        if self.sequencer.is_current(&self.ticket) {
            None
        } else {
            Some(Box::pin(self.sequencer.wait_turn(&self.ticket)))
        }
    }

    async fn run(&mut self) -> Outcome {
        if !self.sequencer.is_current(&self.ticket) {
            return Outcome::Retry;
        }

        match self.dispatch().await {
            Ok(Dispatch::Retry) => return Outcome::Retry,
            Ok(Dispatch::Reply(data)) => self.publish(Response::ok(self.command.clone(), data)),
            Ok(Dispatch::Silent) => {}
            Err(e) => {
                let status = e.status();
                debug!(
                    id = %self.request.id,
                    command = %self.command,
                    code = status.code(),
                    error = %e,
                    "command failed"
                );
                self.publish(Response::error(self.command.clone(), status, e.to_string()));
            }
        }

        self.sequencer.complete(&self.ticket);
        Outcome::Done
    }

    async fn abandon(&mut self, reason: AbandonReason) {
        let (status, message) = match reason {
            AbandonReason::RetryBudget { attempts } => (
                Status::Timeout,
                format!("gave up after {attempts} attempts"),
            ),
            AbandonReason::Shutdown => (Status::Busy, "server is shutting down".to_string()),
        };
        warn!(
            id = %self.request.id,
            command = %self.command,
            code = status.code(),
            "{message}"
        );
        self.publish(Response::error(self.command.clone(), status, message));
        self.sequencer.complete(&self.ticket);
    }
}
