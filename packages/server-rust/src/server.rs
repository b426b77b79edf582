//! Node server with deferred startup lifecycle.
//!
//! `new()` wires the registry and session, `start()` connects the transport
//! and spawns the event loop, `run()` waits for a shutdown signal, and
//! `stop()` tears everything down in order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nodewire_core::{Response, Topics};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::{
    ConnectOptions, EventReceiver, Outbox, Session, Transport, TransportError, TransportEvent,
};
use crate::node::{NodeRegistry, Publish};
use crate::service::{
    build_command_pipeline, CommandPipeline, CommandRouter, DispatchTask, Executor, Sequencer,
    ServerConfig,
};
use crate::service::worker::shutdown_requested;

/// Name of the announcement published on the control output topic.
pub const ANNOUNCE_NAME: &str = "node";

/// Errors from the server lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyStarted,
    #[error("server is not running")]
    NotStarted,
    #[error("server has been stopped and cannot be restarted")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct Running {
    transport: Arc<dyn Transport>,
    executor: Arc<Executor>,
    event_loop: Option<JoinHandle<()>>,
}

/// Bridges a pub/sub transport to the node registry.
///
/// The registry and session are shared via `Arc` so the binary and tests
/// can inspect them while the server runs.
pub struct NodeServer {
    config: ServerConfig,
    registry: Arc<NodeRegistry>,
    session: Arc<Session>,
    running: Option<Running>,
}

impl NodeServer {
    #[must_use]
    pub fn new(config: ServerConfig, registry: Arc<NodeRegistry>) -> Self {
        Self {
            config,
            registry,
            session: Arc::new(Session::new()),
            running: None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.registry)
    }

    /// Connection state and shutdown trigger.
    #[must_use]
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    #[must_use]
    pub fn topics(&self) -> Topics {
        self.config.topics()
    }

    /// Connects the transport and starts the executor and event loop.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyStarted`] or [`ServerError::Stopped`]
    /// for lifecycle misuse, or the transport's connect error.
    pub async fn start(
        &mut self,
        transport: Arc<dyn Transport>,
        options: &ConnectOptions,
    ) -> Result<(), ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        if self.session.is_shutting_down() {
            return Err(ServerError::Stopped);
        }

        self.session.set_connecting();
        let events = match transport.connect(options).await {
            Ok(events) => events,
            Err(e) => {
                self.session.set_disconnected();
                return Err(e.into());
            }
        };

        let topics = self.config.topics();
        let outbox: Arc<dyn Publish> = Arc::new(Outbox::new(
            Arc::clone(&transport),
            topics.clone(),
            Arc::clone(&self.session),
        ));
        let pipeline =
            build_command_pipeline(CommandRouter::new(Arc::clone(&self.registry), Arc::clone(&outbox)));
        let executor = Arc::new(Executor::start(self.config.executor.clone()));

        let inbound = Inbound {
            topics,
            transport: Arc::clone(&transport),
            session: Arc::clone(&self.session),
            outbox,
            sequencer: Arc::new(Sequencer::new()),
            pipeline,
            executor: Arc::clone(&executor),
            announce: self.config.announce,
            command_timeout: self.config.command_timeout,
            next_call_id: 0,
        };
        let event_loop = tokio::spawn(inbound.run(events, self.session.shutdown_receiver()));

        info!(
            input = %self.config.topics().input_prefix(),
            output = %self.config.topics().output_prefix(),
            workers = self.config.executor.workers,
            "node server started"
        );
        self.running = Some(Running {
            transport,
            executor,
            event_loop: Some(event_loop),
        });
        Ok(())
    }

    /// Serves until `shutdown` resolves, the session's shutdown is
    /// triggered, or the transport's event stream ends, then stops.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotStarted`] if `start()` was not called.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()> + Send) -> Result<(), ServerError> {
        let running = self.running.as_mut().ok_or(ServerError::NotStarted)?;
        if let Some(event_loop) = running.event_loop.as_mut() {
            let ended = tokio::select! {
                () = shutdown => {
                    info!("shutdown requested");
                    None
                }
                result = event_loop => Some(result),
            };
            if let Some(result) = ended {
                running.event_loop = None;
                if let Err(e) = result {
                    warn!(error = %e, "event loop ended abnormally");
                }
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Stops the event loop, drains the executor, disconnects, and destroys
    /// every node. Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        info!("stopping node server");
        self.session.trigger_shutdown();

        if let Some(event_loop) = running.event_loop.take() {
            if let Err(e) = event_loop.await {
                warn!(error = %e, "event loop ended abnormally");
            }
        }
        running.executor.stop().await;

        if let Err(e) = running.transport.disconnect().await {
            warn!(error = %e, "transport disconnect failed");
        }
        self.session.set_disconnected();

        self.registry.clear().await;
        info!("node server stopped");
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        if self.running.is_some() {
            self.session.trigger_shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Consumes transport events. Never awaits node logic: requests are parsed,
/// ticketed, and handed to the executor.
struct Inbound {
    topics: Topics,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    outbox: Arc<dyn Publish>,
    sequencer: Arc<Sequencer>,
    pipeline: CommandPipeline,
    executor: Arc<Executor>,
    announce: bool,
    command_timeout: Option<Duration>,
    next_call_id: u64,
}

impl Inbound {
    async fn run(mut self, mut events: EventReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        warn!("transport event stream closed");
                        break;
                    }
                },
            }
        }
        debug!("event loop exited");
    }

    async fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connect().await,
            TransportEvent::Disconnected { reason } => {
                self.session.set_disconnected();
                warn!(reason = reason.as_deref().unwrap_or("closed"), "broker session lost");
            }
            TransportEvent::Message { topic, payload } => self.on_message(&topic, &payload).await,
        }
    }

    async fn on_connect(&mut self) {
        for filter in self.topics.subscriptions() {
            if let Err(e) = self.transport.subscribe(&filter).await {
                warn!(filter = %filter, error = %e, "subscribe failed");
            }
        }
        self.session.set_connected();
        info!(input = %self.topics.input_prefix(), "connected and subscribed");

        if self.announce {
            self.outbox.publish("", Response::ack(ANNOUNCE_NAME));
        }
    }

    async fn on_message(&mut self, topic: &str, payload: &Bytes) {
        let request = match self.topics.parse(topic, payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(topic, error = %e, "rejecting unparsable request");
                self.outbox
                    .publish(e.id(), Response::error("request", e.status(), e.to_string()));
                return;
            }
        };

        self.next_call_id += 1;
        let call_id = self.next_call_id;
        debug!(call_id, id = %request.id, name = %request.name, "request accepted");

        let ticket = self.sequencer.issue(&request.id);
        let task = DispatchTask::new(
            request,
            ticket,
            call_id,
            self.command_timeout,
            self.pipeline.clone(),
            Arc::clone(&self.sequencer),
            Arc::clone(&self.outbox),
        );
        if let Err(e) = self.executor.submit(task).await {
            warn!(call_id, error = %e, "request rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionState, LoopbackTransport};

    #[tokio::test]
    async fn lifecycle_misuse_is_reported() {
        let mut server = NodeServer::new(ServerConfig::default(), Arc::new(NodeRegistry::new()));
        assert!(matches!(
            server.run(std::future::pending()).await,
            Err(ServerError::NotStarted)
        ));

        let transport = Arc::new(LoopbackTransport::new());
        server
            .start(transport.clone(), &ConnectOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            server
                .start(transport.clone(), &ConnectOptions::default())
                .await,
            Err(ServerError::AlreadyStarted)
        ));

        server.stop().await;
        server.stop().await;
        assert_eq!(server.session().state(), ConnectionState::Disconnected);
        assert!(matches!(
            server.start(transport, &ConnectOptions::default()).await,
            Err(ServerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn run_returns_when_session_shutdown_is_triggered() {
        let mut server = NodeServer::new(ServerConfig::default(), Arc::new(NodeRegistry::new()));
        server
            .start(Arc::new(LoopbackTransport::new()), &ConnectOptions::default())
            .await
            .unwrap();
        let session = server.session();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            session.trigger_shutdown();
        });
        server.run(std::future::pending()).await.unwrap();
        assert!(server.session().is_shutting_down());
    }
}
