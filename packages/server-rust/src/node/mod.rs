//! Node contract and lifecycle.
//!
//! A node is a stateful worker created at runtime by a type-keyed
//! [`NodeFactory`] and addressed by its id. The registry owns every node
//! behind a [`NodeHandle`], which serializes calls into the node and tracks
//! its [`NodeState`].

pub mod builtin;
pub mod registry;

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use nodewire_core::{Response, Status};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub use registry::{NodeRegistry, NodeSpec, RegistryError};

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

/// Errors returned by node construction and node callbacks.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Precondition not met yet. The dispatcher retries the command instead
    /// of reporting it.
    #[error("not ready, try again")]
    Again,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("device error: {0}")]
    Io(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("out of resources: {0}")]
    NoMemory(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NodeError {
    /// Wire status this error is reported with.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            NodeError::Again => Status::Again,
            NodeError::InvalidArgument(_) => Status::InvalidArgument,
            NodeError::Io(_) => Status::Io,
            NodeError::Busy(_) => Status::Busy,
            NodeError::NotSupported(_) => Status::NotSupported,
            NodeError::NoMemory(_) => Status::NoMemory,
            NodeError::Permission(_) => Status::Permission,
            NodeError::NotFound(_) => Status::NotFound,
            NodeError::Other(_) => Status::Internal,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Again)
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Sink that delivers envelopes to `{out_prefix}/{id}`.
///
/// Implementations must not block: publishing is fire-and-forget.
pub trait Publish: Send + Sync + 'static {
    fn publish(&self, id: &str, response: Response);
}

/// Publishing handle bound to one id, given to nodes at construction.
#[derive(Clone)]
pub struct Responder {
    id: Arc<str>,
    sink: Arc<dyn Publish>,
}

impl Responder {
    #[must_use]
    pub fn new(id: &str, sink: Arc<dyn Publish>) -> Self {
        Self {
            id: Arc::from(id),
            sink,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Same sink, different id.
    #[must_use]
    pub fn for_id(&self, id: &str) -> Self {
        Self::new(id, Arc::clone(&self.sink))
    }

    pub fn send(&self, response: Response) {
        self.sink.publish(&self.id, response);
    }

    pub fn ok(&self, name: &str, data: Value) {
        self.send(Response::ok(name, data));
    }

    pub fn error(&self, name: &str, err: &NodeError) {
        self.send(Response::error(name, err.status(), err.to_string()));
    }

    pub fn event(&self, name: &str, data: Value) {
        self.send(Response::event(name, data));
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Node trait
// ---------------------------------------------------------------------------

/// Everything a factory needs to build one node.
#[derive(Debug, Clone)]
pub struct NodeInit {
    pub id: String,
    pub config: Value,
    pub responder: Responder,
}

/// A runtime-created worker addressed by id.
///
/// Callbacks are never invoked concurrently for one instance; the owning
/// [`NodeHandle`] holds an async mutex around the node.
#[async_trait]
pub trait Node: Send + 'static {
    fn id(&self) -> &str;

    /// Lower-cased type name the node was created with.
    fn kind(&self) -> &str;

    /// Data returned in the `create` response.
    fn describe(&self) -> Value {
        json!({ "id": self.id(), "type": self.kind() })
    }

    /// Called once every declared dependency is live.
    async fn on_start(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Handles one lower-cased command. The node publishes its own replies
    /// through its [`Responder`].
    async fn on_control(&mut self, command: &str, data: &Value) -> Result<(), NodeError>;

    /// Reverse of `on_start`. The node may be started again later.
    async fn on_stop(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Releases every resource. Must be idempotent and must finish teardown
    /// even when part of it fails.
    async fn on_destroy(&mut self) -> Result<(), NodeError>;
}

/// Builds nodes of one type.
///
/// Resources acquired before a construction failure must be released before
/// returning the error.
#[async_trait]
pub trait NodeFactory: Send + Sync + 'static {
    async fn create(&self, init: NodeInit) -> Result<Box<dyn Node>, NodeError>;
}

#[async_trait]
impl<F, Fut> NodeFactory for F
where
    F: Fn(NodeInit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Box<dyn Node>, NodeError>> + Send + 'static,
{
    async fn create(&self, init: NodeInit) -> Result<Box<dyn Node>, NodeError> {
        (self)(init).await
    }
}

// ---------------------------------------------------------------------------
// NodeHandle
// ---------------------------------------------------------------------------

/// Lifecycle state of a constructed node.
///
/// `Ready -> Started <-> Ready -> Destroyed`; nothing leaves `Destroyed`.
/// A node that is still being built by its factory has no handle yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Ready,
    Started,
    Destroyed,
}

struct NodeSlot {
    id: String,
    kind: String,
    dependencies: Vec<String>,
    dependents: Vec<String>,
    /// Written only while `node` is locked; read without locking.
    state: ArcSwap<NodeState>,
    node: tokio::sync::Mutex<Box<dyn Node>>,
}

/// Shared handle to a registered node.
///
/// Every call into the node locks it, so commands, lifecycle transitions,
/// and teardown for one node never overlap. Reading the state does not
/// wait for a running command.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeSlot>,
}

impl NodeHandle {
    pub(crate) fn new(
        id: String,
        node: Box<dyn Node>,
        kind: String,
        dependencies: Vec<String>,
        dependents: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeSlot {
                id,
                kind,
                dependencies,
                dependents,
                state: ArcSwap::from_pointee(NodeState::Ready),
                node: tokio::sync::Mutex::new(node),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Ids that must be live before this node starts.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.inner.dependencies
    }

    /// Ids that are stopped when this node is destroyed, and that must also
    /// be live before it starts.
    #[must_use]
    pub fn dependents(&self) -> &[String] {
        &self.inner.dependents
    }

    /// Every id this node is linked to, in either direction.
    pub fn links(&self) -> impl Iterator<Item = &str> {
        self.inner
            .dependencies
            .iter()
            .chain(self.inner.dependents.iter())
            .map(String::as_str)
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        **self.inner.state.load()
    }

    /// Whether this node names `id` as a dependency or dependent.
    #[must_use]
    pub fn is_linked_to(&self, id: &str) -> bool {
        self.links().any(|l| l == id)
    }

    fn set_state(&self, state: NodeState) {
        self.inner.state.store(Arc::new(state));
    }

    pub async fn describe(&self) -> Value {
        self.inner.node.lock().await.describe()
    }

    /// Forwards one command to the node.
    ///
    /// Returns `Ok(false)` without calling the node when it has already been
    /// destroyed.
    ///
    /// # Errors
    ///
    /// Propagates the node's error, including [`NodeError::Again`].
    pub async fn control(&self, command: &str, data: &Value) -> Result<bool, NodeError> {
        let mut node = self.inner.node.lock().await;
        if self.state() == NodeState::Destroyed {
            return Ok(false);
        }
        node.on_control(command, data).await?;
        Ok(true)
    }

    /// Moves a `Ready` node to `Started`. Returns whether this call started it.
    ///
    /// # Errors
    ///
    /// Propagates the node's `on_start` error; the node stays `Ready`.
    pub async fn start(&self) -> Result<bool, NodeError> {
        self.start_if(|| true).await
    }

    /// Like [`start`](Self::start), but `ready` is checked once the node is
    /// locked and the node is left alone when it says no.
    pub(crate) async fn start_if(&self, ready: impl FnOnce() -> bool) -> Result<bool, NodeError> {
        let mut node = self.inner.node.lock().await;
        if self.state() != NodeState::Ready || !ready() {
            return Ok(false);
        }
        node.on_start().await?;
        self.set_state(NodeState::Started);
        debug!(id = %self.inner.id, "node started");
        Ok(true)
    }

    /// Moves a `Started` node back to `Ready`. Returns whether this call
    /// stopped it.
    ///
    /// # Errors
    ///
    /// Propagates the node's `on_stop` error; the node is still marked `Ready`.
    pub async fn stop(&self) -> Result<bool, NodeError> {
        self.stop_if(|| true).await
    }

    /// Like [`stop`](Self::stop), with `stale` checked under the node lock.
    pub(crate) async fn stop_if(&self, stale: impl FnOnce() -> bool) -> Result<bool, NodeError> {
        let mut node = self.inner.node.lock().await;
        if self.state() != NodeState::Started || !stale() {
            return Ok(false);
        }
        self.set_state(NodeState::Ready);
        node.on_stop().await?;
        debug!(id = %self.inner.id, "node stopped");
        Ok(true)
    }

    /// Stops (if started) and tears the node down. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the `on_destroy` error. The node is `Destroyed` either way.
    pub async fn destroy(&self) -> Result<(), NodeError> {
        let mut node = self.inner.node.lock().await;
        match self.state() {
            NodeState::Destroyed => return Ok(()),
            NodeState::Started => {
                if let Err(e) = node.on_stop().await {
                    warn!(id = %self.inner.id, error = %e, "stop during destroy failed");
                }
            }
            NodeState::Ready => {}
        }
        self.set_state(NodeState::Destroyed);
        node.on_destroy().await
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Sink that records every published `(id, response)` pair.
    #[derive(Default)]
    pub struct CaptureSink {
        pub published: Mutex<Vec<(String, Response)>>,
    }

    impl CaptureSink {
        pub fn take(&self) -> Vec<(String, Response)> {
            std::mem::take(&mut *self.published.lock())
        }
    }

    impl Publish for CaptureSink {
        fn publish(&self, id: &str, response: Response) {
            self.published.lock().push((id.to_string(), response));
        }
    }

    /// Node recording every callback into a shared log.
    pub struct RecordingNode {
        pub id: String,
        pub log: Arc<Mutex<Vec<String>>>,
        pub responder: Responder,
    }

    #[async_trait]
    impl Node for RecordingNode {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &str {
            "recording"
        }

        async fn on_start(&mut self) -> Result<(), NodeError> {
            self.log.lock().push(format!("{}:start", self.id));
            Ok(())
        }

        async fn on_control(&mut self, command: &str, data: &Value) -> Result<(), NodeError> {
            self.log.lock().push(format!("{}:{command}", self.id));
            match command {
                "fail" => Err(NodeError::Io("sensor offline".to_string())),
                _ => {
                    self.responder.ok(command, data.clone());
                    Ok(())
                }
            }
        }

        async fn on_stop(&mut self) -> Result<(), NodeError> {
            self.log.lock().push(format!("{}:stop", self.id));
            Ok(())
        }

        async fn on_destroy(&mut self) -> Result<(), NodeError> {
            self.log.lock().push(format!("{}:destroy", self.id));
            Ok(())
        }
    }
}
