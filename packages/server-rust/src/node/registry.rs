//! Node registry: factory table plus the owning map of live nodes.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use nodewire_core::Status;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{NodeError, NodeFactory, NodeHandle, NodeInit, Responder};

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors from structural registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node already exists: {0}")]
    AlreadyExists(String),
    #[error("a node of singleton type `{kind}` already exists: {existing}")]
    SingletonExists { kind: String, existing: String },
    #[error("unknown node type: {0}")]
    UnknownType(String),
    /// The factory answered [`NodeError::Again`]; nothing was installed.
    #[error("node {0} is not ready to be created")]
    NotReady(String),
    #[error("failed to create node {id}: {source}")]
    ConstructionFailed {
        id: String,
        #[source]
        source: NodeError,
    },
}

impl RegistryError {
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            RegistryError::AlreadyExists(_) => Status::AlreadyExists,
            RegistryError::SingletonExists { .. } => Status::Busy,
            RegistryError::UnknownType(_) => Status::InvalidArgument,
            RegistryError::NotReady(_) => Status::Again,
            RegistryError::ConstructionFailed { source, .. } => source.status(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeSpec
// ---------------------------------------------------------------------------

/// Arguments of one `create`.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub kind: String,
    pub config: Value,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

impl NodeSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }
    }

    #[must_use]
    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_dependents(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependents.extend(ids.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// NodeRegistry
// ---------------------------------------------------------------------------

struct FactoryEntry {
    factory: Arc<dyn NodeFactory>,
    singleton: bool,
}

/// Owning table of live nodes keyed by id.
///
/// Lookups go straight to the `DashMap`. Structural changes (create,
/// destroy, clear) are serialized by one registry-wide async lock so that
/// duplicate checks, singleton checks, and dependency starts see a stable
/// view.
pub struct NodeRegistry {
    factories: RwLock<HashMap<String, FactoryEntry>>,
    nodes: DashMap<String, NodeHandle>,
    structure: tokio::sync::Mutex<()>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            nodes: DashMap::new(),
            structure: tokio::sync::Mutex::new(()),
        }
    }

    /// Registers a factory under the lower-cased `kind`. A later registration
    /// of the same kind replaces the earlier one.
    pub fn register<F: NodeFactory>(&self, kind: &str, singleton: bool, factory: F) {
        let kind = kind.to_lowercase();
        debug!(kind = %kind, singleton, "node type registered");
        self.factories.write().insert(
            kind,
            FactoryEntry {
                factory: Arc::new(factory),
                singleton,
            },
        );
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.read().keys().cloned().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Builds and installs a node, then starts it and every node linked to
    /// it whose links are now all live.
    ///
    /// The factory and `on_start` run without the structural lock, so a slow
    /// node never holds up other ids.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::AlreadyExists`] if `spec.id` is live.
    /// - [`RegistryError::SingletonExists`] if the type allows one instance
    ///   and one is live.
    /// - [`RegistryError::UnknownType`] if no factory is registered.
    /// - [`RegistryError::NotReady`] if the factory answered `Again`.
    /// - [`RegistryError::ConstructionFailed`] for any other factory error.
    pub async fn create(
        &self,
        spec: NodeSpec,
        responder: Responder,
    ) -> Result<NodeHandle, RegistryError> {
        let kind = spec.kind.to_lowercase();
        let (factory, singleton) = {
            let _guard = self.structure.lock().await;
            let (factory, singleton) = self.factory(&kind)?;
            self.check_vacancy(&spec.id, &kind, singleton)?;
            (factory, singleton)
        };

        let init = NodeInit {
            id: spec.id.clone(),
            config: spec.config,
            responder,
        };
        let mut node = factory.create(init).await.map_err(|e| match e {
            e if e.is_retryable() => RegistryError::NotReady(spec.id.clone()),
            source => RegistryError::ConstructionFailed {
                id: spec.id.clone(),
                source,
            },
        })?;

        let (handle, startable) = {
            let guard = self.structure.lock().await;
            // Another create may have won the id or the singleton meanwhile.
            if let Err(e) = self.check_vacancy(&spec.id, &kind, singleton) {
                drop(guard);
                if let Err(err) = node.on_destroy().await {
                    warn!(id = %spec.id, error = %err, "teardown of unused node failed");
                }
                return Err(e);
            }

            let handle = NodeHandle::new(
                spec.id.clone(),
                node,
                kind,
                spec.dependencies,
                spec.dependents,
            );
            self.nodes.insert(spec.id.clone(), handle.clone());
            self.record_live();
            info!(id = %spec.id, kind = %handle.kind(), "node created");

            let startable: Vec<NodeHandle> = self
                .nodes
                .iter()
                .filter(|e| e.key() == &spec.id || e.value().is_linked_to(&spec.id))
                .map(|e| e.value().clone())
                .collect();
            (handle, startable)
        };

        for other in startable {
            let started = other.start_if(|| self.links_live(&other)).await;
            if let Err(e) = started {
                warn!(id = %other.id(), error = %e, "node failed to start");
            }
        }
        Ok(handle)
    }

    fn factory(&self, kind: &str) -> Result<(Arc<dyn NodeFactory>, bool), RegistryError> {
        let factories = self.factories.read();
        let entry = factories
            .get(kind)
            .ok_or_else(|| RegistryError::UnknownType(kind.to_string()))?;
        Ok((Arc::clone(&entry.factory), entry.singleton))
    }

    fn check_vacancy(&self, id: &str, kind: &str, singleton: bool) -> Result<(), RegistryError> {
        if self.nodes.contains_key(id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }
        if singleton {
            if let Some(existing) = self.nodes.iter().find(|e| e.value().kind() == kind) {
                return Err(RegistryError::SingletonExists {
                    kind: kind.to_string(),
                    existing: existing.key().clone(),
                });
            }
        }
        Ok(())
    }

    fn links_live(&self, handle: &NodeHandle) -> bool {
        handle.links().all(|l| self.nodes.contains_key(l))
    }

    /// Non-blocking lookup.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<NodeHandle> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Live node ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Removes and tears down `id`, stopping every node linked to it first.
    /// No-op when absent.
    ///
    /// Only the removal holds the structural lock; teardown waits for a
    /// command the node may still be running.
    pub async fn destroy(&self, id: &str) {
        let (handle, linked) = {
            let _guard = self.structure.lock().await;
            let Some((_, handle)) = self.nodes.remove(id) else {
                debug!(id, "destroy of unknown node ignored");
                return;
            };
            self.record_live();
            let linked: Vec<NodeHandle> = self
                .nodes
                .iter()
                .filter(|e| {
                    handle.dependents().iter().any(|d| d == e.key()) || e.value().is_linked_to(id)
                })
                .map(|e| e.value().clone())
                .collect();
            (handle, linked)
        };

        // Anything linked to the departing node can no longer run, unless
        // the id has been created again in the meantime.
        for other in linked {
            if let Err(e) = other.stop_if(|| !self.nodes.contains_key(id)).await {
                warn!(id = %other.id(), error = %e, "failed to stop linked node");
            }
        }
        teardown(id, &handle).await;
    }

    /// Destroys every live node. Each teardown failure is logged and does
    /// not stop the others.
    pub async fn clear(&self) {
        let removed: Vec<(String, NodeHandle)> = {
            let _guard = self.structure.lock().await;
            let removed: Vec<(String, NodeHandle)> = self
                .ids()
                .into_iter()
                .filter_map(|id| self.nodes.remove(&id))
                .collect();
            self.record_live();
            removed
        };
        if !removed.is_empty() {
            info!(count = removed.len(), "clearing nodes");
        }
        for (id, handle) in removed {
            teardown(&id, &handle).await;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_live(&self) {
        metrics::gauge!("nodewire_nodes_live").set(self.nodes.len() as f64);
    }
}

async fn teardown(id: &str, handle: &NodeHandle) {
    match handle.destroy().await {
        Ok(()) => info!(id, "node destroyed"),
        Err(e) => warn!(id, error = %e, "node teardown reported an error"),
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
