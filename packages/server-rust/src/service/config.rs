use std::time::Duration;

use nodewire_core::topic::{DEFAULT_CLIENT_ID, DEFAULT_ROOT};
use nodewire_core::Topics;

/// Server-level configuration for the node server.
///
/// Controls topic layout, the startup announcement, the executor pool, and
/// the optional per-command deadline.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Topic root shared by devices speaking the same protocol version.
    pub topic_root: String,
    /// Client id; also namespaces this device's topics.
    pub client_id: String,
    /// Publish a `node` announcement on the control output topic after
    /// every (re)connect.
    pub announce: bool,
    /// Worker pool and retry settings.
    pub executor: ExecutorConfig,
    /// Deadline for one attempt of a node command. Control commands always
    /// run to completion. `None` disables the timeout layer.
    pub command_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Topic layout derived from `topic_root` and `client_id`.
    #[must_use]
    pub fn topics(&self) -> Topics {
        Topics::new(&self.topic_root, &self.client_id)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            topic_root: DEFAULT_ROOT.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            announce: true,
            executor: ExecutorConfig::default(),
            command_timeout: None,
        }
    }
}

/// Configuration for the dispatch executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker tasks pulling from the shared queue.
    pub workers: usize,
    /// Delay before a task that answered `Retry` is queued again.
    pub retry_delay: Duration,
    /// Retries allowed before a task is abandoned. `None` retries forever.
    pub max_retries: Option<u32>,
    /// How long `stop()` waits for queued and delayed tasks to be abandoned.
    pub drain_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_delay: Duration::from_millis(10),
            max_retries: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}
