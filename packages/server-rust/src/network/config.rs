//! Transport connection configuration.

use std::time::Duration;

use nodewire_core::topic::DEFAULT_CLIENT_ID;

/// Broker connection settings handed to [`Transport::connect`](super::Transport::connect).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Credentials are only sent when both are present and non-empty.
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub reconnect: ReconnectPolicy,
    /// Capacity of the client's outbound request buffer.
    pub outbound_capacity: usize,
}

impl ConnectOptions {
    /// Returns the credential pair when both halves are set and non-empty.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
            outbound_capacity: 256,
        }
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay following `current`, doubled and capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}
