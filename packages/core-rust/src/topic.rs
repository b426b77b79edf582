//! Topic layout and filter matching.
//!
//! Requests arrive on `{root}/{client_id}/node/in` (control channel) and
//! `{root}/{client_id}/node/in/{id}`; every response goes out on
//! `{root}/{client_id}/node/out/{id}`, with an empty id for the control
//! channel.

use crate::message::{ParseError, Request};

/// Default topic root shared by devices of the same protocol version.
pub const DEFAULT_ROOT: &str = "sscma/v0";

/// Default client id, which also namespaces the device's topics.
pub const DEFAULT_CLIENT_ID: &str = "recamera";

const LEVEL_SEPARATOR: char = '/';

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Input and output prefixes for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    input: String,
    output: String,
}

impl Topics {
    /// Builds the standard `{root}/{client_id}/node/{in,out}` layout.
    #[must_use]
    pub fn new(root: &str, client_id: &str) -> Self {
        let base = format!("{}/{client_id}/node", root.trim_end_matches(LEVEL_SEPARATOR));
        Self {
            input: format!("{base}/in"),
            output: format!("{base}/out"),
        }
    }

    /// Uses explicit prefixes. Trailing separators are dropped.
    #[must_use]
    pub fn with_prefixes(input: &str, output: &str) -> Self {
        Self {
            input: input.trim_end_matches(LEVEL_SEPARATOR).to_string(),
            output: output.trim_end_matches(LEVEL_SEPARATOR).to_string(),
        }
    }

    #[must_use]
    pub fn input_prefix(&self) -> &str {
        &self.input
    }

    #[must_use]
    pub fn output_prefix(&self) -> &str {
        &self.output
    }

    /// Filters to subscribe to: the control topic and the single-level
    /// per-id wildcard.
    #[must_use]
    pub fn subscriptions(&self) -> [String; 2] {
        [self.input.clone(), format!("{}/+", self.input)]
    }

    /// Topic a response for `id` is published on. An empty id yields
    /// `{out_prefix}/`.
    #[must_use]
    pub fn response_topic(&self, id: &str) -> String {
        format!("{}/{id}", self.output)
    }

    /// Topic a client publishes to when addressing `id`.
    #[must_use]
    pub fn request_topic(&self, id: &str) -> String {
        format!("{}/{id}", self.input)
    }

    /// Extracts the correlation id from an inbound topic.
    ///
    /// Returns `None` when `topic` is not under the input prefix. The bare
    /// prefix and the prefix followed by a lone separator both map to the
    /// empty (control) id.
    #[must_use]
    pub fn extract_id<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.input.as_str())?;
        if rest.is_empty() {
            return Some("");
        }
        rest.strip_prefix(LEVEL_SEPARATOR)
    }

    /// Parses one inbound publish into a [`Request`].
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Topic`] for topics outside the input prefix and
    /// [`ParseError::MalformedPayload`] for bodies that are not a
    /// `{name, data}` object.
    pub fn parse(&self, topic: &str, raw: &[u8]) -> Result<Request, ParseError> {
        let id = self.extract_id(topic).ok_or_else(|| ParseError::Topic {
            topic: topic.to_string(),
            prefix: self.input.clone(),
        })?;
        Request::from_envelope(id, raw)
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT, DEFAULT_CLIENT_ID)
    }
}

// ---------------------------------------------------------------------------
// Filter matching
// ---------------------------------------------------------------------------

/// Returns whether `topic` matches the subscription `filter`.
///
/// `+` matches exactly one level (possibly empty) and `#` matches the
/// remaining levels, including none. Wildcards at the first level do not
/// match system topics starting with `$`.
#[must_use]
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
