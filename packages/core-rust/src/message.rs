//! Request and response envelopes.
//!
//! Inbound payloads are JSON objects carrying at least `name` and `data`.
//! Outbound envelopes always have the same four fields
//! (`type`, `name`, `code`, `data`) regardless of the command, so any
//! subscriber can decode every response the same way.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::status::Status;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A command addressed to a node (or to the control channel when `id` is
/// empty), decoded from one inbound publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id taken from the topic suffix.
    pub id: String,
    /// Command name as received. Matching is case-insensitive; see
    /// [`Request::command`].
    pub name: String,
    /// Arbitrary structured payload.
    pub data: Value,
}

impl Request {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data,
        }
    }

    /// Decodes the envelope body of a request whose id is already known.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::MalformedPayload`] when `raw` is not a JSON
    /// object, lacks `name` or `data`, or `name` is not a string. Extra
    /// fields are ignored.
    pub fn from_envelope(id: &str, raw: &[u8]) -> Result<Self, ParseError> {
        let malformed = |reason: &str| ParseError::MalformedPayload {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let value: Value = serde_json::from_slice(raw).map_err(|e| malformed(&e.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(malformed("payload is not an object"));
        };

        let name = match fields.remove("name") {
            Some(Value::String(name)) => name,
            Some(_) => return Err(malformed("`name` is not a string")),
            None => return Err(malformed("missing `name`")),
        };
        let data = fields.remove("data").ok_or_else(|| malformed("missing `data`"))?;

        Ok(Self {
            id: id.to_string(),
            name,
            data,
        })
    }

    /// Lower-cased command name used for dispatch.
    #[must_use]
    pub fn command(&self) -> String {
        self.name.to_lowercase()
    }

    /// Serializes the request body as a client would publish it.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        json!({ "name": self.name, "data": self.data })
            .to_string()
            .into_bytes()
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Discriminates solicited replies from unsolicited node events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Response,
    Event,
}

/// Outbound envelope published on `{out_prefix}/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub name: String,
    pub code: i32,
    pub data: Value,
}

impl Response {
    /// Successful reply carrying `data`.
    #[must_use]
    pub fn ok(name: impl Into<String>, data: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            name: name.into(),
            code: Status::Ok.code(),
            data,
        }
    }

    /// Successful reply with an empty string payload, the shape used by
    /// `destroy`, `clear`, and `health`.
    #[must_use]
    pub fn ack(name: impl Into<String>) -> Self {
        Self::ok(name, Value::String(String::new()))
    }

    /// Error reply with a human-readable message in `data`.
    #[must_use]
    pub fn error(name: impl Into<String>, status: Status, message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Response,
            name: name.into(),
            code: status.code(),
            data: Value::String(message.into()),
        }
    }

    /// Unsolicited event emitted by a node.
    #[must_use]
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self {
            kind: MessageKind::Event,
            name: name.into(),
            code: Status::Ok.code(),
            data,
        }
    }

    /// Decoded status, `None` for codes this build does not know.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.code)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == Status::Ok.code()
    }

    /// Serializes the envelope with the same derive that [`decode`](Self::decode)
    /// reads, so the two cannot drift apart.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an envelope, as a subscriber would.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when `raw` is not a response envelope.
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

// ---------------------------------------------------------------------------
// ParseError
// ---------------------------------------------------------------------------

/// Failure to turn an inbound publish into a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("topic `{topic}` is outside input prefix `{prefix}`")]
    Topic { topic: String, prefix: String },
    #[error("invalid payload: {reason}")]
    MalformedPayload { id: String, reason: String },
}

impl ParseError {
    /// Best-effort correlation id for the error response. Empty when the
    /// topic itself could not be attributed.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            ParseError::Topic { .. } => "",
            ParseError::MalformedPayload { id, .. } => id,
        }
    }

    /// Both kinds surface to clients as `InvalidArgument`.
    #[must_use]
    pub const fn status(&self) -> Status {
        Status::InvalidArgument
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_minimal_envelope() {
        let req = Request::from_envelope("cam1", br#"{"name":"create","data":{"type":"camera"}}"#)
            .unwrap();
        assert_eq!(req.id, "cam1");
        assert_eq!(req.name, "create");
        assert_eq!(req.data, json!({"type": "camera"}));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let req = Request::from_envelope("x", br#"{"type":3,"name":"Ping","data":null,"seq":9}"#)
            .unwrap();
        assert_eq!(req.name, "Ping");
        assert_eq!(req.data, Value::Null);
        assert_eq!(req.command(), "ping");
    }

    #[test]
    fn non_json_is_malformed_and_keeps_id() {
        let err = Request::from_envelope("cam1", b"\x00\xffnot json").unwrap_err();
        assert!(matches!(err, ParseError::MalformedPayload { .. }));
        assert_eq!(err.id(), "cam1");
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn missing_fields_are_malformed() {
        for raw in [
            &br#"{"data":{}}"#[..],
            br#"{"name":"create"}"#,
            br#"{"name":5,"data":{}}"#,
            br#"[1,2,3]"#,
            br#""create""#,
        ] {
            let err = Request::from_envelope("n", raw).unwrap_err();
            assert!(
                matches!(err, ParseError::MalformedPayload { .. }),
                "{}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn response_wire_shape_is_fixed() {
        let raw = Response::error("create", Status::AlreadyExists, "node already exists: cam1")
            .encode()
            .unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "response",
                "name": "create",
                "code": -11,
                "data": "node already exists: cam1",
            })
        );
    }

    #[test]
    fn event_kind_serializes_lowercase() {
        let raw = Response::event("tick", json!({"count": 1})).encode().unwrap();
        let decoded = Response::decode(&raw).unwrap();
        assert_eq!(decoded.kind, MessageKind::Event);
        assert!(decoded.is_ok());
    }

    #[test]
    fn request_encode_is_accepted_by_parser() {
        let req = Request::new("cam1", "configure", json!({"x": 1}));
        let back = Request::from_envelope("cam1", &req.encode()).unwrap();
        assert_eq!(back, req);
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
        ]
    }

    fn json_value() -> impl Strategy<Value = Value> {
        json_leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn response_round_trip_keeps_fields(
            name in "[a-z_]{1,16}",
            code in prop::sample::select(vec![0, -1, -3, -5, -11, -14]),
            data in json_value(),
        ) {
            let resp = Response { kind: MessageKind::Response, name, code, data };
            let back = Response::decode(&resp.encode().unwrap()).unwrap();
            prop_assert_eq!(back, resp);
        }

        #[test]
        fn arbitrary_bytes_never_panic(raw in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = Request::from_envelope("id", &raw);
        }
    }
}
