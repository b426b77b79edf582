//! `nodewire` core: request/response envelopes, status codes, and topic layout
//! shared by the node server and its clients.

pub mod message;
pub mod status;
pub mod topic;

pub use message::{MessageKind, ParseError, Request, Response};
pub use status::Status;
pub use topic::Topics;
