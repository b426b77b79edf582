//! Wire status codes carried in the `code` field of every response.
//!
//! `0` is success; every error kind is a distinct negative integer so that
//! subscribers can branch on the sign alone.

use std::fmt;

/// Result code published in response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// Success.
    Ok = 0,
    /// Precondition not met yet; the request will be retried. Never published
    /// by the dispatcher itself.
    Again = -1,
    /// A deadline or retry budget ran out.
    Timeout = -3,
    /// Device or I/O failure.
    Io = -4,
    /// Malformed payload, missing field, or unknown node type.
    InvalidArgument = -5,
    /// Resource exhaustion (memory, storage).
    NoMemory = -6,
    /// Resource is held elsewhere.
    Busy = -7,
    /// The node does not understand the command.
    NotSupported = -8,
    /// Operation not permitted.
    Permission = -9,
    /// Referenced entity does not exist.
    NotFound = -10,
    /// Duplicate node id or singleton type.
    AlreadyExists = -11,
    /// Anything that does not fit the kinds above.
    Internal = -14,
}

impl Status {
    const ALL: [Status; 12] = [
        Status::Ok,
        Status::Again,
        Status::Timeout,
        Status::Io,
        Status::InvalidArgument,
        Status::NoMemory,
        Status::Busy,
        Status::NotSupported,
        Status::Permission,
        Status::NotFound,
        Status::AlreadyExists,
        Status::Internal,
    ];

    /// Integer value written to the wire.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Maps a wire code back to its variant. Unknown codes yield `None`.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Short lowercase label, used for log fields and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Again => "again",
            Status::Timeout => "timeout",
            Status::Io => "io",
            Status::InvalidArgument => "invalid_argument",
            Status::NoMemory => "no_memory",
            Status::Busy => "busy",
            Status::NotSupported => "not_supported",
            Status::Permission => "permission",
            Status::NotFound => "not_found",
            Status::AlreadyExists => "already_exists",
            Status::Internal => "internal",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.code())
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_is_zero_and_errors_are_negative() {
        assert_eq!(Status::Ok.code(), 0);
        for status in Status::ALL.into_iter().skip(1) {
            assert!(status.code() < 0, "{status} should be negative");
        }
    }

    #[test]
    fn codes_are_unique() {
        let mut codes: Vec<i32> = Status::ALL.iter().map(|s| s.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), Status::ALL.len());
    }

    #[test]
    fn from_code_maps_known_and_rejects_unknown() {
        assert_eq!(Status::from_code(-11), Some(Status::AlreadyExists));
        assert_eq!(Status::from_code(0), Some(Status::Ok));
        assert_eq!(Status::from_code(-2), None);
        assert_eq!(Status::from_code(7), None);
    }

    #[test]
    fn display_includes_label_and_code() {
        assert_eq!(Status::InvalidArgument.to_string(), "invalid_argument(-5)");
    }
}
