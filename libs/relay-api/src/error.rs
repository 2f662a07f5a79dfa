use std::fmt;

/// Category of a transport error. Lets the client decide between
/// retrying, reconnecting and failing fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid endpoint or client configuration. Permanent.
    Config,
    /// I/O or network error. Transient: reconnect and retry.
    Io,
    /// The broker has no destination for the message (unknown topic/partition).
    Unroutable,
    /// The connection was closed underneath the caller. Transient.
    Closed,
    /// Logical error (invalid state, protocol misuse).
    Logic,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may succeed on a fresh connection.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Io | ErrorKind::Closed)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Unroutable => f.write_str("unroutable"),
            ErrorKind::Closed => f.write_str("closed"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// Error returned by every `Connector` / `Transport` method.
#[derive(Debug, Clone)]
pub struct TransportError {
    kind: ErrorKind,
    message: String,
}

impl TransportError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn unroutable(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Unroutable, message: msg.into() }
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Closed, message: msg.into() }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

// ---------------------------------------------------------------------------
// From impls: standard error types → TransportError with correct ErrorKind
// ---------------------------------------------------------------------------

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::logic(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(TransportError::io("reset").is_transient());
        assert!(TransportError::closed("gone").is_transient());
        assert!(!TransportError::config("bad endpoint").is_transient());
        assert!(!TransportError::unroutable("no topic").is_transient());
    }

    #[test]
    fn test_with_context_keeps_kind() {
        let e = TransportError::io("connection reset").with_context("fetch orders/0");
        assert_eq!(e.kind(), ErrorKind::Io);
        assert_eq!(e.message(), "fetch orders/0: connection reset");
        assert_eq!(e.to_string(), "[io] fetch orders/0: connection reset");
    }
}
