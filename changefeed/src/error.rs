//! Errors surfaced on a joined change stream.
//!
//! Every error reaches the consumer the same way (a failed pull) and is
//! terminal for that consumer. The variants only differ in where they came
//! from, which decides whether the engine keeps processing left deltas.

use std::sync::Arc;

/// Boxed source error from a feed or a cursor close.
pub type SourceError = Arc<dyn std::error::Error + Send + Sync>;

/// Error delivered through a `Subject` or returned by a cursor.
#[derive(Debug, Clone)]
pub enum JoinError {
    /// An upstream change feed or snapshot failed. Propagated verbatim.
    Feed(SourceError),
    /// A delta arrived with both `old_val` and `new_val` absent.
    EmptyChange,
    /// A left delete referenced a key with no open right subscription.
    UnknownKey { field: String, key: String },
    /// A row is missing its join key field.
    MissingKey { field: String },
    /// Closing a cursor failed during teardown.
    Close(SourceError),
    /// `start` was called on an engine that already left the created state.
    AlreadyStarted,
    /// The producer side went away without answering an outstanding pull.
    Disconnected,
}

impl JoinError {
    /// Wrap an upstream error.
    pub fn feed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Feed(Arc::new(error))
    }

    /// Upstream error from a plain message.
    #[must_use]
    pub fn feed_message(message: impl Into<String>) -> Self {
        Self::Feed(Arc::new(MessageError(message.into())))
    }

    /// Wrap an error raised while releasing a cursor.
    pub fn close<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Close(Arc::new(error))
    }

    /// Inconsistencies in the deltas themselves. The left loop keeps running
    /// after reporting one of these.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::EmptyChange | Self::UnknownKey { .. } | Self::MissingKey { .. }
        )
    }
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feed(e) => write!(f, "{e}"),
            Self::EmptyChange => write!(f, "old_val and new_val can't both be absent"),
            Self::UnknownKey { field, key } => {
                write!(f, "unknown row in destination table with {field}: \"{key}\"")
            }
            Self::MissingKey { field } => write!(f, "row has no join key field \"{field}\""),
            Self::Close(e) => write!(f, "failed to close cursor: {e}"),
            Self::AlreadyStarted => write!(f, "join listener was already started"),
            Self::Disconnected => write!(f, "stream producer disconnected"),
        }
    }
}

impl std::error::Error for JoinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Feed(e) | Self::Close(e) => Some(&**e),
            _ => None,
        }
    }
}

/// A feed error that only carries a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageError(pub String);

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_error_display_is_verbatim() {
        let error = JoinError::feed_message("done");
        assert_eq!(error.to_string(), "done");
        assert!(!error.is_protocol_violation());
    }

    #[test]
    fn test_unknown_key_display() {
        let error = JoinError::UnknownKey {
            field: "userId".to_string(),
            key: "6".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "unknown row in destination table with userId: \"6\""
        );
        assert!(error.is_protocol_violation());
    }

    #[test]
    fn test_close_error_has_source() {
        let error = JoinError::close(MessageError("socket gone".to_string()));
        assert_eq!(error.to_string(), "failed to close cursor: socket gone");
        assert!(std::error::Error::source(&error).is_some());
    }
}
