//! Error types for sip-dum
//!
//! Protocol failures are never surfaced through these types; they are
//! answered on the wire with the status codes mandated by RFC 3261 and
//! friends. `DumError` covers contract violations by the embedding
//! application: creating sessions during shutdown, registering the same
//! handler twice, sending pager messages without a handler, and the like.

use crate::dialog::DialogSetId;

/// Result type used throughout the crate.
pub type DumResult<T> = Result<T, DumError>;

/// Contract and API-misuse errors raised by the dialog usage manager.
#[derive(Debug, thiserror::Error)]
pub enum DumError {
    /// A message was structurally unusable for the attempted operation.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The referenced dialog set is gone (or already being destroyed).
    #[error("dialog set no longer exists: {id}")]
    DialogSetNotFound { id: DialogSetId },

    /// New usages cannot be created once shutdown has been requested.
    #[error("cannot create new sessions when DUM is shutting down")]
    ShuttingDown,

    /// Operations that need a master profile were invoked before one was set.
    #[error("no master profile has been configured")]
    NoMasterProfile,

    /// A one-shot handler slot was assigned twice.
    #[error("{handler} handler is already registered")]
    HandlerAlreadyRegistered { handler: &'static str },

    /// An operation requires a handler that was never registered.
    #[error("cannot {operation} without a {handler} handler")]
    MissingHandler {
        handler: &'static str,
        operation: &'static str,
    },

    /// A header required by the operation was absent or unparseable.
    #[error("missing or malformed {header} header")]
    BadHeader { header: &'static str },

    /// Errors bubbled up from the SIP message model.
    #[error(transparent)]
    Sip(#[from] rsip::Error),
}

impl DumError {
    pub fn protocol(message: impl Into<String>) -> Self {
        DumError::Protocol {
            message: message.into(),
        }
    }

    pub fn bad_header(header: &'static str) -> Self {
        DumError::BadHeader { header }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_handler() {
        let err = DumError::MissingHandler {
            handler: "ClientPagerMessage",
            operation: "send MESSAGE requests",
        };
        assert_eq!(
            err.to_string(),
            "cannot send MESSAGE requests without a ClientPagerMessage handler"
        );
    }
}
