//! Dialog state (RFC 3261 section 12).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one dialog. Early comes from a tagged provisional,
/// Confirmed from a 2xx; nothing leaves Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

impl DialogState {
    pub fn can_transition_to(&self, next: DialogState) -> bool {
        use DialogState::*;
        matches!(
            (self, next),
            (Early, Early)
                | (Early, Confirmed)
                | (Early, Terminated)
                | (Confirmed, Confirmed)
                | (Confirmed, Terminated)
                | (Terminated, Terminated)
        )
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Early => f.write_str("Early"),
            DialogState::Confirmed => f.write_str("Confirmed"),
            DialogState::Terminated => f.write_str("Terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmed_cannot_regress_to_early() {
        assert!(DialogState::Early.can_transition_to(DialogState::Confirmed));
        assert!(!DialogState::Confirmed.can_transition_to(DialogState::Early));
        assert!(!DialogState::Terminated.can_transition_to(DialogState::Confirmed));
    }
}
