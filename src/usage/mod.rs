//! Protocol usages: the long-lived activities living inside dialogs and
//! dialog sets.
//!
//! The closed set of usages is modelled as concrete structs owned by their
//! dialog (invite session, subscriptions) or dialog set (registration,
//! publication, out-of-dialog request, pager message), addressed from the
//! outside through generational [`UsageHandle`]s. A handle never dangles:
//! resolving it re-checks that the owning entities still exist, that the
//! set is not being destroyed, and that the generation matches.

pub mod invite_session;
pub mod out_of_dialog;
pub mod pager;
pub mod publication;
pub mod registration;
pub mod subscription;

use std::fmt;

use crate::dialog::{DialogId, DialogSetId};

pub use invite_session::{InviteSession, InviteSessionState};
pub use out_of_dialog::{ClientOutOfDialog, ServerOutOfDialog};
pub use pager::{ClientPagerMessage, ServerPagerMessage};
pub use publication::{ClientPublication, ServerPublication};
pub use registration::{ClientRegistration, RegistrationState, ServerRegistration};
pub use subscription::{ClientSubscription, ServerSubscription, SubscriptionState};

/// Which usage a handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKind {
    ClientInviteSession,
    ServerInviteSession,
    ClientSubscription,
    ServerSubscription,
    ClientPublication,
    ServerPublication,
    ClientRegistration,
    ServerRegistration,
    ClientOutOfDialog,
    ServerOutOfDialog,
    ClientPagerMessage,
    ServerPagerMessage,
}

/// Structural address of a usage within the manager's ownership tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageId {
    /// Owning dialog set; `None` only for server publications, which are
    /// keyed by entity tag instead.
    pub dialog_set: Option<DialogSetId>,
    /// Owning dialog for dialog-bound usages.
    pub dialog: Option<DialogId>,
    pub kind: UsageKind,
    /// Event package for subscriptions, entity tag for publications.
    pub key: Option<String>,
}

/// Application-facing weak reference to a usage.
///
/// The serial is a generation counter assigned at creation; a stale handle
/// whose address was reused by a newer usage fails the serial check and
/// resolves to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageHandle {
    pub id: UsageId,
    pub serial: u64,
}

impl UsageHandle {
    pub fn new(id: UsageId, serial: u64) -> Self {
        UsageHandle { id, serial }
    }
}

impl fmt::Display for UsageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.id.kind, self.serial)
    }
}

/// Generation source for usage serials; owned by the manager, threaded
/// through dispatch so newly created usages get fresh generations.
#[derive(Debug, Default)]
pub struct SerialCounter(u64);

impl SerialCounter {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Why a usage was ended locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ApplicationRequested,
    Deactivated,
    Timeout,
    Rejected,
    NoResource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_serial_is_a_different_handle() {
        let id = UsageId {
            dialog_set: Some(DialogSetId::new("call", "tag")),
            dialog: None,
            kind: UsageKind::ClientRegistration,
            key: None,
        };
        let old = UsageHandle::new(id.clone(), 1);
        let new = UsageHandle::new(id, 2);
        assert_ne!(old, new);
    }
}
