//! Invite session usage.
//!
//! A dialog owns at most one invite session. The session tracks the
//! coarse INVITE lifecycle the dispatcher needs for routing, CANCEL
//! handling and RFC 3891 Replaces matching; offer/answer detail stays with
//! the application.

use crate::events::TransactionId;
use crate::usage::EndReason;

/// Coarse invite session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteSessionState {
    /// Initial request sent or received, no tagged response yet.
    Trying,
    /// Provisional (non-100) observed; dialog is early.
    Early,
    /// 2xx observed; session connected.
    Connected,
    Terminated,
}

/// UAC or UAS side of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteRole {
    Uac,
    Uas,
}

#[derive(Debug, Clone)]
pub struct InviteSession {
    pub serial: u64,
    pub role: InviteRole,
    pub state: InviteSessionState,
    /// The dialog-creating INVITE; a UAS answers CANCEL against it.
    pub invite_request: rsip::Request,
    /// Transaction of the pending server INVITE, used as the CANCEL key.
    pub invite_transaction: Option<TransactionId>,
}

impl InviteSession {
    pub fn new_uac(serial: u64, invite_request: rsip::Request) -> Self {
        InviteSession {
            serial,
            role: InviteRole::Uac,
            state: InviteSessionState::Trying,
            invite_request,
            invite_transaction: None,
        }
    }

    pub fn new_uas(
        serial: u64,
        invite_request: rsip::Request,
        invite_transaction: Option<TransactionId>,
    ) -> Self {
        InviteSession {
            serial,
            role: InviteRole::Uas,
            state: InviteSessionState::Trying,
            invite_request,
            invite_transaction,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == InviteSessionState::Terminated
    }

    pub fn is_connected(&self) -> bool {
        self.state == InviteSessionState::Connected
    }

    /// Early in the RFC 3891 sense: a not-yet-answered session this UA
    /// initiated. A UAS-side early session never matches Replaces.
    pub fn is_early(&self) -> bool {
        self.role == InviteRole::Uac
            && matches!(
                self.state,
                InviteSessionState::Trying | InviteSessionState::Early
            )
    }

    /// Fold a response status into the session state (UAC side).
    pub fn on_status(&mut self, status: u16) {
        self.state = match status {
            100 => self.state,
            101..=199 => match self.state {
                InviteSessionState::Trying | InviteSessionState::Early => {
                    InviteSessionState::Early
                }
                other => other,
            },
            200..=299 => InviteSessionState::Connected,
            _ => InviteSessionState::Terminated,
        };
    }

    /// A 2xx was sent or the ACK arrived (UAS side).
    pub fn confirm(&mut self) {
        if self.state != InviteSessionState::Terminated {
            self.state = InviteSessionState::Connected;
        }
    }

    pub fn end(&mut self, _reason: EndReason) {
        self.state = InviteSessionState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> rsip::Request {
        rsip::Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            version: rsip::Version::V2,
            headers: Default::default(),
            body: Default::default(),
        }
    }

    #[test]
    fn uac_session_walks_early_to_connected() {
        let mut session = InviteSession::new_uac(1, invite());
        assert!(session.is_early());
        session.on_status(180);
        assert_eq!(session.state, InviteSessionState::Early);
        assert!(session.is_early());
        session.on_status(200);
        assert!(session.is_connected());
        assert!(!session.is_early());
    }

    #[test]
    fn failure_status_terminates() {
        let mut session = InviteSession::new_uac(1, invite());
        session.on_status(486);
        assert!(session.is_terminated());
    }

    #[test]
    fn uas_early_session_is_not_replaceable_early() {
        let session = InviteSession::new_uas(1, invite(), None);
        assert!(!session.is_early());
        assert!(!session.is_connected());
    }

    #[test]
    fn hundred_trying_does_not_advance() {
        let mut session = InviteSession::new_uac(1, invite());
        session.on_status(100);
        assert_eq!(session.state, InviteSessionState::Trying);
    }
}
