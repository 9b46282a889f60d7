//! Events flowing through the dialog usage manager.
//!
//! Everything the manager reacts to arrives as a [`DumEvent`] on its FIFO:
//! SIP traffic posted by the stack, timer expiries, stack lifecycle
//! notifications and commands the manager (or the application) posted back
//! to itself. Usage and dialog dispatch produce [`DumAction`] values that
//! the manager applies after the borrow on the owning entity ends.

pub mod dialog_event;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialog::{DialogId, DialogSetId, MergedRequestKey};
use crate::usage::UsageHandle;

pub use dialog_event::{DialogEvent, DialogEventHandler, DialogEventStateManager};

/// Transaction identity recovered from the wire: the branch parameter of
/// the topmost Via. A CANCEL or ACK carries the branch of the request it
/// addresses and therefore maps to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(value: impl Into<String>) -> Self {
        TransactionId(value.into())
    }

    pub fn of_message(msg: &rsip::SipMessage) -> Option<TransactionId> {
        match msg {
            rsip::SipMessage::Request(req) => crate::rsip_ext::top_via_branch(req),
            rsip::SipMessage::Response(resp) => crate::rsip_ext::top_via_branch(resp),
        }
        .map(TransactionId)
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// RFC 5626 flow identity: the connection a client-outbound registration
/// rides on. The key is checked first when matching, it is not part of the
/// transport/address comparison the stack uses elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTuple {
    pub transport: rsip::Transport,
    pub remote: SocketAddr,
    pub flow_key: u64,
}

impl FlowTuple {
    pub fn matches(&self, other: &FlowTuple) -> bool {
        self.flow_key == other.flow_key
            && self.transport == other.transport
            && self.remote == other.remote
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.transport, self.remote, self.flow_key)
    }
}

/// What a usage-level timer was armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// 2xx retransmission while waiting for the ACK.
    Retransmit200,
    /// Give up waiting for the ACK and tear the session down.
    WaitForAck,
    /// Provisional retransmission cadence.
    Retransmit1xx,
    /// Session liveness: no final answer in time.
    StaleCall,
    /// Subscription needs a refreshing SUBSCRIBE.
    SubscriptionRefresh,
    /// Subscription expired without refresh.
    SubscriptionExpiration,
    /// Registration needs a refreshing REGISTER.
    RegistrationRefresh,
    /// Publication needs a refreshing PUBLISH.
    PublicationRefresh,
}

/// A timer that fired for a specific usage. Delivered to the usage through
/// its handle; silently discarded when the usage is already gone.
#[derive(Debug, Clone)]
pub struct DumTimeout {
    pub kind: TimeoutKind,
    pub target: UsageHandle,
    pub cseq: u32,
    pub rseq: u32,
    pub transaction_id: Option<TransactionId>,
}

/// Deferred destruction target; posted so teardown never runs inside the
/// dispatch that decided on it.
#[derive(Debug, Clone)]
pub enum DestroyTarget {
    Usage(UsageHandle),
    Dialog(DialogId),
    DialogSet(DialogSetId),
}

/// Commands executed on the manager's worker.
pub enum DumCommand {
    /// Merge-window expiry scheduled when an initial request was accepted.
    RemoveMergedRequest(MergedRequestKey),
    /// Re-enter the send path from the worker.
    Send(rsip::SipMessage),
    /// Application-supplied work run with exclusive access to the manager.
    App(Box<dyn FnOnce(&mut crate::manager::DialogUsageManager) + Send>),
}

impl fmt::Debug for DumCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumCommand::RemoveMergedRequest(key) => {
                write!(f, "RemoveMergedRequest({})", key)
            }
            DumCommand::Send(_) => f.write_str("Send(..)"),
            DumCommand::App(_) => f.write_str("App(..)"),
        }
    }
}

/// Application-defined message routed through the manager's FIFO so it is
/// handled on the worker, in arrival order with the SIP traffic.
pub trait ExternalMessageBase: Send {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Everything the manager's FIFO can carry.
#[derive(Debug)]
pub enum DumEvent {
    /// SIP request or response delivered by the stack.
    Sip(rsip::SipMessage),
    /// The stack acknowledged our transaction-user deregistration.
    TransactionUserRemoved,
    /// Keep-alive pong observed on a flow.
    KeepAlivePong { flow: FlowTuple },
    /// Time to send the next keep-alive on a flow.
    KeepAliveTimeout { flow: FlowTuple },
    /// A solicited pong did not arrive in time.
    KeepAlivePongTimeout { flow: FlowTuple },
    /// The stack lost a connection.
    ConnectionTerminated { flow: FlowTuple },
    /// Deferred teardown of a usage, dialog or dialog set.
    DestroyUsage(DestroyTarget),
    /// A usage-level timer fired.
    Timeout(DumTimeout),
    /// Command posted back to the worker.
    Command(DumCommand),
    /// Application-defined message for the external-message handlers.
    External(Box<dyn ExternalMessageBase>),
}

impl fmt::Debug for Box<dyn ExternalMessageBase> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExternalMessageBase")
    }
}

/// Side effects produced while a dialog set, dialog or usage is borrowed;
/// the manager applies them once the borrow is released.
#[derive(Debug)]
pub enum DumAction {
    /// Answer on the wire.
    SendResponse(rsip::Response),
    /// Emit a request through the manager's send path, resolving the
    /// profile of the named dialog set.
    SendRequest {
        dialog_set: DialogSetId,
        request: rsip::Request,
    },
    /// Arm a usage timer via the stack's timer facility.
    StartTimer { timeout: DumTimeout, delay: Duration },
    /// Tear down the target once dispatch has completed.
    Destroy(DestroyTarget),
    /// Index a pending server INVITE so a CANCEL on the same transaction
    /// finds its session.
    RegisterCancel {
        transaction_id: TransactionId,
        dialog: DialogId,
    },
}
