//! The seam between the dialog usage manager and the transaction stack.
//!
//! The stack below is only assumed to do three things: accept outbound
//! messages, deliver inbound traffic and timer expiries into the
//! registered transaction user's FIFO, and acknowledge shutdown. The
//! manager talks downward through [`SipStack`]; the stack talks upward
//! through the narrow [`TransactionUser`] callbacks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::events::{DumEvent, FlowTuple};

/// Where an outbound message should leave, when not left to the stack's
/// own resolution.
#[derive(Debug, Clone)]
pub enum SendTarget {
    /// Normal RFC 3263 resolution of the message itself.
    Default,
    /// Route to a specific URI (outbound proxy).
    Uri(rsip::Uri),
    /// Reuse an established RFC 5626 flow.
    Flow(FlowTuple),
}

/// Downward interface onto the transaction stack.
pub trait SipStack: Send + Sync {
    /// Hand a message to the transaction layer for normal routing.
    fn send(&self, msg: rsip::SipMessage);

    /// Hand a message to the transaction layer with an explicit target.
    fn send_to(&self, msg: rsip::SipMessage, target: SendTarget);

    /// Deliver `event` back into the posting transaction user's FIFO
    /// after `delay`. Timers and deferred commands ride on this.
    fn post_to_tu(&self, event: DumEvent, delay: Duration);

    /// Announce a transaction user; inbound traffic starts flowing to it.
    fn register_transaction_user(&self, tu: Arc<dyn TransactionUser>);

    /// Ask the stack to wind down the calling transaction user. The stack
    /// answers with a `TransactionUserRemoved` event once no transactions
    /// reference it.
    fn request_transaction_user_shutdown(&self);

    /// Drop the registration immediately.
    fn unregister_transaction_user(&self);
}

/// Upward interface the stack invokes on a registered participant.
pub trait TransactionUser: Send + Sync {
    /// Enqueue an event; called from any stack thread.
    fn post(&self, event: DumEvent);

    /// A transport flow this user may care about went away.
    fn on_connection_terminated(&self, flow: FlowTuple);

    /// Diagnostic name of the participant.
    fn name(&self) -> &str;
}

/// The manager's FIFO endpoint, handed to the stack at construction.
///
/// Cloneable and cheap; every clone feeds the same FIFO. Posting after the
/// manager is gone is a no-op.
#[derive(Clone)]
pub struct DumHandle {
    tx: mpsc::UnboundedSender<DumEvent>,
}

impl DumHandle {
    pub(crate) fn channel() -> (DumHandle, mpsc::UnboundedReceiver<DumEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DumHandle { tx }, rx)
    }

    pub fn post(&self, event: DumEvent) {
        let _ = self.tx.send(event);
    }
}

impl TransactionUser for DumHandle {
    fn post(&self, event: DumEvent) {
        DumHandle::post(self, event);
    }

    fn on_connection_terminated(&self, flow: FlowTuple) {
        DumHandle::post(self, DumEvent::ConnectionTerminated { flow });
    }

    fn name(&self) -> &str {
        "DialogUsageManager"
    }
}
