//! Dialog event reporting (RFC 4235 style observer).
//!
//! The embedding application can ask for a running commentary of dialog
//! state by installing a [`DialogEventHandler`]; the manager then owns a
//! [`DialogEventStateManager`] and feeds it from the send and dispatch
//! paths.

use std::sync::Arc;

use crate::dialog::{DialogId, DialogSetId};

/// Dialog transitions reported to the application.
#[derive(Debug, Clone)]
pub enum DialogEvent {
    /// A new UAC INVITE left through the send path before any dialog
    /// existed for it.
    TryingUac { dialog_set: DialogSetId },
    /// A dialog reached the early state.
    Early { dialog_id: DialogId },
    /// A dialog confirmed.
    Confirmed { dialog_id: DialogId },
    /// A dialog terminated.
    Terminated { dialog_id: DialogId },
}

pub trait DialogEventHandler: Send + Sync {
    fn on_dialog_event(&self, event: DialogEvent);
}

/// Exclusively owned by the manager; created iff a handler is installed.
pub struct DialogEventStateManager {
    handler: Arc<dyn DialogEventHandler>,
}

impl DialogEventStateManager {
    pub fn new(handler: Arc<dyn DialogEventHandler>) -> Self {
        DialogEventStateManager { handler }
    }

    pub fn on_trying_uac(&self, dialog_set: &DialogSetId) {
        self.handler.on_dialog_event(DialogEvent::TryingUac {
            dialog_set: dialog_set.clone(),
        });
    }

    pub fn on_early(&self, dialog_id: &DialogId) {
        self.handler.on_dialog_event(DialogEvent::Early {
            dialog_id: dialog_id.clone(),
        });
    }

    pub fn on_confirmed(&self, dialog_id: &DialogId) {
        self.handler.on_dialog_event(DialogEvent::Confirmed {
            dialog_id: dialog_id.clone(),
        });
    }

    pub fn on_terminated(&self, dialog_id: &DialogId) {
        self.handler.on_dialog_event(DialogEvent::Terminated {
            dialog_id: dialog_id.clone(),
        });
    }
}
