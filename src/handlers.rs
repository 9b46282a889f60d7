//! Application-facing handler traits and the registry holding them.
//!
//! Handlers are registered once on the manager and borrowed for the whole
//! of its lifetime; every callback receives the usage's handle so the
//! application can talk back through the manager. All callbacks default to
//! no-ops, applications implement what they care about.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dialog::{DialogId, DialogSetId};
use crate::events::DialogEventStateManager;
use crate::usage::UsageHandle;

/// Invite session lifecycle callbacks.
pub trait InviteSessionHandler: Send + Sync {
    fn on_new_session(&self, _handle: &UsageHandle, _request: &rsip::Request) {}
    fn on_provisional(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
    fn on_connected(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
    fn on_in_dialog_request(&self, _handle: &UsageHandle, _request: &rsip::Request) {}
    fn on_terminated(&self, _handle: &UsageHandle) {}
}

pub trait ClientRegistrationHandler: Send + Sync {
    fn on_success(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
    fn on_failure(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
    /// The client-outbound flow carrying this registration died; the
    /// binding must be refreshed on a new flow.
    fn on_flow_terminated(&self, _handle: &UsageHandle) {}
}

pub trait ServerRegistrationHandler: Send + Sync {
    fn on_register(&self, _handle: &UsageHandle, _request: &rsip::Request) {}
}

pub trait ClientSubscriptionHandler: Send + Sync {
    fn on_update(&self, _handle: &UsageHandle, _notify: &rsip::Request) {}
    fn on_terminated(&self, _handle: &UsageHandle) {}
}

pub trait ServerSubscriptionHandler: Send + Sync {
    fn on_new_subscription(&self, _handle: &UsageHandle, _request: &rsip::Request) {}
    fn on_refresh(&self, _handle: &UsageHandle, _request: &rsip::Request) {}
    fn on_terminated(&self, _handle: &UsageHandle) {}
}

pub trait ClientPublicationHandler: Send + Sync {
    fn on_success(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
    fn on_failure(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
}

pub trait ServerPublicationHandler: Send + Sync {
    fn on_publish(&self, _handle: &UsageHandle, _request: &rsip::Request) {}
    fn on_removed(&self, _handle: &UsageHandle) {}
}

pub trait OutOfDialogHandler: Send + Sync {
    fn on_received_request(&self, _handle: &UsageHandle, _request: &rsip::Request) {}
    fn on_success(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
    fn on_failure(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
}

pub trait ClientPagerMessageHandler: Send + Sync {
    fn on_success(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
    fn on_failure(&self, _handle: &UsageHandle, _response: &rsip::Response) {}
}

pub trait ServerPagerMessageHandler: Send + Sync {
    fn on_message_arrived(&self, _handle: &UsageHandle, _request: &rsip::Request) {}
}

/// Dialog set creation/destruction observer.
pub trait DialogSetHandler: Send + Sync {
    fn on_trying(&self, _id: &DialogSetId) {}
    fn on_destroyed(&self, _id: &DialogSetId) {}
}

/// Observation hooks for the request validators; the rejection itself has
/// already been sent when these fire.
pub trait RequestValidationHandler: Send + Sync {
    fn on_invalid_method(&self, _request: &rsip::Request) {}
    fn on_invalid_scheme(&self, _request: &rsip::Request) {}
    fn on_invalid_required_options(&self, _request: &rsip::Request) {}
    fn on_100rel_not_supported_by_remote(&self, _request: &rsip::Request) {}
    fn on_invalid_content_type(&self, _request: &rsip::Request) {}
    fn on_invalid_content_encoding(&self, _request: &rsip::Request) {}
    fn on_invalid_content_language(&self, _request: &rsip::Request) {}
    fn on_invalid_accept(&self, _request: &rsip::Request) {}
}

/// Shutdown completion callback; invoked at most once.
pub trait DumShutdownHandler: Send + Sync {
    fn on_dum_can_be_deleted(&self);
}

/// Observer for transport flows the stack tears down; runs after the
/// affected dialog sets have been told.
pub trait ConnectionTerminatedListener: Send + Sync {
    fn on_connection_terminated(&self, flow: &crate::events::FlowTuple);
}

/// Handler for application messages posted through the FIFO.
pub trait ExternalMessageHandler: Send + Sync {
    fn on_message(&self, message: &dyn crate::events::ExternalMessageBase, handled: &mut bool);
}

/// Hook for a client-side authenticator that injects cached credentials
/// into outgoing non-ACK requests.
pub trait ClientAuthManager: Send + Sync {
    fn add_authentication(&self, request: &mut rsip::Request);
}

/// Profile-supplied last-look mutation run on every request the profile
/// originates, ahead of credential injection: a decorator that rewrites
/// the body must do so before a digest is computed over it.
pub trait MessageDecorator: Send + Sync {
    fn decorate(&self, request: &mut rsip::Request);
}

/// UAS-side profile selection for freshly created dialog sets.
pub trait AppDialogSetFactory: Send + Sync {
    fn select_uas_user_profile(
        &self,
        _request: &rsip::Request,
        master: &Arc<crate::profile::MasterProfile>,
    ) -> Arc<crate::profile::UserProfile> {
        Arc::new(master.user_profile().clone())
    }
}

/// The stock factory: every UAS dialog set runs on the master profile.
#[derive(Debug, Default)]
pub struct DefaultAppDialogSetFactory;

impl AppDialogSetFactory for DefaultAppDialogSetFactory {}

/// The built-in "refer" subscription handler installed at construction;
/// replaced (and only then dropped) when the application registers its
/// own.
#[derive(Debug, Default)]
pub struct DefaultServerReferHandler;

impl ServerSubscriptionHandler for DefaultServerReferHandler {}

/// Registry of everything the application plugged in.
///
/// Kept apart from the manager's mutable maps so dialog dispatch can
/// borrow the registry immutably while a dialog set is borrowed mutably.
#[derive(Default)]
pub struct Handlers {
    pub invite_session: Option<Arc<dyn InviteSessionHandler>>,
    pub client_registration: Option<Arc<dyn ClientRegistrationHandler>>,
    pub server_registration: Option<Arc<dyn ServerRegistrationHandler>>,
    pub client_subscription: HashMap<String, Arc<dyn ClientSubscriptionHandler>>,
    pub server_subscription: HashMap<String, Arc<dyn ServerSubscriptionHandler>>,
    pub client_publication: HashMap<String, Arc<dyn ClientPublicationHandler>>,
    pub server_publication: HashMap<String, Arc<dyn ServerPublicationHandler>>,
    pub out_of_dialog: Vec<(rsip::Method, Arc<dyn OutOfDialogHandler>)>,
    pub client_pager_message: Option<Arc<dyn ClientPagerMessageHandler>>,
    pub server_pager_message: Option<Arc<dyn ServerPagerMessageHandler>>,
    pub dialog_set: Option<Arc<dyn DialogSetHandler>>,
    pub request_validation: Option<Arc<dyn RequestValidationHandler>>,
    /// Exclusively owned dialog event observer; lives here so dialog
    /// dispatch can report transitions while a set is borrowed.
    pub dialog_event_state: Option<DialogEventStateManager>,
}

impl Handlers {
    pub fn notify_invite_new(&self, handle: &UsageHandle, request: &rsip::Request) {
        if let Some(handler) = &self.invite_session {
            handler.on_new_session(handle, request);
        }
    }

    pub fn notify_invite_provisional(&self, handle: &UsageHandle, response: &rsip::Response) {
        if let Some(handler) = &self.invite_session {
            handler.on_provisional(handle, response);
        }
    }

    pub fn notify_invite_connected(&self, handle: &UsageHandle, response: &rsip::Response) {
        if let Some(handler) = &self.invite_session {
            handler.on_connected(handle, response);
        }
    }

    pub fn notify_invite_in_dialog_request(&self, handle: &UsageHandle, request: &rsip::Request) {
        if let Some(handler) = &self.invite_session {
            handler.on_in_dialog_request(handle, request);
        }
    }

    pub fn notify_invite_terminated(&self, handle: &UsageHandle) {
        if let Some(handler) = &self.invite_session {
            handler.on_terminated(handle);
        }
    }

    pub fn notify_client_subscription_update(&self, handle: &UsageHandle, notify: &rsip::Request) {
        if let Some(event) = handle.id.key.as_deref() {
            if let Some(handler) = self.client_subscription.get(event) {
                handler.on_update(handle, notify);
            }
        }
    }

    pub fn notify_client_subscription_terminated(&self, handle: &UsageHandle) {
        if let Some(event) = handle.id.key.as_deref() {
            if let Some(handler) = self.client_subscription.get(event) {
                handler.on_terminated(handle);
            }
        }
    }

    pub fn notify_server_subscription_new(
        &self,
        handle: &UsageHandle,
        event: &str,
        request: &rsip::Request,
    ) {
        if let Some(handler) = self.server_subscription.get(event) {
            handler.on_new_subscription(handle, request);
        }
    }

    pub fn notify_server_subscription_refresh(&self, handle: &UsageHandle, request: &rsip::Request) {
        if let Some(event) = handle.id.key.as_deref() {
            if let Some(handler) = self.server_subscription.get(event) {
                handler.on_refresh(handle, request);
            }
        }
    }

    pub fn notify_server_subscription_terminated(&self, handle: &UsageHandle) {
        if let Some(event) = handle.id.key.as_deref() {
            if let Some(handler) = self.server_subscription.get(event) {
                handler.on_terminated(handle);
            }
        }
    }

    pub fn notify_client_registration_status(
        &self,
        handle: &UsageHandle,
        success: bool,
        response: &rsip::Response,
    ) {
        if let Some(handler) = &self.client_registration {
            if success {
                handler.on_success(handle, response);
            } else {
                handler.on_failure(handle, response);
            }
        }
    }

    pub fn notify_client_registration_flow_terminated(&self, handle: &UsageHandle) {
        if let Some(handler) = &self.client_registration {
            handler.on_flow_terminated(handle);
        }
    }

    pub fn notify_client_publication_status(
        &self,
        event: &str,
        handle: &UsageHandle,
        success: bool,
        response: &rsip::Response,
    ) {
        if let Some(handler) = self.client_publication.get(event) {
            if success {
                handler.on_success(handle, response);
            } else {
                handler.on_failure(handle, response);
            }
        }
    }

    pub fn notify_out_of_dialog_response(
        &self,
        method: &rsip::Method,
        handle: &UsageHandle,
        success: bool,
        response: &rsip::Response,
    ) {
        if let Some(handler) = self.out_of_dialog_handler(method) {
            if success {
                handler.on_success(handle, response);
            } else {
                handler.on_failure(handle, response);
            }
        }
    }

    pub fn out_of_dialog_handler(&self, method: &rsip::Method) -> Option<&Arc<dyn OutOfDialogHandler>> {
        self.out_of_dialog
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, handler)| handler)
    }

    pub fn notify_dialog_early(&self, id: &DialogId) {
        if let Some(events) = &self.dialog_event_state {
            events.on_early(id);
        }
    }

    pub fn notify_dialog_confirmed(&self, id: &DialogId) {
        if let Some(events) = &self.dialog_event_state {
            events.on_confirmed(id);
        }
    }

    pub fn notify_pager_response(
        &self,
        handle: &UsageHandle,
        success: bool,
        response: &rsip::Response,
    ) {
        if let Some(handler) = &self.client_pager_message {
            if success {
                handler.on_success(handle, response);
            } else {
                handler.on_failure(handle, response);
            }
        }
    }
}
