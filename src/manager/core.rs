//! The dialog usage manager: construction, registration surface, entity
//! lookup and the factory methods that open new usages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::creator::{Creator, SharedRequest};
use crate::dialog::{Dialog, DialogId, DialogSet, DialogSetId, MergedRequestKey};
use crate::errors::{DumError, DumResult};
use crate::events::{
    DestroyTarget, DialogEventHandler, DialogEventStateManager, DumAction, DumEvent, DumTimeout,
    TransactionId,
};
use crate::feature::{DumFeature, FeatureChain};
use crate::handlers::{
    AppDialogSetFactory, ClientAuthManager, ClientPagerMessageHandler,
    ClientPublicationHandler, ClientRegistrationHandler, ClientSubscriptionHandler,
    DefaultAppDialogSetFactory, DefaultServerReferHandler, DialogSetHandler,
    DumShutdownHandler, ExternalMessageHandler, Handlers, InviteSessionHandler,
    OutOfDialogHandler, RequestValidationHandler, ServerPagerMessageHandler,
    ServerPublicationHandler, ServerRegistrationHandler, ServerSubscriptionHandler,
};
use crate::keep_alive::KeepAliveManager;
use crate::manager::shutdown::ShutdownState;
use crate::persistence::{PublicationPersistenceManager, RegistrationPersistenceManager};
use crate::profile::{MasterProfile, UserProfile};
use crate::rsip_ext::{self, Replaces};
use crate::stack::{DumHandle, SipStack};
use crate::usage::{
    EndReason, SerialCounter, ServerPublication, SubscriptionState, UsageHandle, UsageKind,
};

/// The top-level dispatcher. One logical worker owns it and drains its
/// FIFO; the stack posts into the FIFO from wherever it likes.
pub struct DialogUsageManager {
    stack: Arc<dyn SipStack>,
    handle: DumHandle,
    pub(crate) fifo: mpsc::UnboundedReceiver<DumEvent>,

    master_profile: Option<Arc<MasterProfile>>,
    pub(crate) handlers: Handlers,
    app_dialog_set_factory: Arc<dyn AppDialogSetFactory>,

    pub(crate) dialog_sets: HashMap<DialogSetId, DialogSet>,
    /// `(Call-ID, From tag)` of the originating request for UAS sets, so
    /// tagless duplicates find the set they collide with.
    pub(crate) uas_origins: HashMap<(String, String), DialogSetId>,
    pub(crate) merged_requests: HashSet<MergedRequestKey>,
    pub(crate) cancel_map: HashMap<TransactionId, DialogId>,
    pub(crate) server_publications: HashMap<String, ServerPublication>,

    pub(crate) incoming_features: Vec<Arc<dyn DumFeature>>,
    pub(crate) outgoing_features: Vec<Arc<dyn DumFeature>>,
    pub(crate) incoming_chains: HashMap<TransactionId, FeatureChain>,
    pub(crate) outgoing_chains: HashMap<TransactionId, FeatureChain>,
    pub(crate) outgoing_interceptor: Option<Arc<dyn DumFeature>>,

    pub(crate) external_handlers: Vec<Arc<dyn ExternalMessageHandler>>,
    pub(crate) connection_terminated_listeners:
        Vec<Arc<dyn crate::handlers::ConnectionTerminatedListener>>,
    pub(crate) keep_alive: Option<KeepAliveManager>,
    pub(crate) client_auth: Option<Arc<dyn ClientAuthManager>>,
    registration_persistence: Option<Arc<dyn RegistrationPersistenceManager>>,
    pub(crate) publication_persistence: Option<Arc<dyn PublicationPersistenceManager>>,

    pub(crate) shutdown_state: ShutdownState,
    pub(crate) shutdown_handler: Option<Arc<dyn DumShutdownHandler>>,
    is_default_server_refer_handler: bool,

    pub(crate) serials: SerialCounter,
    pub(crate) worker_thread: Option<std::thread::ThreadId>,
}

impl DialogUsageManager {
    /// Build a manager on top of `stack` and register it as a
    /// transaction user. A default server REFER handler is installed so
    /// REFER-created subscriptions always have a target.
    pub fn new(stack: Arc<dyn SipStack>) -> DialogUsageManager {
        let (handle, fifo) = DumHandle::channel();
        stack.register_transaction_user(Arc::new(handle.clone()));

        let mut handlers = Handlers::default();
        handlers
            .server_subscription
            .insert("refer".to_string(), Arc::new(DefaultServerReferHandler));

        DialogUsageManager {
            stack,
            handle,
            fifo,
            master_profile: None,
            handlers,
            app_dialog_set_factory: Arc::new(DefaultAppDialogSetFactory),
            dialog_sets: HashMap::new(),
            uas_origins: HashMap::new(),
            merged_requests: HashSet::new(),
            cancel_map: HashMap::new(),
            server_publications: HashMap::new(),
            incoming_features: Vec::new(),
            outgoing_features: Vec::new(),
            incoming_chains: HashMap::new(),
            outgoing_chains: HashMap::new(),
            outgoing_interceptor: None,
            external_handlers: Vec::new(),
            connection_terminated_listeners: Vec::new(),
            keep_alive: None,
            client_auth: None,
            registration_persistence: None,
            publication_persistence: None,
            shutdown_state: ShutdownState::Running,
            shutdown_handler: None,
            is_default_server_refer_handler: true,
            serials: SerialCounter::default(),
            worker_thread: None,
        }
    }

    pub fn name(&self) -> &str {
        "DialogUsageManager"
    }

    /// Whether the "refer" subscription handler is still the built-in
    /// default rather than an application-provided one.
    pub fn is_default_server_refer_handler(&self) -> bool {
        self.is_default_server_refer_handler
    }

    pub(crate) fn stack(&self) -> Arc<dyn SipStack> {
        Arc::clone(&self.stack)
    }

    /// FIFO endpoint for posting events from outside the worker.
    pub fn dum_handle(&self) -> DumHandle {
        self.handle.clone()
    }

    pub fn post(&self, event: DumEvent) {
        self.handle.post(event);
    }

    // ===== profile and handler registration =====

    pub fn set_master_profile(&mut self, profile: Arc<MasterProfile>) -> DumResult<()> {
        if self.master_profile.is_some() {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "MasterProfile",
            });
        }
        self.master_profile = Some(profile);
        Ok(())
    }

    pub fn master_profile(&self) -> DumResult<&Arc<MasterProfile>> {
        self.master_profile.as_ref().ok_or(DumError::NoMasterProfile)
    }

    pub fn master_user_profile(&self) -> DumResult<Arc<UserProfile>> {
        Ok(Arc::new(self.master_profile()?.user_profile().clone()))
    }

    pub fn set_app_dialog_set_factory(&mut self, factory: Arc<dyn AppDialogSetFactory>) {
        self.app_dialog_set_factory = factory;
    }

    pub(crate) fn app_dialog_set_factory(&self) -> &Arc<dyn AppDialogSetFactory> {
        &self.app_dialog_set_factory
    }

    pub fn set_invite_session_handler(
        &mut self,
        handler: Arc<dyn InviteSessionHandler>,
    ) -> DumResult<()> {
        if self.handlers.invite_session.is_some() {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "InviteSession",
            });
        }
        self.handlers.invite_session = Some(handler);
        Ok(())
    }

    pub fn set_client_registration_handler(
        &mut self,
        handler: Arc<dyn ClientRegistrationHandler>,
    ) -> DumResult<()> {
        if self.handlers.client_registration.is_some() {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "ClientRegistration",
            });
        }
        self.handlers.client_registration = Some(handler);
        Ok(())
    }

    pub fn set_server_registration_handler(
        &mut self,
        handler: Arc<dyn ServerRegistrationHandler>,
    ) -> DumResult<()> {
        if self.handlers.server_registration.is_some() {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "ServerRegistration",
            });
        }
        self.handlers.server_registration = Some(handler);
        Ok(())
    }

    pub fn set_dialog_set_handler(&mut self, handler: Arc<dyn DialogSetHandler>) {
        self.handlers.dialog_set = Some(handler);
    }

    pub fn set_request_validation_handler(
        &mut self,
        handler: Arc<dyn RequestValidationHandler>,
    ) -> DumResult<()> {
        if self.handlers.request_validation.is_some() {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "RequestValidation",
            });
        }
        self.handlers.request_validation = Some(handler);
        Ok(())
    }

    pub fn add_client_subscription_handler(
        &mut self,
        event: impl Into<String>,
        handler: Arc<dyn ClientSubscriptionHandler>,
    ) -> DumResult<()> {
        let event = event.into();
        if self.handlers.client_subscription.contains_key(&event) {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "ClientSubscription",
            });
        }
        self.handlers.client_subscription.insert(event, handler);
        Ok(())
    }

    /// Register a server-side subscription handler. The built-in "refer"
    /// handler may be replaced; anything else registers once.
    pub fn add_server_subscription_handler(
        &mut self,
        event: impl Into<String>,
        handler: Arc<dyn ServerSubscriptionHandler>,
    ) -> DumResult<()> {
        let event = event.into();
        if event == "refer" {
            if self.handlers.server_subscription.remove(&event).is_some() {
                self.is_default_server_refer_handler = false;
            }
        } else if self.handlers.server_subscription.contains_key(&event) {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "ServerSubscription",
            });
        }
        self.handlers.server_subscription.insert(event, handler);
        Ok(())
    }

    pub fn add_client_publication_handler(
        &mut self,
        event: impl Into<String>,
        handler: Arc<dyn ClientPublicationHandler>,
    ) -> DumResult<()> {
        let event = event.into();
        if self.handlers.client_publication.contains_key(&event) {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "ClientPublication",
            });
        }
        self.handlers.client_publication.insert(event, handler);
        Ok(())
    }

    pub fn add_server_publication_handler(
        &mut self,
        event: impl Into<String>,
        handler: Arc<dyn ServerPublicationHandler>,
    ) -> DumResult<()> {
        let event = event.into();
        if self.handlers.server_publication.contains_key(&event) {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "ServerPublication",
            });
        }
        self.handlers.server_publication.insert(event, handler);
        Ok(())
    }

    pub fn add_out_of_dialog_handler(
        &mut self,
        method: rsip::Method,
        handler: Arc<dyn OutOfDialogHandler>,
    ) -> DumResult<()> {
        if self.handlers.out_of_dialog_handler(&method).is_some() {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "OutOfDialog",
            });
        }
        self.handlers.out_of_dialog.push((method, handler));
        Ok(())
    }

    pub fn set_client_pager_message_handler(
        &mut self,
        handler: Arc<dyn ClientPagerMessageHandler>,
    ) {
        self.handlers.client_pager_message = Some(handler);
    }

    pub fn set_server_pager_message_handler(
        &mut self,
        handler: Arc<dyn ServerPagerMessageHandler>,
    ) {
        self.handlers.server_pager_message = Some(handler);
    }

    pub fn add_external_message_handler(&mut self, handler: Arc<dyn ExternalMessageHandler>) {
        if !self
            .external_handlers
            .iter()
            .any(|h| Arc::ptr_eq(h, &handler))
        {
            self.external_handlers.push(handler);
        }
    }

    pub fn remove_external_message_handler(&mut self, handler: &Arc<dyn ExternalMessageHandler>) {
        self.external_handlers.retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn clear_external_message_handlers(&mut self) {
        self.external_handlers.clear();
    }

    pub fn register_for_connection_termination(
        &mut self,
        listener: Arc<dyn crate::handlers::ConnectionTerminatedListener>,
    ) {
        if !self
            .connection_terminated_listeners
            .iter()
            .any(|l| Arc::ptr_eq(l, &listener))
        {
            self.connection_terminated_listeners.push(listener);
        }
    }

    pub fn unregister_for_connection_termination(
        &mut self,
        listener: &Arc<dyn crate::handlers::ConnectionTerminatedListener>,
    ) {
        self.connection_terminated_listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    // ===== features =====

    /// Server auth always sits at the head of the incoming chain.
    pub fn set_server_auth_manager(&mut self, feature: Arc<dyn DumFeature>) {
        self.incoming_features.insert(0, feature);
    }

    pub fn add_incoming_feature(&mut self, feature: Arc<dyn DumFeature>) {
        self.incoming_features.push(feature);
    }

    /// Outgoing features are prepended, keeping whatever was installed
    /// first (conventionally encryption) last before the wire.
    pub fn add_outgoing_feature(&mut self, feature: Arc<dyn DumFeature>) {
        self.outgoing_features.insert(0, feature);
    }

    pub fn set_outgoing_message_interceptor(&mut self, feature: Arc<dyn DumFeature>) {
        self.outgoing_interceptor = Some(feature);
    }

    // ===== optional collaborators =====

    pub fn set_keep_alive_manager(&mut self, manager: KeepAliveManager) {
        self.keep_alive = Some(manager);
    }

    pub fn set_client_auth_manager(&mut self, manager: Arc<dyn ClientAuthManager>) {
        self.client_auth = Some(manager);
    }

    pub fn set_registration_persistence_manager(
        &mut self,
        manager: Arc<dyn RegistrationPersistenceManager>,
    ) -> DumResult<()> {
        if self.registration_persistence.is_some() {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "RegistrationPersistence",
            });
        }
        self.registration_persistence = Some(manager);
        Ok(())
    }

    pub fn registration_persistence_manager(
        &self,
    ) -> Option<&Arc<dyn RegistrationPersistenceManager>> {
        self.registration_persistence.as_ref()
    }

    pub fn set_publication_persistence_manager(
        &mut self,
        manager: Arc<dyn PublicationPersistenceManager>,
    ) -> DumResult<()> {
        if self.publication_persistence.is_some() {
            return Err(DumError::HandlerAlreadyRegistered {
                handler: "PublicationPersistence",
            });
        }
        self.publication_persistence = Some(manager);
        Ok(())
    }

    /// Install (or with `None`, tear down) the dialog event observer.
    pub fn create_dialog_event_state_manager(
        &mut self,
        handler: Option<Arc<dyn DialogEventHandler>>,
    ) {
        self.handlers.dialog_event_state = handler.map(DialogEventStateManager::new);
    }

    // ===== lookups =====

    pub(crate) fn dialog_set_count(&self) -> usize {
        self.dialog_sets.len()
    }

    pub(crate) fn server_publication_count(&self) -> usize {
        self.server_publications.len()
    }

    /// A dialog set being destroyed is reported absent.
    pub fn find_dialog_set(&self, id: &DialogSetId) -> Option<&DialogSet> {
        self.dialog_sets.get(id).filter(|ds| !ds.is_destroying())
    }

    pub(crate) fn find_dialog_set_mut(&mut self, id: &DialogSetId) -> Option<&mut DialogSet> {
        self.dialog_sets
            .get_mut(id)
            .filter(|ds| !ds.is_destroying())
    }

    pub fn find_dialog(&self, id: &DialogId) -> Option<&Dialog> {
        self.find_dialog_set(id.set_id())
            .and_then(|ds| ds.find_dialog(id))
    }

    pub fn find_invite_session(&self, id: &DialogId) -> Option<UsageHandle> {
        self.find_dialog(id).and_then(|d| d.invite_session_handle())
    }

    /// RFC 3891 section 3: match a Replaces header to a local invite
    /// session. Returns the matched handle (when usable) and the status
    /// code an INVITE carrying this Replaces should be answered with when
    /// it is not.
    pub fn find_invite_session_by_replaces(
        &self,
        replaces: &Replaces,
    ) -> (Option<UsageHandle>, rsip::StatusCode) {
        // The peer's to-tag names our tag on the dialog.
        let dialog_id = DialogId::from_parts(
            replaces.call_id.clone(),
            replaces.to_tag.clone(),
            replaces.from_tag.clone(),
        );

        let Some(dialog) = self.find_dialog(&dialog_id) else {
            return (None, rsip::StatusCode::CallTransactionDoesNotExist);
        };
        let Some(session) = dialog.invite_session.as_ref() else {
            return (None, rsip::StatusCode::CallTransactionDoesNotExist);
        };

        if session.is_terminated() {
            return (None, rsip::StatusCode::Decline);
        }
        if session.is_connected() {
            if replaces.early_only {
                return (None, rsip::StatusCode::BusyHere);
            }
            return (dialog.invite_session_handle(), rsip::StatusCode::OK);
        }
        if !session.is_early() {
            // Early but not initiated here; RFC 3891 forbids the match.
            return (None, rsip::StatusCode::CallTransactionDoesNotExist);
        }
        (dialog.invite_session_handle(), rsip::StatusCode::OK)
    }

    pub fn find_creator(&self, id: &DialogId) -> Option<&Creator> {
        self.find_dialog_set(id.set_id()).and_then(|ds| ds.creator())
    }

    /// Is this handle still backed by a live usage?
    pub fn is_handle_valid(&self, handle: &UsageHandle) -> bool {
        self.resolve_serial(handle)
            .map(|serial| serial == handle.serial)
            .unwrap_or(false)
    }

    fn resolve_serial(&self, handle: &UsageHandle) -> Option<u64> {
        use UsageKind::*;
        match handle.id.kind {
            ServerPublication => {
                let etag = handle.id.key.as_deref()?;
                self.server_publications.get(etag).map(|p| p.serial)
            }
            ClientInviteSession | ServerInviteSession => {
                let dialog = self.find_dialog(handle.id.dialog.as_ref()?)?;
                dialog.invite_session.as_ref().map(|s| s.serial)
            }
            ClientSubscription => {
                let dialog = self.find_dialog(handle.id.dialog.as_ref()?)?;
                let event = handle.id.key.as_deref()?;
                dialog
                    .client_subscriptions
                    .iter()
                    .find(|s| s.event == event)
                    .map(|s| s.serial)
            }
            ServerSubscription => {
                let dialog = self.find_dialog(handle.id.dialog.as_ref()?)?;
                let event = handle.id.key.as_deref()?;
                dialog
                    .server_subscriptions
                    .iter()
                    .find(|s| s.event == event)
                    .map(|s| s.serial)
            }
            ClientRegistration => {
                let ds = self.find_dialog_set(handle.id.dialog_set.as_ref()?)?;
                ds.client_registration.as_ref().map(|u| u.serial)
            }
            ServerRegistration => {
                let ds = self.find_dialog_set(handle.id.dialog_set.as_ref()?)?;
                ds.server_registration.as_ref().map(|u| u.serial)
            }
            ClientPublication => {
                let ds = self.find_dialog_set(handle.id.dialog_set.as_ref()?)?;
                ds.client_publication.as_ref().map(|u| u.serial)
            }
            ClientOutOfDialog => {
                let ds = self.find_dialog_set(handle.id.dialog_set.as_ref()?)?;
                ds.client_out_of_dialog.as_ref().map(|u| u.serial)
            }
            ServerOutOfDialog => {
                let ds = self.find_dialog_set(handle.id.dialog_set.as_ref()?)?;
                ds.server_out_of_dialog.as_ref().map(|u| u.serial)
            }
            ClientPagerMessage => {
                let ds = self.find_dialog_set(handle.id.dialog_set.as_ref()?)?;
                ds.client_pager_message.as_ref().map(|u| u.serial)
            }
            ServerPagerMessage => {
                let ds = self.find_dialog_set(handle.id.dialog_set.as_ref()?)?;
                ds.server_pager_message.as_ref().map(|u| u.serial)
            }
        }
    }

    // ===== factories =====

    fn check_can_create(&self) -> DumResult<()> {
        if self.shutdown_handler.is_some() || self.shutdown_state != ShutdownState::Running {
            return Err(DumError::ShuttingDown);
        }
        Ok(())
    }

    fn adopt_uac_creator(&mut self, creator: Creator) -> SharedRequest {
        let request = creator.last_request();
        let set = DialogSet::new_uac(creator, &mut self.serials);
        debug!("adding dialog set {}", set.id());
        self.dialog_sets.insert(set.id().clone(), set);
        request
    }

    /// Open a new invite session towards `target`. The returned request
    /// may be decorated before `send()`.
    pub fn make_invite_session(
        &mut self,
        target: &str,
        user_profile: Option<Arc<UserProfile>>,
        offer: Option<(String, Vec<u8>)>,
    ) -> DumResult<SharedRequest> {
        self.check_can_create()?;
        let profile = match user_profile {
            Some(profile) => profile,
            None => self.master_user_profile()?,
        };
        Ok(self.adopt_uac_creator(Creator::invite_session(target, profile, offer, None)))
    }

    /// Invite that replaces an existing session (attended transfer).
    pub fn make_invite_session_to_replace(
        &mut self,
        target: &str,
        session_to_replace: &UsageHandle,
        user_profile: Option<Arc<UserProfile>>,
        offer: Option<(String, Vec<u8>)>,
    ) -> DumResult<SharedRequest> {
        self.check_can_create()?;
        if !self.is_handle_valid(session_to_replace) {
            return Err(DumError::protocol("session to replace no longer exists"));
        }
        let dialog_id = session_to_replace
            .id
            .dialog
            .as_ref()
            .ok_or_else(|| DumError::protocol("handle does not name a dialog"))?;
        let replaces = Replaces {
            call_id: dialog_id.call_id().to_string(),
            to_tag: dialog_id.remote_tag().to_string(),
            from_tag: dialog_id.local_tag().to_string(),
            early_only: false,
        };
        let profile = match user_profile {
            Some(profile) => profile,
            None => self.master_user_profile()?,
        };
        Ok(self.adopt_uac_creator(Creator::invite_session(target, profile, offer, Some(replaces))))
    }

    pub fn make_subscription(
        &mut self,
        target: &str,
        user_profile: Option<Arc<UserProfile>>,
        event: &str,
        subscription_time: Option<u32>,
    ) -> DumResult<SharedRequest> {
        self.check_can_create()?;
        let profile = match user_profile {
            Some(profile) => profile,
            None => self.master_user_profile()?,
        };
        let expires = subscription_time.unwrap_or_else(|| profile.default_subscription_time());
        Ok(self.adopt_uac_creator(Creator::subscription(target, profile, event, expires)))
    }

    pub fn make_registration(
        &mut self,
        target: &str,
        user_profile: Option<Arc<UserProfile>>,
        registration_time: Option<u32>,
    ) -> DumResult<SharedRequest> {
        self.check_can_create()?;
        let profile = match user_profile {
            Some(profile) => profile,
            None => self.master_user_profile()?,
        };
        let expires = registration_time.unwrap_or_else(|| profile.default_registration_time());
        Ok(self.adopt_uac_creator(Creator::registration(target, profile, expires)))
    }

    pub fn make_publication(
        &mut self,
        target: &str,
        user_profile: Option<Arc<UserProfile>>,
        event: &str,
        expires: u32,
        body: (String, Vec<u8>),
    ) -> DumResult<SharedRequest> {
        self.check_can_create()?;
        let profile = match user_profile {
            Some(profile) => profile,
            None => self.master_user_profile()?,
        };
        Ok(self.adopt_uac_creator(Creator::publication(target, profile, event, expires, body)))
    }

    pub fn make_out_of_dialog_request(
        &mut self,
        target: &str,
        user_profile: Option<Arc<UserProfile>>,
        method: rsip::Method,
    ) -> DumResult<SharedRequest> {
        self.check_can_create()?;
        let profile = match user_profile {
            Some(profile) => profile,
            None => self.master_user_profile()?,
        };
        Ok(self.adopt_uac_creator(Creator::out_of_dialog(target, profile, method)))
    }

    pub fn make_refer(
        &mut self,
        target: &str,
        user_profile: Option<Arc<UserProfile>>,
        refer_to: &str,
    ) -> DumResult<SharedRequest> {
        self.check_can_create()?;
        let profile = match user_profile {
            Some(profile) => profile,
            None => self.master_user_profile()?,
        };
        Ok(self.adopt_uac_creator(Creator::refer(target, profile, refer_to)))
    }

    /// Open a pager-message conversation. Requires a client pager
    /// handler: final responses have to go somewhere.
    pub fn make_pager_message(
        &mut self,
        target: &str,
        user_profile: Option<Arc<UserProfile>>,
    ) -> DumResult<UsageHandle> {
        self.check_can_create()?;
        if self.handlers.client_pager_message.is_none() {
            return Err(DumError::MissingHandler {
                handler: "ClientPagerMessage",
                operation: "send MESSAGE requests",
            });
        }
        let profile = match user_profile {
            Some(profile) => profile,
            None => self.master_user_profile()?,
        };
        let creator = Creator::pager_message(target, profile);
        let set_id = DialogSetId::new(creator.base().call_id(), creator.base().local_tag());
        self.adopt_uac_creator(creator);
        self.dialog_sets
            .get(&set_id)
            .and_then(|ds| ds.client_pager_message_handle())
            .ok_or_else(|| DumError::DialogSetNotFound { id: set_id })
    }

    /// Queue a page on an open pager conversation, sending it immediately
    /// when nothing is in flight.
    pub fn send_page(
        &mut self,
        pager: &UsageHandle,
        content_type: impl Into<String>,
        body: Vec<u8>,
    ) -> DumResult<()> {
        if !self.is_handle_valid(pager) {
            return Err(DumError::protocol("pager message usage no longer exists"));
        }
        let set_id = pager
            .id
            .dialog_set
            .clone()
            .ok_or_else(|| DumError::protocol("pager handle without dialog set"))?;
        let request = {
            let ds = self
                .dialog_sets
                .get_mut(&set_id)
                .ok_or_else(|| DumError::DialogSetNotFound { id: set_id.clone() })?;
            let send_now = ds
                .client_pager_message
                .as_mut()
                .map(|p| p.page(content_type, body))
                .unwrap_or(false);
            if send_now {
                ds.make_next_page()
            } else {
                None
            }
        };
        if let Some(request) = request {
            self.send_request_now(request)?;
        }
        Ok(())
    }

    /// RFC 3515 19.1.5 flavoured INVITE built from a REFER. When a server
    /// subscription handle is given, the implicit subscription goes
    /// active and a 100-Trying sipfrag NOTIFY precedes the INVITE.
    pub fn make_invite_session_from_refer(
        &mut self,
        refer: &rsip::Request,
        server_subscription: Option<&UsageHandle>,
        offer: Option<(String, Vec<u8>)>,
    ) -> DumResult<SharedRequest> {
        self.check_can_create()?;

        let profile = match server_subscription {
            Some(handle) => self
                .is_handle_valid(handle)
                .then(|| {
                    handle
                        .id
                        .dialog_set
                        .as_ref()
                        .and_then(|id| self.find_dialog_set(id))
                        .map(|ds| Arc::clone(ds.user_profile()))
                })
                .flatten()
                .map(Ok)
                .unwrap_or_else(|| self.master_user_profile())?,
            None => self.master_user_profile()?,
        };

        if let Some(handle) = server_subscription {
            if self.is_handle_valid(handle) {
                let notify = self.build_refer_progress_notify(handle);
                if let Some(notify) = notify {
                    self.send_request_now(notify)?;
                }
            }
        }

        let refer_to = rsip_ext::header_value(&refer.headers, "Refer-To")
            .ok_or_else(|| DumError::bad_header("Refer-To"))?;
        let (target, embedded_replaces) = split_refer_target(&refer_to);

        let creator_request = {
            let replaces = embedded_replaces.as_deref().and_then(Replaces::parse);
            let creator = Creator::invite_session(&target, profile, offer, replaces);
            self.adopt_uac_creator(creator)
        };

        if let Some(referred_by) = rsip_ext::header_value(&refer.headers, "Referred-By") {
            if let Ok(mut request) = creator_request.lock() {
                request
                    .headers
                    .push(rsip::Header::Other("Referred-By".into(), referred_by));
            }
        }

        Ok(creator_request)
    }

    fn build_refer_progress_notify(&mut self, handle: &UsageHandle) -> Option<rsip::Request> {
        let dialog_id = handle.id.dialog.clone()?;
        let ds = self.find_dialog_set_mut(dialog_id.set_id())?;
        let dialog = ds.find_dialog_mut(&dialog_id)?;
        let event = handle.id.key.as_deref().unwrap_or("refer").to_string();
        let state_value = {
            let sub = dialog
                .server_subscriptions
                .iter_mut()
                .find(|s| s.event == event)?;
            sub.set_subscription_state(SubscriptionState::Active);
            sub.subscription_state_value()
        };
        Some(dialog.make_notify(
            &event,
            &state_value,
            Some((
                "message/sipfrag".to_string(),
                b"SIP/2.0 100 Trying\r\n".to_vec(),
            )),
        ))
    }

    // ===== teardown =====

    /// End every usage in a dialog set.
    pub fn end(&mut self, id: &DialogSetId) -> DumResult<()> {
        let actions = match self.find_dialog_set_mut(id) {
            Some(ds) => ds.end(),
            None => {
                return Err(DumError::DialogSetNotFound { id: id.clone() });
            }
        };
        self.apply_actions(actions);
        Ok(())
    }

    /// End one usage through its handle.
    pub fn end_usage(&mut self, handle: &UsageHandle, reason: EndReason) {
        if !self.is_handle_valid(handle) {
            return;
        }
        let _ = reason;
        self.destroy(DestroyTarget::Usage(handle.clone()));
    }

    /// Terminate every server subscription, in the usual snapshot-then-end
    /// order so removal during iteration cannot bite.
    pub fn end_all_server_subscriptions(&mut self, reason: EndReason) {
        let handles: Vec<UsageHandle> = self
            .dialog_sets
            .values()
            .flat_map(|ds| ds.dialogs())
            .flat_map(|dialog| {
                dialog
                    .server_subscriptions
                    .iter()
                    .filter_map(|sub| dialog.server_subscription_handle(&sub.event))
                    .collect::<Vec<_>>()
            })
            .collect();
        for handle in handles {
            self.end_usage(&handle, reason);
        }
    }

    pub fn end_all_server_publications(&mut self) {
        let etags: Vec<String> = self.server_publications.keys().cloned().collect();
        for etag in etags {
            if let Some(publication) = self.server_publications.remove(&etag) {
                let handle = UsageHandle::new(
                    crate::usage::UsageId {
                        dialog_set: None,
                        dialog: None,
                        kind: UsageKind::ServerPublication,
                        key: Some(etag),
                    },
                    publication.serial,
                );
                if let Some(handler) = self.handlers.server_publication.get(&publication.event) {
                    handler.on_removed(&handle);
                }
            }
        }
        self.shutdown_when_empty();
    }

    /// Deferred destruction; no-op once the manager is being dropped.
    pub fn destroy(&mut self, target: DestroyTarget) {
        if self.shutdown_state != ShutdownState::Destroying {
            self.post(DumEvent::DestroyUsage(target));
        } else {
            info!("destroy() ignored while manager is being torn down");
        }
    }

    // ===== action application =====

    pub(crate) fn apply_actions(&mut self, actions: Vec<DumAction>) {
        for action in actions {
            match action {
                DumAction::SendResponse(response) => self.send_response(response),
                DumAction::SendRequest { request, .. } => {
                    if let Err(err) = self.send_request_now(request) {
                        warn!("failed to send usage request: {}", err);
                    }
                }
                DumAction::StartTimer { timeout, delay } => {
                    self.add_timer(timeout, delay);
                }
                DumAction::Destroy(target) => {
                    // Teardown is deferred through the FIFO so it never
                    // runs inside the dispatch that decided on it. A set
                    // slated for destruction stops resolving immediately.
                    if let DestroyTarget::DialogSet(id) = &target {
                        if let Some(ds) = self.dialog_sets.get_mut(id) {
                            ds.mark_destroying();
                        }
                    }
                    self.destroy(target);
                }
                DumAction::RegisterCancel {
                    transaction_id,
                    dialog,
                } => {
                    self.cancel_map.insert(transaction_id, dialog);
                }
            }
        }
    }

    /// Arm a usage timer through the stack's timer facility.
    pub fn add_timer(&self, timeout: DumTimeout, delay: Duration) {
        self.stack.post_to_tu(DumEvent::Timeout(timeout), delay);
    }

    pub(crate) fn destroy_now(&mut self, target: DestroyTarget) {
        match target {
            DestroyTarget::Usage(handle) => self.destroy_usage_now(&handle),
            DestroyTarget::Dialog(id) => self.destroy_dialog_now(&id),
            DestroyTarget::DialogSet(id) => self.destroy_dialog_set_now(&id),
        }
    }

    fn destroy_usage_now(&mut self, handle: &UsageHandle) {
        if !self.is_handle_valid(handle) {
            return;
        }
        use UsageKind::*;
        match handle.id.kind {
            ServerPublication => {
                if let Some(etag) = handle.id.key.as_deref() {
                    self.server_publications.remove(etag);
                    self.shutdown_when_empty();
                }
            }
            ClientInviteSession | ServerInviteSession => {
                if let Some(dialog_id) = handle.id.dialog.clone() {
                    self.destroy_dialog_now(&dialog_id);
                }
            }
            ClientSubscription | ServerSubscription => {
                if let (Some(dialog_id), Some(event)) =
                    (handle.id.dialog.clone(), handle.id.key.clone())
                {
                    let mut dialog_gone = false;
                    if let Some(ds) = self.dialog_sets.get_mut(dialog_id.set_id()) {
                        if let Some(dialog) = ds.find_dialog_mut(&dialog_id) {
                            dialog.client_subscriptions.retain(|s| s.event != event);
                            dialog.server_subscriptions.retain(|s| s.event != event);
                            dialog_gone = !dialog.has_live_usages();
                        }
                    }
                    if dialog_gone {
                        self.destroy_dialog_now(&dialog_id);
                    }
                }
            }
            _ => {
                if let Some(set_id) = handle.id.dialog_set.clone() {
                    if let Some(ds) = self.dialog_sets.get_mut(&set_id) {
                        match handle.id.kind {
                            ClientRegistration => ds.client_registration = None,
                            ServerRegistration => ds.server_registration = None,
                            ClientPublication => ds.client_publication = None,
                            ClientOutOfDialog => ds.client_out_of_dialog = None,
                            ServerOutOfDialog => ds.server_out_of_dialog = None,
                            ClientPagerMessage => ds.client_pager_message = None,
                            ServerPagerMessage => ds.server_pager_message = None,
                            _ => {}
                        }
                        let empty = ds.is_empty_of_dialogs() && !ds.has_live_non_dialog_usages();
                        if empty {
                            self.destroy_dialog_set_now(&set_id);
                        }
                    }
                }
            }
        }
    }

    fn destroy_dialog_now(&mut self, id: &DialogId) {
        self.cancel_map.retain(|_, dialog| dialog != id);
        let mut set_empty = false;
        if let Some(ds) = self.dialog_sets.get_mut(id.set_id()) {
            ds.remove_dialog(id);
            set_empty = ds.is_empty_of_dialogs() && !ds.has_live_non_dialog_usages();
        }
        if let Some(events) = &self.handlers.dialog_event_state {
            events.on_terminated(id);
        }
        if set_empty {
            self.destroy_dialog_set_now(&id.set_id().clone());
        }
    }

    pub(crate) fn destroy_dialog_set_now(&mut self, id: &DialogSetId) {
        if let Some(mut ds) = self.dialog_sets.remove(id) {
            debug!("removing dialog set {}", id);
            ds.mark_destroying();
            if let Some(from_tag) = ds.origin_from_tag() {
                self.uas_origins
                    .remove(&(id.call_id().to_string(), from_tag.to_string()));
            }
            if let Some(handler) = &self.handlers.dialog_set {
                handler.on_destroyed(id);
            }
        }
        if self.shutdown_handler.is_some() {
            self.shutdown_when_empty();
        }
    }
}

/// RFC 3515 19.1.5: the Refer-To URI becomes the INVITE target with its
/// embedded headers and method parameter stripped; an embedded Replaces
/// header survives into the INVITE.
fn split_refer_target(refer_to: &str) -> (String, Option<String>) {
    let inner = refer_to
        .split('<')
        .nth(1)
        .and_then(|s| s.split('>').next())
        .unwrap_or(refer_to.trim());

    let (uri_part, embedded) = match inner.split_once('?') {
        Some((uri, embedded)) => (uri, Some(embedded)),
        None => (inner, None),
    };

    // Strip any ;method= parameter from the target.
    let target = uri_part
        .split(';')
        .filter(|part| !part.trim_start().to_ascii_lowercase().starts_with("method="))
        .collect::<Vec<_>>()
        .join(";");

    let replaces = embedded.and_then(|embedded| {
        embedded.split('&').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name.eq_ignore_ascii_case("Replaces") {
                Some(percent_decode(value))
            } else {
                None
            }
        })
    });

    (target, replaces)
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            let hex = &value[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
