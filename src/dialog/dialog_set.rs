//! Dialog sets: every dialog sharing one Call-ID and local tag.
//!
//! A set is created either around a creator (UAC side, one per `make_*`
//! call) or from an incoming dialog-forming request (UAS side). It owns
//! its dialogs and the non-dialog usages (registration, publication,
//! out-of-dialog request, pager message) that never grow a remote tag.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use rsip::prelude::{HeadersExt, UntypedHeader};

use crate::creator::Creator;
use crate::dialog::{Dialog, DialogId, DialogSetId};
use crate::errors::{DumError, DumResult};
use crate::events::{DestroyTarget, DumAction, TransactionId};
use crate::handlers::Handlers;
use crate::profile::{MasterProfile, UserProfile};
use crate::rsip_ext;
use crate::usage::{
    ClientOutOfDialog, ClientPagerMessage, ClientPublication, ClientRegistration,
    ClientSubscription, InviteSession, RegistrationState, SerialCounter, ServerOutOfDialog,
    ServerPagerMessage, ServerRegistration, ServerSubscription, SubscriptionState, UsageHandle,
    UsageId, UsageKind,
};
use crate::util;

/// A set of dialogs sharing `(Call-ID, local tag)`, plus the usages that
/// live outside any dialog.
pub struct DialogSet {
    id: DialogSetId,
    user_profile: Arc<UserProfile>,
    creator: Option<Creator>,
    dialogs: HashMap<DialogId, Dialog>,
    is_destroying: bool,
    /// From tag of the originating request on the UAS side; keyed in the
    /// manager's origin index for duplicate detection.
    origin_from_tag: Option<String>,

    pub client_registration: Option<ClientRegistration>,
    pub server_registration: Option<ServerRegistration>,
    pub client_publication: Option<ClientPublication>,
    pub client_out_of_dialog: Option<ClientOutOfDialog>,
    pub server_out_of_dialog: Option<ServerOutOfDialog>,
    pub client_pager_message: Option<ClientPagerMessage>,
    pub server_pager_message: Option<ServerPagerMessage>,

    /// CSeq for follow-up pages on a pager-message set.
    pager_cseq: u32,
}

impl DialogSet {
    /// UAC-side set wrapping a creator. The matching client-side
    /// non-dialog usage is created eagerly so responses have a target.
    pub fn new_uac(creator: Creator, serials: &mut SerialCounter) -> DialogSet {
        let id = DialogSetId::new(creator.base().call_id(), creator.base().local_tag());
        let user_profile = Arc::clone(creator.base().user_profile());

        let mut set = DialogSet {
            id,
            user_profile,
            creator: None,
            dialogs: HashMap::new(),
            is_destroying: false,
            origin_from_tag: None,
            client_registration: None,
            server_registration: None,
            client_publication: None,
            client_out_of_dialog: None,
            server_out_of_dialog: None,
            client_pager_message: None,
            server_pager_message: None,
            pager_cseq: 1,
        };

        match &creator {
            Creator::Registration(_) => {
                let aor = set
                    .user_profile
                    .default_from()
                    .unwrap_or("<sip:anonymous@anonymous.invalid>")
                    .to_string();
                set.client_registration = Some(ClientRegistration::new(
                    serials.next(),
                    aor,
                    set.user_profile.default_registration_time(),
                ));
            }
            Creator::Publication { event, .. } => {
                set.client_publication =
                    Some(ClientPublication::new(serials.next(), event.clone(), 3600));
            }
            Creator::OutOfDialog(base) => {
                let request = base.last_request();
                let method = request
                    .lock()
                    .map(|r| r.method.clone())
                    .unwrap_or(rsip::Method::Options);
                set.client_out_of_dialog = Some(ClientOutOfDialog::new(serials.next(), method));
            }
            Creator::PagerMessage(_) => {
                set.client_pager_message = Some(ClientPagerMessage::new(serials.next()));
            }
            _ => {}
        }

        set.creator = Some(creator);
        set
    }

    /// UAS-side set for an incoming dialog-forming request. Generates the
    /// local tag that will identify this set for its whole life.
    pub fn new_uas(request: &rsip::Request, user_profile: Arc<UserProfile>) -> DumResult<DialogSet> {
        let call_id = request
            .call_id_header()
            .map_err(|_| DumError::bad_header("Call-Id"))?
            .value()
            .to_string();
        Ok(DialogSet {
            id: DialogSetId::new(call_id, rsip_ext::make_tag()),
            user_profile,
            creator: None,
            dialogs: HashMap::new(),
            is_destroying: false,
            origin_from_tag: rsip_ext::from_tag(request),
            client_registration: None,
            server_registration: None,
            client_publication: None,
            client_out_of_dialog: None,
            server_out_of_dialog: None,
            client_pager_message: None,
            server_pager_message: None,
            pager_cseq: 1,
        })
    }

    pub fn id(&self) -> &DialogSetId {
        &self.id
    }

    pub fn user_profile(&self) -> &Arc<UserProfile> {
        &self.user_profile
    }

    pub fn set_user_profile(&mut self, profile: Arc<UserProfile>) {
        self.user_profile = profile;
    }

    pub fn creator(&self) -> Option<&Creator> {
        self.creator.as_ref()
    }

    pub fn origin_from_tag(&self) -> Option<&str> {
        self.origin_from_tag.as_deref()
    }

    pub fn is_destroying(&self) -> bool {
        self.is_destroying
    }

    pub fn mark_destroying(&mut self) {
        self.is_destroying = true;
    }

    pub fn find_dialog(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialogs.get(id)
    }

    pub fn find_dialog_mut(&mut self, id: &DialogId) -> Option<&mut Dialog> {
        self.dialogs.get_mut(id)
    }

    pub fn dialogs(&self) -> impl Iterator<Item = &Dialog> {
        self.dialogs.values()
    }

    pub fn remove_dialog(&mut self, id: &DialogId) {
        self.dialogs.remove(id);
    }

    pub fn is_empty_of_dialogs(&self) -> bool {
        self.dialogs.is_empty()
    }

    fn usage_handle(&self, kind: UsageKind, key: Option<String>, serial: u64) -> UsageHandle {
        UsageHandle::new(
            UsageId {
                dialog_set: Some(self.id.clone()),
                dialog: None,
                kind,
                key,
            },
            serial,
        )
    }

    pub fn client_registration_handle(&self) -> Option<UsageHandle> {
        self.client_registration
            .as_ref()
            .map(|r| self.usage_handle(UsageKind::ClientRegistration, None, r.serial))
    }

    pub fn client_pager_message_handle(&self) -> Option<UsageHandle> {
        self.client_pager_message
            .as_ref()
            .map(|p| self.usage_handle(UsageKind::ClientPagerMessage, None, p.serial))
    }

    /// Anything (other than the bare creator) still keeping this set up?
    pub fn has_live_non_dialog_usages(&self) -> bool {
        let registration_live = self
            .client_registration
            .as_ref()
            .map(|r| r.state != RegistrationState::Unregistered)
            .unwrap_or(false);
        let publication_live = self.client_publication.is_some();
        let ood_live = self
            .client_out_of_dialog
            .as_ref()
            .map(|u| !u.completed)
            .unwrap_or(false);
        let pager_live = self
            .client_pager_message
            .as_ref()
            .map(|p| p.in_flight || !p.queued.is_empty())
            .unwrap_or(false);
        registration_live || publication_live || ood_live || pager_live
    }

    /// The RFC 5626 flow this set rides on died.
    pub fn flow_terminated(&self, handlers: &Handlers) {
        if let Some(handle) = self.client_registration_handle() {
            info!("flow gone, prompting re-registration on {}", self.id);
            handlers.notify_client_registration_flow_terminated(&handle);
        }
    }

    /// Route a request that resolved to this set.
    pub fn dispatch_request(
        &mut self,
        request: &rsip::Request,
        transaction_id: Option<&TransactionId>,
        master: &MasterProfile,
        handlers: &Handlers,
        serials: &mut SerialCounter,
    ) -> Vec<DumAction> {
        if rsip_ext::to_tag(request).is_some() {
            self.dispatch_in_dialog_request(request, master, handlers, serials)
        } else {
            self.dispatch_initial_request(request, transaction_id, master, handlers, serials)
        }
    }

    fn dispatch_in_dialog_request(
        &mut self,
        request: &rsip::Request,
        master: &MasterProfile,
        handlers: &Handlers,
        serials: &mut SerialCounter,
    ) -> Vec<DumAction> {
        let Some(dialog_id) = DialogId::of_incoming_request(request) else {
            return Vec::new();
        };

        // A NOTIFY can beat the 2xx that would have materialised the
        // dialog on a subscription we created; build the dialog from the
        // NOTIFY itself in that case.
        if !self.dialogs.contains_key(&dialog_id)
            && request.method == rsip::Method::Notify
        {
            if let Some(Creator::Subscription { event, .. }) = &self.creator {
                if let Ok(mut dialog) = Dialog::new_uas(dialog_id.clone(), request) {
                    dialog.client_subscriptions.push(ClientSubscription::new(
                        serials.next(),
                        event.clone(),
                        self.user_profile.default_subscription_time(),
                    ));
                    debug!("materialised dialog {} from early NOTIFY", dialog_id);
                    self.dialogs.insert(dialog_id.clone(), dialog);
                }
            }
        }

        match self.dialogs.get_mut(&dialog_id) {
            Some(dialog) => dialog.dispatch_request(request, master, handlers, serials),
            None => {
                if request.method == rsip::Method::Ack {
                    debug!("ACK matches no dialog in {}, dropping", self.id);
                    Vec::new()
                } else {
                    info!("no dialog {} in set, answering 481", dialog_id);
                    vec![DumAction::SendResponse(util::make_response(
                        request,
                        rsip::StatusCode::CallTransactionDoesNotExist,
                        Some(self.id.local_tag()),
                    ))]
                }
            }
        }
    }

    fn dispatch_initial_request(
        &mut self,
        request: &rsip::Request,
        transaction_id: Option<&TransactionId>,
        master: &MasterProfile,
        handlers: &Handlers,
        serials: &mut SerialCounter,
    ) -> Vec<DumAction> {
        use rsip::Method;

        let local_tag = self.id.local_tag().to_string();
        let mut actions = Vec::new();

        match request.method {
            Method::Invite => {
                let dialog_id = DialogId::new(
                    self.id.clone(),
                    rsip_ext::from_tag(request).unwrap_or_default(),
                );
                match Dialog::new_uas(dialog_id.clone(), request) {
                    Ok(mut dialog) => {
                        dialog.invite_session = Some(InviteSession::new_uas(
                            serials.next(),
                            request.clone(),
                            transaction_id.cloned(),
                        ));
                        let handle = dialog.invite_session_handle();
                        self.dialogs.insert(dialog_id.clone(), dialog);
                        if let Some(handle) = handle {
                            handlers.notify_invite_new(&handle, request);
                        }
                        handlers.notify_dialog_early(&dialog_id);
                        if let Some(tid) = transaction_id {
                            actions.push(DumAction::RegisterCancel {
                                transaction_id: tid.clone(),
                                dialog: dialog_id,
                            });
                        }
                    }
                    Err(err) => {
                        info!("cannot build UAS dialog: {}", err);
                        let mut response = util::make_response(
                            request,
                            rsip::StatusCode::BadRequest,
                            Some(&local_tag),
                        );
                        util::add_warning(&mut response, &err.to_string());
                        actions.push(DumAction::SendResponse(response));
                    }
                }
            }
            Method::Subscribe | Method::Refer => {
                let event = if request.method == Method::Refer {
                    "refer".to_string()
                } else {
                    rsip_ext::event_package(&request.headers).unwrap_or_default()
                };
                let dialog_id = DialogId::new(
                    self.id.clone(),
                    rsip_ext::from_tag(request).unwrap_or_default(),
                );
                match Dialog::new_uas(dialog_id.clone(), request) {
                    Ok(mut dialog) => {
                        let expires = rsip_ext::header_value(&request.headers, "Expires")
                            .and_then(|v| v.parse::<u32>().ok())
                            .unwrap_or_else(|| {
                                master.user_profile().default_subscription_time()
                            });
                        let mut sub =
                            ServerSubscription::new(serials.next(), event.clone(), expires);
                        sub.set_subscription_state(SubscriptionState::Pending);
                        dialog.server_subscriptions.push(sub);
                        let handle = dialog.server_subscription_handle(&event);
                        self.dialogs.insert(dialog_id, dialog);
                        if let Some(handle) = handle {
                            handlers.notify_server_subscription_new(&handle, &event, request);
                        }
                        let mut response = util::make_response(
                            request,
                            rsip::StatusCode::Accepted,
                            Some(&local_tag),
                        );
                        response
                            .headers
                            .push(rsip::Header::Expires(expires.to_string().into()));
                        actions.push(DumAction::SendResponse(response));
                    }
                    Err(err) => {
                        info!("cannot build UAS dialog: {}", err);
                        actions.push(DumAction::SendResponse(util::make_response(
                            request,
                            rsip::StatusCode::BadRequest,
                            Some(&local_tag),
                        )));
                    }
                }
            }
            Method::Notify => {
                // Unsolicited NOTIFY: no subscription was ever created.
                info!("unsolicited NOTIFY, answering 481");
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::CallTransactionDoesNotExist,
                    Some(&local_tag),
                )));
                actions.push(DumAction::Destroy(DestroyTarget::DialogSet(self.id.clone())));
            }
            Method::Options => {
                let serial = serials.next();
                self.server_out_of_dialog = Some(ServerOutOfDialog::new(serial, Method::Options));
                let handle = self.usage_handle(UsageKind::ServerOutOfDialog, None, serial);
                if let Some(handler) = handlers.out_of_dialog_handler(&Method::Options) {
                    handler.on_received_request(&handle, request);
                }
                let mut response =
                    util::make_response(request, rsip::StatusCode::OK, Some(&local_tag));
                util::add_capabilities(&mut response.headers, master, &self.user_profile);
                actions.push(DumAction::SendResponse(response));
                actions.push(DumAction::Destroy(DestroyTarget::DialogSet(self.id.clone())));
            }
            Method::Message => {
                if handlers.server_pager_message.is_some() {
                    let serial = serials.next();
                    self.server_pager_message = Some(ServerPagerMessage::new(serial));
                    let handle = self.usage_handle(UsageKind::ServerPagerMessage, None, serial);
                    if let Some(handler) = &handlers.server_pager_message {
                        handler.on_message_arrived(&handle, request);
                    }
                    actions.push(DumAction::SendResponse(util::make_response(
                        request,
                        rsip::StatusCode::OK,
                        Some(&local_tag),
                    )));
                } else {
                    let mut response = util::make_response(
                        request,
                        rsip::StatusCode::MethodNotAllowed,
                        Some(&local_tag),
                    );
                    response
                        .headers
                        .push(rsip::Header::Allow(master.allowed_methods_value().into()));
                    actions.push(DumAction::SendResponse(response));
                }
                actions.push(DumAction::Destroy(DestroyTarget::DialogSet(self.id.clone())));
            }
            Method::Register => {
                if handlers.server_registration.is_some() {
                    let serial = serials.next();
                    self.server_registration =
                        Some(ServerRegistration::new(serial, util::request_aor(request)));
                    let handle = self.usage_handle(UsageKind::ServerRegistration, None, serial);
                    if let Some(handler) = &handlers.server_registration {
                        handler.on_register(&handle, request);
                    }
                    let mut response =
                        util::make_response(request, rsip::StatusCode::OK, Some(&local_tag));
                    if let Some(expires) = rsip_ext::header_value(&request.headers, "Expires") {
                        response.headers.push(rsip::Header::Expires(expires.into()));
                    }
                    actions.push(DumAction::SendResponse(response));
                } else {
                    let mut response = util::make_response(
                        request,
                        rsip::StatusCode::MethodNotAllowed,
                        Some(&local_tag),
                    );
                    response
                        .headers
                        .push(rsip::Header::Allow(master.allowed_methods_value().into()));
                    actions.push(DumAction::SendResponse(response));
                }
                actions.push(DumAction::Destroy(DestroyTarget::DialogSet(self.id.clone())));
            }
            _ => {
                debug!("initial {} has no usage here, answering 501", request.method);
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::NotImplemented,
                    Some(&local_tag),
                )));
                actions.push(DumAction::Destroy(DestroyTarget::DialogSet(self.id.clone())));
            }
        }

        actions
    }

    /// Route a response that resolved to this set.
    pub fn dispatch_response(
        &mut self,
        response: &rsip::Response,
        handlers: &Handlers,
        serials: &mut SerialCounter,
    ) -> Vec<DumAction> {
        use rsip::Method;

        let mut actions = Vec::new();
        let status = util::status_u16(&response.status_code);
        let Some((_, method)) = rsip_ext::cseq_of(response) else {
            return actions;
        };

        match method {
            Method::Invite | Method::Subscribe | Method::Refer => {
                actions.extend(
                    self.dispatch_dialog_creating_response(&method, status, response, handlers, serials),
                );
            }
            Method::Register => {
                let info = self.client_registration.as_mut().map(|registration| {
                    registration.on_status(status);
                    (registration.serial, registration.is_registered())
                });
                if let Some((serial, registered)) = info {
                    let handle = self.usage_handle(UsageKind::ClientRegistration, None, serial);
                    handlers.notify_client_registration_status(
                        &handle,
                        (200..300).contains(&status),
                        response,
                    );
                    if !registered && status >= 300 {
                        actions.push(DumAction::Destroy(DestroyTarget::DialogSet(
                            self.id.clone(),
                        )));
                    }
                }
            }
            Method::Publish => {
                let success = (200..300).contains(&status);
                let info = self.client_publication.as_mut().map(|publication| {
                    if success {
                        publication.on_success(response);
                    }
                    (publication.serial, publication.event.clone())
                });
                if let Some((serial, event)) = info {
                    let handle = self.usage_handle(
                        UsageKind::ClientPublication,
                        Some(event.clone()),
                        serial,
                    );
                    handlers.notify_client_publication_status(&event, &handle, success, response);
                    if !success && status >= 300 {
                        self.client_publication = None;
                        actions.push(DumAction::Destroy(DestroyTarget::DialogSet(
                            self.id.clone(),
                        )));
                    }
                }
            }
            Method::Message if status >= 200 => {
                let more = self
                    .client_pager_message
                    .as_mut()
                    .map(|pager| pager.on_final_response());
                if let Some(more) = more {
                    if let Some(handle) = self.client_pager_message_handle() {
                        handlers.notify_pager_response(
                            &handle,
                            (200..300).contains(&status),
                            response,
                        );
                    }
                    if more {
                        if let Some(request) = self.make_next_page() {
                            actions.push(DumAction::SendRequest {
                                dialog_set: self.id.clone(),
                                request,
                            });
                        }
                    } else {
                        actions.push(DumAction::Destroy(DestroyTarget::DialogSet(
                            self.id.clone(),
                        )));
                    }
                }
            }
            _ if status >= 200 => {
                let serial = self.client_out_of_dialog.as_mut().map(|ood| {
                    ood.on_status(status);
                    ood.serial
                });
                if let Some(serial) = serial {
                    let handle = self.usage_handle(UsageKind::ClientOutOfDialog, None, serial);
                    handlers.notify_out_of_dialog_response(
                        &method,
                        &handle,
                        (200..300).contains(&status),
                        response,
                    );
                    actions.push(DumAction::Destroy(DestroyTarget::DialogSet(self.id.clone())));
                } else {
                    debug!("stray {} response for {}, ignoring", method, self.id);
                }
            }
            _ => {}
        }

        actions
    }

    fn dispatch_dialog_creating_response(
        &mut self,
        method: &rsip::Method,
        status: u16,
        response: &rsip::Response,
        handlers: &Handlers,
        serials: &mut SerialCounter,
    ) -> Vec<DumAction> {
        let mut actions = Vec::new();

        if status == 100 {
            return actions;
        }

        let Some(dialog_id) = DialogId::of_incoming_response(response) else {
            return actions;
        };

        if !self.dialogs.contains_key(&dialog_id) {
            let original = match &self.creator {
                Some(creator) => creator.last_request(),
                None => return actions,
            };
            let original = match original.lock() {
                Ok(request) => request.clone(),
                Err(_) => return actions,
            };
            match Dialog::new_uac(dialog_id.clone(), &original, response) {
                Ok(mut dialog) => {
                    // Hand the new dialog its usage, mirroring the creator.
                    if *method == rsip::Method::Invite {
                        dialog.invite_session =
                            Some(InviteSession::new_uac(serials.next(), original));
                    } else if let Some(Creator::Subscription { event, .. }) = &self.creator {
                        dialog.client_subscriptions.push(ClientSubscription::new(
                            serials.next(),
                            event.clone(),
                            self.user_profile.default_subscription_time(),
                        ));
                    }
                    debug!("materialised dialog {} from response", dialog_id);
                    let state = dialog.state;
                    self.dialogs.insert(dialog_id.clone(), dialog);
                    if *method == rsip::Method::Invite {
                        match state {
                            crate::dialog::DialogState::Early => {
                                handlers.notify_dialog_early(&dialog_id)
                            }
                            crate::dialog::DialogState::Confirmed => {
                                handlers.notify_dialog_confirmed(&dialog_id)
                            }
                            crate::dialog::DialogState::Terminated => {}
                        }
                    }
                }
                Err(err) => {
                    info!("cannot materialise dialog from response: {}", err);
                    return actions;
                }
            }
        }

        if let Some(dialog) = self.dialogs.get_mut(&dialog_id) {
            actions.extend(dialog.dispatch_response(response, handlers));
        }
        actions
    }

    /// Next queued page as a MESSAGE request reusing the creator identity.
    pub fn make_next_page(&mut self) -> Option<rsip::Request> {
        let creator = self.creator.as_ref()?;
        let pager = self.client_pager_message.as_ref()?;
        let (content_type, body) = pager.queued.first()?.clone();

        let template = creator.last_request();
        let mut request = template.lock().ok()?.clone();
        self.pager_cseq += 1;
        let cseq = format!("{} {}", self.pager_cseq, rsip::Method::Message);
        rsip_ext::remove_header(&mut request.headers, "CSeq");
        request.headers.push(rsip::Header::CSeq(cseq.into()));
        rsip_ext::remove_header(&mut request.headers, "Content-Type");
        rsip_ext::remove_header(&mut request.headers, "Content-Length");
        request
            .headers
            .push(rsip::Header::ContentType(content_type.into()));
        request
            .headers
            .push(rsip::Header::ContentLength((body.len() as u32).into()));
        request.body = body;
        Some(request)
    }

    /// Orderly teardown of everything in the set.
    pub fn end(&mut self) -> Vec<DumAction> {
        let mut actions = Vec::new();
        for dialog in self.dialogs.values_mut() {
            actions.extend(dialog.end());
        }
        if self.dialogs.is_empty() {
            actions.push(DumAction::Destroy(DestroyTarget::DialogSet(self.id.clone())));
        }
        actions
    }
}
