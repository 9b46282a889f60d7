//! One confirmed or early dialog.
//!
//! A dialog owns at most one invite session plus any number of
//! subscriptions. Its identity is fixed at creation; tags never change
//! once the establishing message has been seen. Dispatch never touches
//! the wire directly: it returns [`DumAction`]s the manager applies after
//! the borrow ends.

use tracing::{debug, info, warn};

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Param};

use crate::dialog::{DialogId, DialogState};
use crate::errors::{DumError, DumResult};
use crate::events::{DestroyTarget, DumAction};
use crate::handlers::Handlers;
use crate::profile::MasterProfile;
use crate::rsip_ext;
use crate::usage::{
    ClientSubscription, InviteSession, SerialCounter, ServerSubscription, SubscriptionState,
    UsageHandle, UsageId, UsageKind,
};
use crate::util;

/// A single RFC 3261 dialog and the usages living inside it.
#[derive(Debug)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    local_cseq: u32,
    remote_cseq: u32,
    /// Rendered From/To values for requests we originate in this dialog.
    local_value: String,
    remote_value: String,
    remote_target: rsip::Uri,
    route_set: Vec<rsip::headers::Route>,
    local_contact: Option<rsip::Uri>,
    pub invite_session: Option<InviteSession>,
    pub client_subscriptions: Vec<ClientSubscription>,
    pub server_subscriptions: Vec<ServerSubscription>,
}

impl Dialog {
    /// Materialise a UAS dialog from a dialog-creating request. The local
    /// tag is the one the owning set generated; every response we send in
    /// this dialog carries it.
    pub fn new_uas(id: DialogId, request: &rsip::Request) -> DumResult<Dialog> {
        let mut local = request
            .to_header()
            .map_err(|_| DumError::bad_header("To"))?
            .typed()
            .map_err(|_| DumError::bad_header("To"))?;
        if !local.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            local
                .params
                .push(Param::Tag(id.local_tag().to_string().into()));
        }
        let local_contact = Some(local.uri.clone());

        let remote_value = request
            .from_header()
            .map_err(|_| DumError::bad_header("From"))?
            .value()
            .to_string();

        let remote_target =
            rsip_ext::contact_uri(request).unwrap_or_else(|| request.uri.clone());

        // Route set in Record-Route order for a UAS (RFC 3261 12.1.1).
        let route_set = request
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(rsip::headers::Route::from(rr.value())),
                _ => None,
            })
            .collect::<Vec<_>>();

        let remote_cseq = rsip_ext::cseq_of(request)
            .map(|(seq, _)| seq)
            .ok_or_else(|| DumError::bad_header("CSeq"))?;

        debug!("created UAS dialog {} ({} routes)", id, route_set.len());
        Ok(Dialog {
            id,
            state: DialogState::Early,
            local_cseq: 1,
            remote_cseq,
            local_value: local.to_string(),
            remote_value,
            remote_target,
            route_set,
            local_contact,
            invite_session: None,
            client_subscriptions: Vec::new(),
            server_subscriptions: Vec::new(),
        })
    }

    /// Materialise a UAC dialog from the first establishing response to
    /// our request.
    pub fn new_uac(
        id: DialogId,
        original_request: &rsip::Request,
        response: &rsip::Response,
    ) -> DumResult<Dialog> {
        let local_value = original_request
            .from_header()
            .map_err(|_| DumError::bad_header("From"))?
            .value()
            .to_string();
        let remote_value = response
            .to_header()
            .map_err(|_| DumError::bad_header("To"))?
            .value()
            .to_string();

        let remote_target =
            rsip_ext::contact_uri(response).unwrap_or_else(|| original_request.uri.clone());

        // Reversed Record-Route order for a UAC (RFC 3261 12.1.2).
        let mut route_set = response
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(rsip::headers::Route::from(rr.value())),
                _ => None,
            })
            .collect::<Vec<_>>();
        route_set.reverse();

        let local_cseq = rsip_ext::cseq_of(original_request)
            .map(|(seq, _)| seq)
            .ok_or_else(|| DumError::bad_header("CSeq"))?;

        let local_contact = rsip_ext::contact_uri(original_request);

        let state = if util::status_u16(&response.status_code) < 200 {
            DialogState::Early
        } else {
            DialogState::Confirmed
        };

        debug!("created UAC dialog {} in state {}", id, state);
        Ok(Dialog {
            id,
            state,
            local_cseq,
            remote_cseq: 0,
            local_value,
            remote_value,
            remote_target,
            route_set,
            local_contact,
            invite_session: None,
            client_subscriptions: Vec::new(),
            server_subscriptions: Vec::new(),
        })
    }

    pub fn local_tag(&self) -> &str {
        self.id.local_tag()
    }

    /// Sequence number of the last request we originated here.
    pub fn local_cseq(&self) -> u32 {
        self.local_cseq
    }

    /// Sequence number of the last request the peer sent us.
    pub fn remote_cseq(&self) -> u32 {
        self.remote_cseq
    }

    /// Where in-dialog requests are currently addressed.
    pub fn remote_target(&self) -> &rsip::Uri {
        &self.remote_target
    }

    /// Single chokepoint for dialog state changes. An out-of-order
    /// transition (a Confirmed dialog dragged back to Early by a late
    /// provisional retransmission, say) is dropped, not applied. Returns
    /// true when the state actually moved.
    fn transition(&mut self, next: DialogState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                "dropping invalid dialog state transition {} -> {} on {}",
                self.state, next, self.id
            );
            return false;
        }
        debug!("dialog {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        true
    }

    /// Build an in-dialog request addressed at the remote target with the
    /// dialog's route set and the next local sequence number.
    pub fn make_request(
        &mut self,
        method: rsip::Method,
        extra_headers: Vec<Header>,
        body: Option<(String, Vec<u8>)>,
    ) -> rsip::Request {
        self.local_cseq += 1;
        self.build_request(method, self.local_cseq, extra_headers, body)
    }

    /// ACK reuses the INVITE's sequence number (RFC 3261 13.2.2.4).
    pub fn make_ack(&mut self, invite_cseq: u32) -> rsip::Request {
        self.build_request(rsip::Method::Ack, invite_cseq, Vec::new(), None)
    }

    fn build_request(
        &self,
        method: rsip::Method,
        cseq: u32,
        extra_headers: Vec<Header>,
        body: Option<(String, Vec<u8>)>,
    ) -> rsip::Request {
        let mut headers: Vec<Header> = Vec::new();
        headers.push(util::make_via(&rsip_ext::make_branch()));
        headers.push(Header::CallId(self.id.call_id().to_string().into()));
        headers.push(Header::From(self.local_value.clone().into()));
        headers.push(Header::To(self.remote_value.clone().into()));
        headers.push(Header::CSeq(format!("{} {}", cseq, method).into()));
        headers.push(Header::MaxForwards(70.into()));
        if let Some(contact) = &self.local_contact {
            headers.push(Header::Contact(format!("<{}>", contact).into()));
        }
        for route in &self.route_set {
            headers.push(Header::Route(route.clone()));
        }
        headers.extend(extra_headers);

        let (content_type, body) = match body {
            Some((content_type, body)) => (Some(content_type), body),
            None => (None, Vec::new()),
        };
        if let Some(content_type) = content_type {
            headers.push(Header::ContentType(content_type.into()));
        }
        headers.push(Header::ContentLength((body.len() as u32).into()));

        rsip::Request {
            method,
            uri: self.remote_target.clone(),
            version: rsip::Version::V2,
            headers: headers.into(),
            body,
        }
    }

    /// In-dialog NOTIFY for one of our server subscriptions.
    pub fn make_notify(
        &mut self,
        event: &str,
        subscription_state: &str,
        body: Option<(String, Vec<u8>)>,
    ) -> rsip::Request {
        let extra = vec![
            Header::Other("Event".into(), event.into()),
            Header::Other("Subscription-State".into(), subscription_state.into()),
        ];
        self.make_request(rsip::Method::Notify, extra, body)
    }

    fn usage_handle(&self, kind: UsageKind, key: Option<String>, serial: u64) -> UsageHandle {
        UsageHandle::new(
            UsageId {
                dialog_set: Some(self.id.set_id().clone()),
                dialog: Some(self.id.clone()),
                kind,
                key,
            },
            serial,
        )
    }

    pub fn invite_session_handle(&self) -> Option<UsageHandle> {
        self.invite_session.as_ref().map(|session| {
            let kind = match session.role {
                crate::usage::invite_session::InviteRole::Uac => UsageKind::ClientInviteSession,
                crate::usage::invite_session::InviteRole::Uas => UsageKind::ServerInviteSession,
            };
            self.usage_handle(kind, None, session.serial)
        })
    }

    pub fn server_subscription_handle(&self, event: &str) -> Option<UsageHandle> {
        self.server_subscriptions
            .iter()
            .find(|sub| sub.event == event)
            .map(|sub| {
                self.usage_handle(
                    UsageKind::ServerSubscription,
                    Some(sub.event.clone()),
                    sub.serial,
                )
            })
    }

    pub fn has_live_usages(&self) -> bool {
        let invite_alive = self
            .invite_session
            .as_ref()
            .map(|s| !s.is_terminated())
            .unwrap_or(false);
        let subs_alive = self
            .client_subscriptions
            .iter()
            .any(|s| s.state != SubscriptionState::Terminated)
            || self
                .server_subscriptions
                .iter()
                .any(|s| s.state != SubscriptionState::Terminated);
        invite_alive || subs_alive
    }

    /// Route an in-dialog request to the owning usage.
    pub fn dispatch_request(
        &mut self,
        request: &rsip::Request,
        master: &MasterProfile,
        handlers: &Handlers,
        serials: &mut SerialCounter,
    ) -> Vec<DumAction> {
        use rsip::Method;

        if let Some((seq, method)) = rsip_ext::cseq_of(request) {
            if method != Method::Ack {
                self.remote_cseq = seq;
            }
        }

        let local_tag = self.id.local_tag().to_string();
        let mut actions = Vec::new();

        match request.method {
            Method::Ack => {
                if let Some(session) = &mut self.invite_session {
                    session.confirm();
                }
                if self.transition(DialogState::Confirmed) && self.invite_session.is_some() {
                    handlers.notify_dialog_confirmed(&self.id);
                }
            }
            Method::Bye => {
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::OK,
                    Some(&local_tag),
                )));
                if let Some(session) = &mut self.invite_session {
                    session.end(crate::usage::EndReason::ApplicationRequested);
                }
                if let Some(handle) = self.invite_session_handle() {
                    handlers.notify_invite_terminated(&handle);
                }
                self.transition(DialogState::Terminated);
                actions.push(DumAction::Destroy(DestroyTarget::Dialog(self.id.clone())));
            }
            Method::Invite | Method::Update | Method::Info | Method::PRack => {
                if let Some(handle) = self.invite_session_handle() {
                    handlers.notify_invite_in_dialog_request(&handle, request);
                }
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::OK,
                    Some(&local_tag),
                )));
            }
            Method::Notify => {
                actions.extend(self.dispatch_notify(request, handlers, &local_tag));
            }
            Method::Subscribe => {
                actions.extend(self.dispatch_subscribe_refresh(request, handlers, &local_tag));
            }
            Method::Refer => {
                // In-dialog REFER opens an implicit "refer" subscription.
                let serial = serials.next();
                let expires = master.user_profile().default_subscription_time();
                let mut sub = ServerSubscription::new(serial, "refer", expires);
                sub.set_subscription_state(SubscriptionState::Pending);
                self.server_subscriptions.push(sub);
                if let Some(handle) = self.server_subscription_handle("refer") {
                    handlers.notify_server_subscription_new(&handle, "refer", request);
                }
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::Accepted,
                    Some(&local_tag),
                )));
            }
            Method::Message => {
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::OK,
                    Some(&local_tag),
                )));
            }
            Method::Options => {
                let mut response =
                    util::make_response(request, rsip::StatusCode::OK, Some(&local_tag));
                util::add_capabilities(&mut response.headers, master, master.user_profile());
                actions.push(DumAction::SendResponse(response));
            }
            _ => {
                debug!(
                    "in-dialog {} not understood, answering 501: {}",
                    request.method, self.id
                );
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::NotImplemented,
                    Some(&local_tag),
                )));
            }
        }

        actions
    }

    fn dispatch_notify(
        &mut self,
        request: &rsip::Request,
        handlers: &Handlers,
        local_tag: &str,
    ) -> Vec<DumAction> {
        let mut actions = Vec::new();
        let event = rsip_ext::event_package(&request.headers).unwrap_or_else(|| "refer".into());
        let state_value = rsip_ext::header_value(&request.headers, "Subscription-State");

        let position = self
            .client_subscriptions
            .iter()
            .position(|sub| sub.event == event);
        match position {
            Some(index) => {
                let terminated = {
                    let sub = &mut self.client_subscriptions[index];
                    sub.on_notify(state_value.as_deref())
                };
                let handle = {
                    let sub = &self.client_subscriptions[index];
                    self.usage_handle(
                        UsageKind::ClientSubscription,
                        Some(sub.event.clone()),
                        sub.serial,
                    )
                };
                handlers.notify_client_subscription_update(&handle, request);
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::OK,
                    Some(local_tag),
                )));
                if terminated {
                    handlers.notify_client_subscription_terminated(&handle);
                    self.client_subscriptions.remove(index);
                    if !self.has_live_usages() {
                        actions
                            .push(DumAction::Destroy(DestroyTarget::Dialog(self.id.clone())));
                    }
                }
            }
            None => {
                info!("NOTIFY for unknown subscription '{}' on {}", event, self.id);
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::CallTransactionDoesNotExist,
                    Some(local_tag),
                )));
            }
        }
        actions
    }

    fn dispatch_subscribe_refresh(
        &mut self,
        request: &rsip::Request,
        handlers: &Handlers,
        local_tag: &str,
    ) -> Vec<DumAction> {
        let mut actions = Vec::new();
        let event = match rsip_ext::event_package(&request.headers) {
            Some(event) => event,
            None => {
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::BadRequest,
                    Some(local_tag),
                )));
                return actions;
            }
        };

        let expires = rsip_ext::header_value(&request.headers, "Expires")
            .and_then(|v| v.parse::<u32>().ok());

        let position = self
            .server_subscriptions
            .iter()
            .position(|sub| sub.event == event);
        match position {
            Some(index) => {
                let (handle, terminated) = {
                    let sub = &mut self.server_subscriptions[index];
                    if expires == Some(0) {
                        sub.end(crate::usage::EndReason::Deactivated);
                    } else if let Some(expires) = expires {
                        sub.expires = expires;
                    }
                    let terminated = sub.state == SubscriptionState::Terminated;
                    let handle = (sub.serial, sub.event.clone());
                    (handle, terminated)
                };
                let handle = self.usage_handle(
                    UsageKind::ServerSubscription,
                    Some(handle.1),
                    handle.0,
                );
                let mut response =
                    util::make_response(request, rsip::StatusCode::OK, Some(local_tag));
                if let Some(expires) = expires {
                    response
                        .headers
                        .push(Header::Expires(expires.to_string().into()));
                }
                actions.push(DumAction::SendResponse(response));
                if terminated {
                    handlers.notify_server_subscription_terminated(&handle);
                    self.server_subscriptions.remove(index);
                    if !self.has_live_usages() {
                        actions
                            .push(DumAction::Destroy(DestroyTarget::Dialog(self.id.clone())));
                    }
                } else {
                    handlers.notify_server_subscription_refresh(&handle, request);
                }
            }
            None => {
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::CallTransactionDoesNotExist,
                    Some(local_tag),
                )));
            }
        }
        actions
    }

    /// Fold a response for this dialog into its usages.
    pub fn dispatch_response(
        &mut self,
        response: &rsip::Response,
        handlers: &Handlers,
    ) -> Vec<DumAction> {
        use rsip::Method;

        let mut actions = Vec::new();
        let status = util::status_u16(&response.status_code);
        let Some((seq, method)) = rsip_ext::cseq_of(response) else {
            return actions;
        };

        match method {
            Method::Invite => {
                if let Some(session) = &mut self.invite_session {
                    session.on_status(status);
                }
                let handle = self.invite_session_handle();
                match status {
                    101..=199 => {
                        if self.transition(DialogState::Early) {
                            handlers.notify_dialog_early(&self.id);
                        }
                        if let Some(handle) = &handle {
                            handlers.notify_invite_provisional(handle, response);
                        }
                    }
                    200..=299 => {
                        if self.transition(DialogState::Confirmed) {
                            handlers.notify_dialog_confirmed(&self.id);
                        }
                        // Update the remote target from the 2xx Contact.
                        if let Some(contact) = rsip_ext::contact_uri(response) {
                            self.remote_target = contact;
                        }
                        let ack = self.make_ack(seq);
                        actions.push(DumAction::SendRequest {
                            dialog_set: self.id.set_id().clone(),
                            request: ack,
                        });
                        if let Some(handle) = &handle {
                            handlers.notify_invite_connected(handle, response);
                        }
                    }
                    300..=699 => {
                        self.transition(DialogState::Terminated);
                        if let Some(handle) = &handle {
                            handlers.notify_invite_terminated(handle);
                        }
                        actions
                            .push(DumAction::Destroy(DestroyTarget::Dialog(self.id.clone())));
                    }
                    _ => {}
                }
            }
            Method::Subscribe | Method::Refer => {
                if status >= 300 {
                    let index = self
                        .client_subscriptions
                        .iter()
                        .position(|sub| sub.state != SubscriptionState::Terminated);
                    if let Some(index) = index {
                        let handle = {
                            let sub = &self.client_subscriptions[index];
                            self.usage_handle(
                                UsageKind::ClientSubscription,
                                Some(sub.event.clone()),
                                sub.serial,
                            )
                        };
                        handlers.notify_client_subscription_terminated(&handle);
                        self.client_subscriptions.remove(index);
                        if !self.has_live_usages() {
                            actions.push(DumAction::Destroy(DestroyTarget::Dialog(
                                self.id.clone(),
                            )));
                        }
                    }
                }
            }
            Method::Bye => {
                // Nothing left to do; the dialog died when BYE went out.
            }
            _ => {
                debug!("response for {} in {} ignored", method, self.id);
            }
        }

        actions
    }

    /// Orderly teardown of everything inside the dialog.
    pub fn end(&mut self) -> Vec<DumAction> {
        let mut actions = Vec::new();
        let connected = self
            .invite_session
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false);
        if connected {
            let bye = self.make_request(rsip::Method::Bye, Vec::new(), None);
            actions.push(DumAction::SendRequest {
                dialog_set: self.id.set_id().clone(),
                request: bye,
            });
        }
        if let Some(session) = &mut self.invite_session {
            session.end(crate::usage::EndReason::ApplicationRequested);
        }
        for sub in &mut self.client_subscriptions {
            sub.end(crate::usage::EndReason::ApplicationRequested);
        }
        for sub in &mut self.server_subscriptions {
            sub.end(crate::usage::EndReason::ApplicationRequested);
        }
        self.transition(DialogState::Terminated);
        actions.push(DumAction::Destroy(DestroyTarget::Dialog(self.id.clone())));
        actions
    }
}
