//! Inbound message processing: feature chain, validation, merge
//! detection, and routing to dialog sets or the publish path.

use std::sync::Arc;

use tracing::{debug, info, warn};

use rsip::Header;

use crate::dialog::{DialogId, DialogSet, DialogSetId, MergedRequestKey};
use crate::events::{DestroyTarget, DumAction, DumCommand, DumEvent, TransactionId};
use crate::feature::{FeatureChain, FeatureDirection, FeatureEvent};
use crate::manager::shutdown::ShutdownState;
use crate::manager::DialogUsageManager;
use crate::rsip_ext;
use crate::usage::{EndReason, ServerPublication, UsageHandle, UsageId, UsageKind};
use crate::util;

impl DialogUsageManager {
    /// Entry point for SIP traffic off the FIFO.
    pub(crate) fn incoming_process(&mut self, message: rsip::SipMessage) {
        let tid = TransactionId::of_message(&message);
        let mut message = message;

        // Transaction-bound traffic flows through the feature chain
        // before core dispatch sees it.
        if let Some(tid) = &tid {
            if !self.incoming_features.is_empty() {
                let chain = self
                    .incoming_chains
                    .entry(tid.clone())
                    .or_insert_with(|| FeatureChain::new(self.incoming_features.clone()));
                let mut event = FeatureEvent {
                    transaction_id: tid.clone(),
                    direction: FeatureDirection::Incoming,
                    message,
                };
                let outcome = chain.process(&mut event);
                if outcome.chain_done {
                    self.incoming_chains.remove(tid);
                }
                if outcome.event_taken {
                    return;
                }
                message = event.message;
            }
        }

        // RFC 3261 8.2: a request with garbage in its core headers is
        // answered 400 (never for ACK) and dropped either way.
        let malformed = match &message {
            rsip::SipMessage::Request(request) => rsip_ext::malformed_core_headers(request),
            rsip::SipMessage::Response(response) => rsip_ext::malformed_core_headers(response),
        };
        if !malformed.is_empty() {
            if let rsip::SipMessage::Request(request) = &message {
                if request.method != rsip::Method::Ack {
                    let mut response = util::make_response(
                        request,
                        rsip::StatusCode::BadRequest,
                        Some(&rsip_ext::make_tag()),
                    );
                    util::add_warning(
                        &mut response,
                        &format!("Malformed {}", malformed.join(", ")),
                    );
                    self.send_response(response);
                }
            }
            info!(
                "malformed header(s) {} in message, rejecting/discarding",
                malformed.join(", ")
            );
            return;
        }

        match message {
            rsip::SipMessage::Request(request) => {
                if !self.validate_request_uri(&request) {
                    debug!("failed Request-URI validation");
                    return;
                }
                if request.method != rsip::Method::Ack
                    && request.method != rsip::Method::Cancel
                {
                    if !self.validate_required_options(&request) {
                        return;
                    }
                    if !self.validate_100rel_support(&request) {
                        return;
                    }
                    let Ok(master) = self.master_profile().map(Arc::clone) else {
                        return;
                    };
                    if master.validate_content_enabled() && !self.validate_content(&request) {
                        return;
                    }
                    if master.validate_accept_enabled() && !self.validate_accept(&request) {
                        return;
                    }
                }
                if rsip_ext::from_tag(&request).is_some() && self.merge_request(&request) {
                    info!("merged request, already rejected");
                    return;
                }
                self.process_request(request, tid);
            }
            rsip::SipMessage::Response(response) => self.process_response(response),
        }
    }

    /// RFC 3261 8.2.2.2: an initial request matching an accepted one on
    /// `(Call-ID, From tag, CSeq)` within the merge window gets 482.
    pub(crate) fn merge_request(&mut self, request: &rsip::Request) -> bool {
        if rsip_ext::to_tag(request).is_some() {
            return false;
        }
        let check_uri = self
            .master_profile()
            .map(|m| m.check_req_uri_in_merge_detection())
            .unwrap_or(false);
        let Some(key) = MergedRequestKey::from_request(request, check_uri) else {
            return false;
        };
        if !self.merged_requests.contains(&key) {
            return false;
        }
        let mut response = util::make_response(
            request,
            rsip::StatusCode::LoopDetected,
            Some(&rsip_ext::make_tag()),
        );
        util::add_warning(&mut response, "Merged Request");
        self.send_response(response);
        true
    }

    /// An accepted initial request joins the merge set until the merge
    /// window closes.
    fn register_merged_request(&mut self, request: &rsip::Request) {
        if rsip_ext::to_tag(request).is_some() || rsip_ext::from_tag(request).is_none() {
            return;
        }
        let Ok(master) = self.master_profile().map(Arc::clone) else {
            return;
        };
        if let Some(key) =
            MergedRequestKey::from_request(request, master.check_req_uri_in_merge_detection())
        {
            self.merged_requests.insert(key.clone());
            if self.shutdown_state() == ShutdownState::Running {
                self.stack().post_to_tu(
                    DumEvent::Command(DumCommand::RemoveMergedRequest(key)),
                    master.merge_window(),
                );
            }
        }
    }

    pub(crate) fn remove_merged_request(&mut self, key: &MergedRequestKey) {
        debug!("merge window closed for {}", key);
        self.merged_requests.remove(key);
    }

    /// Method-specific routing of a validated request.
    pub(crate) fn process_request(&mut self, request: rsip::Request, tid: Option<TransactionId>) {
        use rsip::Method;

        debug!("processRequest {} {}", request.method, request.uri);

        if self.shutdown_state() != ShutdownState::Running
            && self.shutdown_state() != ShutdownState::ShutdownRequested
        {
            warn!("ignoring request, shutting down");
            let mut response = util::make_response(
                &request,
                rsip::StatusCode::TemporarilyUnavailable,
                Some(&rsip_ext::make_tag()),
            );
            util::add_warning(&mut response, "UAS is shutting down");
            self.send_response(response);
            return;
        }

        if request.method == Method::Publish {
            self.process_publish(&request);
            return;
        }

        let Ok(master) = self.master_profile().map(Arc::clone) else {
            return;
        };

        let mut has_to_tag = rsip_ext::to_tag(&request).is_some();
        if request.method == Method::Register && has_to_tag && master.allow_bad_registration() {
            has_to_tag = false;
        }

        let existing = if has_to_tag {
            DialogSetId::of_incoming_request(&request)
                .filter(|id| self.find_dialog_set(id).is_some())
        } else if request.method != Method::Cancel && request.method != Method::Ack {
            // Tagless requests can still collide with a set created from
            // the same origin; CANCEL and ACK are transaction-addressed
            // and must fall through to their own branches.
            self.uas_origin_live(&request)
        } else {
            None
        };

        if has_to_tag || existing.is_some() {
            if request.method == Method::Register {
                let mut response = util::make_response(
                    &request,
                    rsip::StatusCode::BadRequest,
                    Some(&rsip_ext::make_tag()),
                );
                util::add_warning(&mut response, "Registration requests can't have To: tags");
                self.send_response(response);
                return;
            }
            match existing {
                Some(id) => self.dispatch_to_dialog_set(&id, &request, tid.as_ref()),
                None => {
                    if request.method == Method::Ack {
                        info!("ACK matches no dialog, dropping");
                    } else {
                        info!("in-dialog {} matches nothing, answering 481", request.method);
                        self.send_response(util::make_response(
                            &request,
                            rsip::StatusCode::CallTransactionDoesNotExist,
                            Some(&rsip_ext::make_tag()),
                        ));
                    }
                }
            }
            return;
        }

        match request.method {
            Method::Ack => {
                debug!("discarding stray ACK");
            }
            Method::PRack | Method::Bye | Method::Update | Method::Info => {
                self.send_response(util::make_response(
                    &request,
                    rsip::StatusCode::CallTransactionDoesNotExist,
                    Some(&rsip_ext::make_tag()),
                ));
            }
            Method::Cancel => match tid.as_ref().and_then(|t| self.cancel_map.get(t).cloned()) {
                Some(dialog_id) => self.handle_cancel(&dialog_id, &request),
                None => {
                    info!("CANCEL on a non-existent transaction");
                    self.send_response(util::make_response(
                        &request,
                        rsip::StatusCode::CallTransactionDoesNotExist,
                        Some(&rsip_ext::make_tag()),
                    ));
                }
            },
            Method::Subscribe
            | Method::Notify
            | Method::Invite
            | Method::Refer
            | Method::Options
            | Method::Message
            | Method::Register => {
                if request.method == Method::Subscribe && !self.check_event_package(&request) {
                    info!("rejecting SUBSCRIBE with unsupported event package");
                    return;
                }

                // A tagless duplicate of a set that is still tearing down
                // is bad peer behaviour; reject it outright.
                if self.uas_origin_any(&request) {
                    let mut response = util::make_response(
                        &request,
                        rsip::StatusCode::BadRequest,
                        Some(&rsip_ext::make_tag()),
                    );
                    util::add_warning(&mut response, "Duplicate of a dialog set being destroyed");
                    self.send_response(response);
                    return;
                }

                if self.shutdown_handler.is_some() {
                    let mut response = util::make_response(
                        &request,
                        rsip::StatusCode::TemporarilyUnavailable,
                        Some(&rsip_ext::make_tag()),
                    );
                    util::add_warning(&mut response, "UAS is shutting down");
                    self.send_response(response);
                    return;
                }

                let profile = self
                    .app_dialog_set_factory()
                    .select_uas_user_profile(&request, &master);
                match DialogSet::new_uas(&request, profile) {
                    Ok(set) => {
                        let id = set.id().clone();
                        debug!("adding dialog set {}", id);
                        if let Some(from_tag) = set.origin_from_tag() {
                            self.uas_origins.insert(
                                (id.call_id().to_string(), from_tag.to_string()),
                                id.clone(),
                            );
                        }
                        self.dialog_sets.insert(id.clone(), set);
                        self.register_merged_request(&request);
                        self.dispatch_to_dialog_set(&id, &request, tid.as_ref());
                    }
                    Err(err) => {
                        let mut response = util::make_response(
                            &request,
                            rsip::StatusCode::BadRequest,
                            Some(&rsip_ext::make_tag()),
                        );
                        util::add_warning(&mut response, &err.to_string());
                        self.send_response(response);
                    }
                }
            }
            _ => {
                debug!("method {} has no initial-request handling", request.method);
            }
        }
    }

    fn dispatch_to_dialog_set(
        &mut self,
        id: &DialogSetId,
        request: &rsip::Request,
        tid: Option<&TransactionId>,
    ) {
        let Ok(master) = self.master_profile().map(Arc::clone) else {
            return;
        };
        let actions = {
            let handlers = &self.handlers;
            let serials = &mut self.serials;
            match self.dialog_sets.get_mut(id) {
                Some(ds) if !ds.is_destroying() => {
                    ds.dispatch_request(request, tid, &master, handlers, serials)
                }
                _ => Vec::new(),
            }
        };
        self.apply_actions(actions);
    }

    /// Non-CANCEL responses route to their dialog set; strays are logged
    /// and discarded.
    pub(crate) fn process_response(&mut self, response: rsip::Response) {
        if util::response_method(&response) == Some(rsip::Method::Cancel) {
            return;
        }
        let Some(set_id) = DialogSetId::of_incoming_response(&response) else {
            return;
        };
        if self.find_dialog_set(&set_id).is_none() {
            info!("throwing away stray response for {}", set_id);
            return;
        }
        let actions = {
            let handlers = &self.handlers;
            let serials = &mut self.serials;
            match self.dialog_sets.get_mut(&set_id) {
                Some(ds) => ds.dispatch_response(&response, handlers, serials),
                None => Vec::new(),
            }
        };
        self.apply_actions(actions);
    }

    /// CANCEL an unanswered server INVITE: 200 the CANCEL, 487 the
    /// INVITE, end the session.
    fn handle_cancel(&mut self, dialog_id: &DialogId, request: &rsip::Request) {
        let local_tag = dialog_id.local_tag().to_string();
        let mut actions = Vec::new();
        let mut terminated_handle = None;

        if let Some(ds) = self.dialog_sets.get_mut(dialog_id.set_id()) {
            if let Some(dialog) = ds.find_dialog_mut(dialog_id) {
                actions.push(DumAction::SendResponse(util::make_response(
                    request,
                    rsip::StatusCode::OK,
                    Some(&local_tag),
                )));
                if let Some(session) = &mut dialog.invite_session {
                    if !session.is_connected() && !session.is_terminated() {
                        let invite = session.invite_request.clone();
                        session.end(EndReason::ApplicationRequested);
                        actions.push(DumAction::SendResponse(util::make_response(
                            &invite,
                            rsip::StatusCode::RequestTerminated,
                            Some(&local_tag),
                        )));
                        terminated_handle = dialog.invite_session_handle();
                        actions.push(DumAction::Destroy(DestroyTarget::Dialog(
                            dialog_id.clone(),
                        )));
                    }
                }
            }
        }

        if let Some(handle) = terminated_handle {
            self.handlers.notify_invite_terminated(&handle);
        }
        self.apply_actions(actions);
    }

    // ===== PUBLISH path (RFC 3903) =====

    pub(crate) fn process_publish(&mut self, request: &rsip::Request) {
        if !self.check_event_package(request) {
            info!("rejecting PUBLISH with unsupported event package");
            return;
        }

        let aor = util::request_aor(request);
        let event = rsip_ext::event_package(&request.headers).unwrap_or_default();

        match rsip_ext::sip_if_match(&request.headers) {
            Some(etag) => {
                let known = self.server_publications.contains_key(&etag);
                let in_store = !known
                    && self
                        .publication_persistence
                        .as_ref()
                        .map(|store| store.document_exists(&event, &aor, &etag))
                        .unwrap_or(false);
                if known || in_store {
                    if in_store {
                        // Synced over or survived a restart; rebuild the
                        // in-memory publication around the stored state.
                        let serial = self.serials.next();
                        self.server_publications.insert(
                            etag.clone(),
                            ServerPublication::new(serial, etag.clone(), aor, event, 3600),
                        );
                    }
                    self.dispatch_publish(&etag, request);
                } else {
                    self.send_response(util::make_response(
                        request,
                        rsip::StatusCode::ConditionalRequestFailed,
                        Some(&rsip_ext::make_tag()),
                    ));
                }
            }
            None => {
                if request.body.is_empty() {
                    // RFC 3903 6.5: an initial PUBLISH must carry state.
                    self.send_response(util::make_response(
                        request,
                        rsip::StatusCode::BadRequest,
                        Some(&rsip_ext::make_tag()),
                    ));
                    return;
                }
                let mut etag = rsip_ext::random_hex(8);
                while self.server_publications.contains_key(&etag) {
                    etag = rsip_ext::random_hex(8);
                }
                let expires = rsip_ext::header_value(&request.headers, "Expires")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(3600);
                let serial = self.serials.next();
                let publication =
                    ServerPublication::new(serial, etag.clone(), aor, event.clone(), expires);
                let handle = publication_handle(&etag, serial);
                self.server_publications.insert(etag.clone(), publication);
                if let Some(handler) = self.handlers.server_publication.get(&event) {
                    handler.on_publish(&handle, request);
                }
                let mut response = util::make_response(
                    request,
                    rsip::StatusCode::OK,
                    Some(&rsip_ext::make_tag()),
                );
                response
                    .headers
                    .push(Header::Other("SIP-ETag".into(), etag));
                response
                    .headers
                    .push(Header::Expires(expires.to_string().into()));
                self.send_response(response);
            }
        }
    }

    fn dispatch_publish(&mut self, etag: &str, request: &rsip::Request) {
        use crate::usage::publication::PublishOutcome;

        let Some(mut publication) = self.server_publications.remove(etag) else {
            return;
        };
        let outcome = publication.on_publish(request);
        let event = publication.event.clone();
        let serial = publication.serial;

        match outcome {
            PublishOutcome::Updated { new_etag } => {
                let handle = publication_handle(&new_etag, serial);
                let expires = publication.expires;
                self.server_publications.insert(new_etag.clone(), publication);
                if let Some(handler) = self.handlers.server_publication.get(&event) {
                    handler.on_publish(&handle, request);
                }
                let mut response = util::make_response(
                    request,
                    rsip::StatusCode::OK,
                    Some(&rsip_ext::make_tag()),
                );
                response
                    .headers
                    .push(Header::Other("SIP-ETag".into(), new_etag));
                response
                    .headers
                    .push(Header::Expires(expires.to_string().into()));
                self.send_response(response);
            }
            PublishOutcome::Removed => {
                let handle = publication_handle(etag, serial);
                if let Some(handler) = self.handlers.server_publication.get(&event) {
                    handler.on_removed(&handle);
                }
                let mut response = util::make_response(
                    request,
                    rsip::StatusCode::OK,
                    Some(&rsip_ext::make_tag()),
                );
                response
                    .headers
                    .push(Header::Expires("0".to_string().into()));
                self.send_response(response);
                self.shutdown_when_empty();
            }
        }
    }

    /// Event-package gate for SUBSCRIBE, NOTIFY and PUBLISH: no Event
    /// header is a 400; an event nobody registered for is a 489 naming
    /// the packages we do accept.
    pub(crate) fn check_event_package(&mut self, request: &rsip::Request) -> bool {
        use rsip::Method;

        let Some(event) = rsip_ext::event_package(&request.headers) else {
            info!("no Event header in {}", request.method);
            self.send_response(util::make_response(
                request,
                rsip::StatusCode::BadRequest,
                Some(&rsip_ext::make_tag()),
            ));
            return false;
        };

        let known = match request.method {
            Method::Subscribe => self.handlers.server_subscription.contains_key(&event),
            Method::Notify => self.handlers.client_subscription.contains_key(&event),
            Method::Publish => self.handlers.server_publication.contains_key(&event),
            _ => true,
        };
        if known {
            return true;
        }

        info!("no handler for event package '{}'", event);
        let mut allowed: Vec<String> = match request.method {
            Method::Subscribe => self.handlers.server_subscription.keys().cloned().collect(),
            Method::Notify => self.handlers.client_subscription.keys().cloned().collect(),
            _ => self.handlers.server_publication.keys().cloned().collect(),
        };
        allowed.sort();
        let mut response = util::make_response(
            request,
            rsip::StatusCode::BadEvent,
            Some(&rsip_ext::make_tag()),
        );
        response
            .headers
            .push(Header::Other("Allow-Events".into(), allowed.join(", ")));
        self.send_response(response);
        false
    }

    // ===== origin-index helpers =====

    fn uas_origin_key(request: &rsip::Request) -> Option<(String, String)> {
        use rsip::prelude::{HeadersExt, UntypedHeader};
        Some((
            request.call_id_header().ok()?.value().to_string(),
            rsip_ext::from_tag(request)?,
        ))
    }

    /// Live (not destroying) UAS set created from the same origin.
    fn uas_origin_live(&self, request: &rsip::Request) -> Option<DialogSetId> {
        let key = Self::uas_origin_key(request)?;
        let id = self.uas_origins.get(&key)?;
        self.find_dialog_set(id).map(|ds| ds.id().clone())
    }

    /// Any UAS set from the same origin, including one being destroyed.
    fn uas_origin_any(&self, request: &rsip::Request) -> bool {
        Self::uas_origin_key(request)
            .map(|key| self.uas_origins.contains_key(&key))
            .unwrap_or(false)
    }
}

fn publication_handle(etag: &str, serial: u64) -> UsageHandle {
    UsageHandle::new(
        UsageId {
            dialog_set: None,
            dialog: None,
            kind: UsageKind::ServerPublication,
            key: Some(etag.to_string()),
        },
        serial,
    )
}
