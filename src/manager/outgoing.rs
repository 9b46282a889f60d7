//! The outbound send path.
//!
//! `send()` stamps profile-driven decorations onto the shared request,
//! clones it, and pushes the clone through the outgoing feature chain
//! before it reaches the stack. Outbound routing prefers, in order: the
//! profile's outbound proxy (as Route set or direct target), the RFC 5626
//! client-outbound flow, and finally the stack's own resolution.

use tracing::{debug, warn};

use rsip::Header;

use crate::creator::SharedRequest;
use crate::dialog::{DialogId, DialogSetId};
use crate::errors::{DumError, DumResult};
use crate::events::TransactionId;
use crate::feature::{FeatureChain, FeatureDirection, FeatureEvent};
use crate::manager::DialogUsageManager;
use crate::profile::UserProfile;
use crate::rsip_ext::{self, HeadersPushFront};
use crate::stack::SendTarget;
use std::sync::Arc;

/// Identity-revealing headers stripped from anonymous traffic.
const ANONYMOUS_STRIPPED: &[&str] = &[
    "Reply-To",
    "User-Agent",
    "Organization",
    "Server",
    "Subject",
    "In-Reply-To",
    "Call-Info",
    "Warning",
];

impl DialogUsageManager {
    /// Send a request handed out earlier by a `make_*` factory. The
    /// shared message keeps the decorations; the wire sees a clone, so
    /// the caller's copy stays usable for authentication retries.
    pub fn send(&mut self, msg: &SharedRequest) -> DumResult<()> {
        let profile = self.profile_for_outgoing(msg)?;
        let cloned = {
            let mut request = msg
                .lock()
                .map_err(|_| DumError::protocol("shared request poisoned"))?;
            self.apply_send_decorations(&mut request, &profile);
            request.clone()
        };
        self.dispatch_outgoing(cloned);
        Ok(())
    }

    /// Send a request the manager built itself (ACK, BYE, NOTIFY, pages).
    pub(crate) fn send_request_now(&mut self, mut request: rsip::Request) -> DumResult<()> {
        let profile = self.profile_for_request(&request)?;
        self.apply_send_decorations(&mut request, &profile);
        self.dispatch_outgoing(request);
        Ok(())
    }

    fn dispatch_outgoing(&mut self, request: rsip::Request) {
        debug!("SEND {} {}", request.method, request.uri);
        let message = rsip::SipMessage::Request(request);
        let tid = TransactionId::of_message(&message);
        self.outgoing_process(message, tid);
    }

    /// Responses skip decoration and routing policy; the stack answers on
    /// the transaction that carried the request.
    pub fn send_response(&mut self, response: rsip::Response) {
        debug!("SEND response {}", response.status_code);
        self.stack().send(rsip::SipMessage::Response(response));
    }

    fn profile_for_outgoing(&self, msg: &SharedRequest) -> DumResult<Arc<UserProfile>> {
        let request = msg
            .lock()
            .map_err(|_| DumError::protocol("shared request poisoned"))?;
        self.profile_for_request(&request)
    }

    pub(crate) fn profile_for_request(
        &self,
        request: &rsip::Request,
    ) -> DumResult<Arc<UserProfile>> {
        let from_set = DialogSetId::of_outgoing_request(request)
            .and_then(|id| self.find_dialog_set(&id))
            .map(|ds| Arc::clone(ds.user_profile()));
        match from_set {
            Some(profile) => Ok(profile),
            None => self.master_user_profile(),
        }
    }

    /// The profile-driven decorations every outgoing request receives.
    fn apply_send_decorations(&self, request: &mut rsip::Request, profile: &UserProfile) {
        use rsip::Method;

        if !profile.is_anonymous() {
            if let Some(user_agent) = profile.user_agent() {
                rsip_ext::remove_header(&mut request.headers, "User-Agent");
                request
                    .headers
                    .push(Header::UserAgent(user_agent.to_string().into()));
            }
        } else {
            for name in ANONYMOUS_STRIPPED {
                rsip_ext::remove_header(&mut request.headers, name);
            }
        }

        let method = request.method.clone();
        let fresh_transaction = method != Method::Ack && method != Method::Cancel;

        if fresh_transaction && !profile.proxy_requires().is_empty() {
            rsip_ext::remove_header(&mut request.headers, "Proxy-Require");
            request
                .headers
                .push(Header::ProxyRequire(profile.proxy_requires().join(", ").into()));
        }

        if fresh_transaction {
            // A fresh transaction for everything except ACK and CANCEL,
            // which must reuse the branch of the request they refer to.
            let branch = rsip_ext::make_branch();
            rsip_ext::rewrite_top_via(request, |via| {
                rsip_ext::via_with_param(via, "branch", Some(&branch))
            });
        }

        if profile.rport_enabled() {
            rsip_ext::rewrite_top_via(request, |via| {
                rsip_ext::via_with_param(via, "rport", Some(""))
            });
        } else {
            rsip_ext::rewrite_top_via(request, |via| {
                rsip_ext::via_with_param(via, "rport", None)
            });
        }
        if profile.fixed_transport_port().is_some() || profile.fixed_transport_interface().is_some()
        {
            rsip_ext::rewrite_top_via(request, |via| {
                rsip_ext::via_with_sent_by(
                    via,
                    profile.fixed_transport_interface(),
                    profile.fixed_transport_port(),
                )
            });
        }

        // The profile's outbound decorator runs on every send, and must
        // run before credential injection: a decorator that rewrites the
        // body has to do so before the digest is computed over it.
        if let Some(decorator) = profile.outbound_decorator() {
            decorator.decorate(request);
        }

        if method != Method::Ack {
            if let Some(auth) = &self.client_auth {
                auth.add_authentication(request);
            }
        }

        if method == Method::Invite && rsip_ext::to_tag(request).is_none() {
            // A tagless INVITE leaving through here opens a new UAC
            // dialog; tell the dialog event observer.
            if let Some(events) = &self.handlers.dialog_event_state {
                if let Some(set_id) = DialogSetId::of_outgoing_request(request) {
                    if self.find_dialog_set(&set_id).is_some() {
                        events.on_trying_uac(&set_id);
                    }
                }
            }
        }
    }

    /// Outbound leg of the feature pipeline, then the wire.
    pub(crate) fn outgoing_process(
        &mut self,
        message: rsip::SipMessage,
        tid: Option<TransactionId>,
    ) {
        let mut message = message;

        match &tid {
            None => {
                if let Some(interceptor) = &self.outgoing_interceptor {
                    let mut event = FeatureEvent {
                        transaction_id: TransactionId::new(""),
                        direction: FeatureDirection::Outgoing,
                        message,
                    };
                    interceptor.process(&mut event);
                    return;
                }
            }
            Some(tid) => {
                if !self.outgoing_features.is_empty() {
                    let chain = self
                        .outgoing_chains
                        .entry(tid.clone())
                        .or_insert_with(|| FeatureChain::new(self.outgoing_features.clone()));
                    let mut event = FeatureEvent {
                        transaction_id: tid.clone(),
                        direction: FeatureDirection::Outgoing,
                        message,
                    };
                    let outcome = chain.process(&mut event);
                    if outcome.chain_done {
                        self.outgoing_chains.remove(tid);
                    }
                    if outcome.event_taken {
                        return;
                    }
                    message = event.message;
                }
            }
        }

        match message {
            rsip::SipMessage::Request(request) => {
                let profile = match self.profile_for_request(&request) {
                    Ok(profile) => profile,
                    Err(err) => {
                        warn!("no profile for outgoing request: {}", err);
                        return;
                    }
                };
                self.send_using_outbound_if_appropriate(&profile, request);
            }
            response @ rsip::SipMessage::Response(_) => {
                self.stack().send(response);
            }
        }
    }

    /// Outbound routing policy: outbound proxy when configured (and the
    /// request is not in-dialog, unless forced), preferring the
    /// client-outbound flow whenever one is established.
    pub(crate) fn send_using_outbound_if_appropriate(
        &mut self,
        profile: &UserProfile,
        mut request: rsip::Request,
    ) {
        let in_dialog = DialogSetId::of_outgoing_request(&request)
            .map(|set_id| {
                let remote = rsip_ext::to_tag(&request).unwrap_or_default();
                self.find_dialog(&DialogId::new(set_id, remote)).is_some()
            })
            .unwrap_or(false);

        let flow = profile
            .client_outbound_enabled()
            .then(|| profile.client_outbound_flow_tuple().cloned())
            .flatten()
            .filter(|flow| flow.flow_key != 0);

        if let Some(proxy) = profile.outbound_proxy() {
            if !in_dialog || profile.force_outbound_proxy_on_all_requests() {
                if profile.express_outbound_as_route_set() {
                    request
                        .headers
                        .push_front(Header::Route(format!("<{};lr>", proxy).into()));
                    let message = rsip::SipMessage::Request(request);
                    match flow {
                        Some(flow) => {
                            debug!("sending via outbound proxy route set to flow {}", flow);
                            self.stack().send_to(message, SendTarget::Flow(flow));
                        }
                        None => {
                            debug!("sending with outbound proxy {} in route set", proxy);
                            self.stack().send(message);
                        }
                    }
                } else {
                    let message = rsip::SipMessage::Request(request);
                    match flow {
                        Some(flow) => {
                            debug!("sending to flow {}", flow);
                            self.stack().send_to(message, SendTarget::Flow(flow));
                        }
                        None => {
                            debug!("sending to outbound proxy {}", proxy);
                            self.stack()
                                .send_to(message, SendTarget::Uri(proxy.clone()));
                        }
                    }
                }
                return;
            }
        }

        let message = rsip::SipMessage::Request(request);
        match flow {
            Some(flow) => {
                debug!("sending to flow {}", flow);
                self.stack().send_to(message, SendTarget::Flow(flow));
            }
            None => self.stack().send(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::rsip_ext::{via_with_param, via_with_sent_by};

    #[test]
    fn branch_replacement_keeps_other_params() {
        let via = "SIP/2.0/UDP host.example.com;rport;branch=z9hG4bKold";
        let rewritten = via_with_param(via, "branch", Some("z9hG4bKnew"));
        assert!(rewritten.contains("rport"));
        assert!(rewritten.contains("branch=z9hG4bKnew"));
        assert!(!rewritten.contains("z9hG4bKold"));
    }

    #[test]
    fn rport_can_be_added_and_removed() {
        let via = "SIP/2.0/UDP host.example.com;branch=z9hG4bKabc";
        let with = via_with_param(via, "rport", Some(""));
        assert!(with.ends_with(";rport"));
        let without = via_with_param(&with, "rport", None);
        assert!(!without.contains("rport"));
    }

    #[test]
    fn sent_by_rewrite_respects_existing_port() {
        let via = "SIP/2.0/UDP host.example.com:5080;branch=z9hG4bKabc";
        let rewritten = via_with_sent_by(via, Some("10.0.0.1"), None);
        assert!(rewritten.starts_with("SIP/2.0/UDP 10.0.0.1:5080"));
        let reported = via_with_sent_by(via, None, Some(5090));
        assert!(reported.starts_with("SIP/2.0/UDP host.example.com:5090"));
    }
}
