//! Creators: one per usage kind, each producing the first outbound
//! request of a new usage.
//!
//! The built request is shared with the caller so it can be decorated or
//! inspected before `send()`; the owning dialog set keeps the same shared
//! message to recover dialog identity from it later.

use std::sync::{Arc, Mutex};

use rsip::Header;

use crate::profile::UserProfile;
use crate::rsip_ext::{self, Replaces};
use crate::util;

/// The first request of a usage, shared between the application (which may
/// decorate it) and the dialog set that owns the creator.
pub type SharedRequest = Arc<Mutex<rsip::Request>>;

/// Data common to every creator.
pub struct BaseCreator {
    request: SharedRequest,
    user_profile: Arc<UserProfile>,
    local_tag: String,
    call_id: String,
}

impl BaseCreator {
    fn new(request: rsip::Request, user_profile: Arc<UserProfile>, local_tag: String, call_id: String) -> Self {
        BaseCreator {
            request: Arc::new(Mutex::new(request)),
            user_profile,
            local_tag,
            call_id,
        }
    }

    pub fn last_request(&self) -> SharedRequest {
        Arc::clone(&self.request)
    }

    pub fn user_profile(&self) -> &Arc<UserProfile> {
        &self.user_profile
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}

/// The closed set of UAC origin request templates.
pub enum Creator {
    InviteSession(BaseCreator),
    Subscription { base: BaseCreator, event: String },
    Registration(BaseCreator),
    Publication { base: BaseCreator, event: String },
    OutOfDialog(BaseCreator),
    PagerMessage(BaseCreator),
}

impl Creator {
    pub fn base(&self) -> &BaseCreator {
        match self {
            Creator::InviteSession(base)
            | Creator::Registration(base)
            | Creator::OutOfDialog(base)
            | Creator::PagerMessage(base) => base,
            Creator::Subscription { base, .. } | Creator::Publication { base, .. } => base,
        }
    }

    pub fn last_request(&self) -> SharedRequest {
        self.base().last_request()
    }

    pub fn method(&self) -> rsip::Method {
        self.base()
            .request
            .lock()
            .map(|req| req.method.clone())
            .unwrap_or(rsip::Method::Options)
    }
}

/// Header skeleton every initial request shares: Request-URI, From with a
/// fresh local tag, fresh Call-ID, CSeq 1, Max-Forwards, Contact, plus the
/// profile's service route.
fn build_initial_request(
    method: rsip::Method,
    target: &str,
    profile: &UserProfile,
    extra_headers: Vec<Header>,
    body: Option<(String, Vec<u8>)>,
) -> (rsip::Request, String, String) {
    let local_tag = rsip_ext::make_tag();
    let call_id = rsip_ext::make_call_id();

    let from_value = profile
        .default_from()
        .unwrap_or("<sip:anonymous@anonymous.invalid>")
        .to_string();

    let mut headers: Vec<Header> = Vec::new();
    headers.push(util::make_via(&rsip_ext::make_branch()));
    headers.push(Header::MaxForwards(70.into()));
    headers.push(Header::From(
        format!("{};tag={}", from_value, local_tag).into(),
    ));
    headers.push(Header::To(format!("<{}>", target).into()));
    headers.push(Header::CallId(call_id.clone().into()));
    headers.push(Header::CSeq(format!("1 {}", method).into()));

    if let Some(contact_uri) = from_uri_of(&from_value) {
        headers.push(Header::Contact(format!("<{}>", contact_uri).into()));
    }

    for route in profile.service_route() {
        headers.push(Header::Route(format!("<{}>", route).into()));
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

    let uri = rsip::Uri::try_from(target)
        .unwrap_or_else(|_| rsip::Uri::try_from("sip:invalid.invalid").expect("literal uri"));

    (
        rsip::Request {
            method,
            uri,
            version: rsip::Version::V2,
            headers: headers.into(),
            body,
        },
        local_tag,
        call_id,
    )
}

fn from_uri_of(from_value: &str) -> Option<rsip::Uri> {
    rsip_ext::extract_uri_from_contact(from_value)
}

fn make_base(
    method: rsip::Method,
    target: &str,
    profile: Arc<UserProfile>,
    extra_headers: Vec<Header>,
    body: Option<(String, Vec<u8>)>,
) -> BaseCreator {
    let (request, local_tag, call_id) =
        build_initial_request(method, target, profile.as_ref(), extra_headers, body);
    BaseCreator::new(request, profile, local_tag, call_id)
}

impl Creator {
    /// INVITE with an optional session offer and RFC 3891 Replaces.
    pub fn invite_session(
        target: &str,
        profile: Arc<UserProfile>,
        offer: Option<(String, Vec<u8>)>,
        replaces: Option<Replaces>,
    ) -> Creator {
        let mut extra = Vec::new();
        if let Some(replaces) = replaces {
            extra.push(Header::Other("Replaces".into(), replaces.to_header_value()));
        }
        Creator::InviteSession(make_base(rsip::Method::Invite, target, profile, extra, offer))
    }

    /// SUBSCRIBE for `event` with an explicit expiry.
    pub fn subscription(
        target: &str,
        profile: Arc<UserProfile>,
        event: &str,
        expires: u32,
    ) -> Creator {
        let extra = vec![
            Header::Other("Event".into(), event.into()),
            Header::Expires(expires.to_string().into()),
        ];
        Creator::Subscription {
            base: make_base(rsip::Method::Subscribe, target, profile, extra, None),
            event: event.to_string(),
        }
    }

    /// REFER carrying `refer_to`; the implicit subscription is the "refer"
    /// event package.
    pub fn refer(target: &str, profile: Arc<UserProfile>, refer_to: &str) -> Creator {
        let extra = vec![Header::Other("Refer-To".into(), refer_to.into())];
        Creator::Subscription {
            base: make_base(rsip::Method::Refer, target, profile, extra, None),
            event: "refer".to_string(),
        }
    }

    /// REGISTER towards a registrar; To mirrors the From identity.
    pub fn registration(target: &str, profile: Arc<UserProfile>, expires: u32) -> Creator {
        let extra = vec![Header::Expires(expires.to_string().into())];
        let base = make_base(rsip::Method::Register, target, profile, extra, None);
        // RFC 3261 10.2: To carries the address-of-record being
        // registered, i.e. our own identity, untagged.
        if let Ok(mut request) = base.request.lock() {
            let aor = base
                .user_profile
                .default_from()
                .unwrap_or("<sip:anonymous@anonymous.invalid>")
                .to_string();
            crate::rsip_ext::remove_header(&mut request.headers, "To");
            request.headers.push(Header::To(aor.into()));
        }
        Creator::Registration(base)
    }

    /// PUBLISH of `event` state with a document body.
    pub fn publication(
        target: &str,
        profile: Arc<UserProfile>,
        event: &str,
        expires: u32,
        body: (String, Vec<u8>),
    ) -> Creator {
        let extra = vec![
            Header::Other("Event".into(), event.into()),
            Header::Expires(expires.to_string().into()),
        ];
        Creator::Publication {
            base: make_base(rsip::Method::Publish, target, profile, extra, Some(body)),
            event: event.to_string(),
        }
    }

    /// Arbitrary out-of-dialog request (OPTIONS and friends).
    pub fn out_of_dialog(target: &str, profile: Arc<UserProfile>, method: rsip::Method) -> Creator {
        Creator::OutOfDialog(make_base(method, target, profile, Vec::new(), None))
    }

    /// MESSAGE template; pages are queued on the usage and sent with the
    /// creator's identity.
    pub fn pager_message(target: &str, profile: Arc<UserProfile>) -> Creator {
        Creator::PagerMessage(make_base(rsip::Method::Message, target, profile, Vec::new(), None))
    }
}
