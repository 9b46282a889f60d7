//! Shared test harness: a recording mock stack and message builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rsip::Header;

use sip_dum::events::DumEvent;
use sip_dum::stack::{SendTarget, SipStack, TransactionUser};
use sip_dum::{DialogUsageManager, MasterProfile, UserProfile};

/// Records everything the manager pushes down; acknowledges
/// deregistration by posting `TransactionUserRemoved` back, the way a
/// real transaction layer answers once its transactions drain.
#[derive(Default)]
pub struct MockStack {
    pub sent: Mutex<Vec<(rsip::SipMessage, SendTarget)>>,
    pub posted: Mutex<Vec<(DumEvent, Duration)>>,
    pub tu: Mutex<Option<Arc<dyn TransactionUser>>>,
    pub shutdown_requested: AtomicBool,
    pub unregistered: AtomicBool,
}

impl MockStack {
    pub fn sent_messages(&self) -> Vec<rsip::SipMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(msg, _)| msg.clone())
            .collect()
    }

    pub fn sent_responses(&self) -> Vec<rsip::Response> {
        self.sent_messages()
            .into_iter()
            .filter_map(|msg| match msg {
                rsip::SipMessage::Response(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    pub fn sent_requests(&self) -> Vec<rsip::Request> {
        self.sent_messages()
            .into_iter()
            .filter_map(|msg| match msg {
                rsip::SipMessage::Request(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn last_response(&self) -> Option<rsip::Response> {
        self.sent_responses().pop()
    }

    pub fn last_status(&self) -> Option<u16> {
        self.last_response()
            .map(|r| sip_dum::util::status_u16(&r.status_code))
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Re-deliver everything posted with a delay, as if every timer had
    /// fired at once.
    pub fn fire_timers(&self) {
        let posted: Vec<(DumEvent, Duration)> =
            std::mem::take(&mut *self.posted.lock().unwrap());
        if let Some(tu) = self.tu.lock().unwrap().as_ref() {
            for (event, _) in posted {
                tu.post(event);
            }
        }
    }
}

impl SipStack for MockStack {
    fn send(&self, msg: rsip::SipMessage) {
        self.sent.lock().unwrap().push((msg, SendTarget::Default));
    }

    fn send_to(&self, msg: rsip::SipMessage, target: SendTarget) {
        self.sent.lock().unwrap().push((msg, target));
    }

    fn post_to_tu(&self, event: DumEvent, delay: Duration) {
        self.posted.lock().unwrap().push((event, delay));
    }

    fn register_transaction_user(&self, tu: Arc<dyn TransactionUser>) {
        *self.tu.lock().unwrap() = Some(tu);
    }

    fn request_transaction_user_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    fn unregister_transaction_user(&self) {
        self.unregistered.store(true, Ordering::SeqCst);
        if let Some(tu) = self.tu.lock().unwrap().as_ref() {
            tu.post(DumEvent::TransactionUserRemoved);
        }
    }
}

/// Manager over a mock stack, with a permissive master profile covering
/// the methods the tests poke at.
pub fn new_dum() -> (Arc<MockStack>, DialogUsageManager) {
    new_dum_with(default_master_profile())
}

pub fn new_dum_with(master: MasterProfile) -> (Arc<MockStack>, DialogUsageManager) {
    let stack = Arc::new(MockStack::default());
    let mut dum = DialogUsageManager::new(stack.clone());
    dum.set_master_profile(Arc::new(master)).unwrap();
    (stack, dum)
}

pub fn default_master_profile() -> MasterProfile {
    let user = UserProfile::default().with_default_from("<sip:uas@example.com>");
    let mut master = MasterProfile::new(user);
    for method in [
        rsip::Method::Subscribe,
        rsip::Method::Notify,
        rsip::Method::Publish,
        rsip::Method::Message,
        rsip::Method::Refer,
        rsip::Method::Register,
        rsip::Method::Bye,
        rsip::Method::Update,
        rsip::Method::Info,
        rsip::Method::PRack,
    ] {
        master.add_supported_method(method);
    }
    master
}

/// Post a SIP message into the manager and drain the FIFO.
pub fn deliver(dum: &mut DialogUsageManager, msg: impl Into<rsip::SipMessage>) {
    dum.post(DumEvent::Sip(msg.into()));
    dum.process_pending();
}

pub fn request(method: rsip::Method, uri: &str, headers: Vec<Header>) -> rsip::Request {
    rsip::Request {
        method,
        uri: rsip::Uri::try_from(uri).expect("test uri"),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: Vec::new(),
    }
}

pub struct RequestSpec {
    pub method: rsip::Method,
    pub call_id: String,
    pub from_tag: String,
    pub branch: String,
    pub to_tag: Option<String>,
    pub cseq: u32,
    pub extra: Vec<Header>,
    pub body: Vec<u8>,
}

impl RequestSpec {
    pub fn new(method: rsip::Method) -> RequestSpec {
        RequestSpec {
            method,
            call_id: "3848276298@client.example.com".into(),
            from_tag: "9fxced76sl".into(),
            branch: "z9hG4bK74bf9".into(),
            to_tag: None,
            cseq: 1,
            extra: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn from_tag(mut self, tag: &str) -> Self {
        self.from_tag = tag.into();
        self
    }

    pub fn branch(mut self, branch: &str) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.extra.push(header);
        self
    }

    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    pub fn build(self) -> rsip::Request {
        let to_value = match &self.to_tag {
            Some(tag) => format!("<sip:uas@example.com>;tag={}", tag),
            None => "<sip:uas@example.com>".to_string(),
        };
        let mut headers: Vec<Header> = vec![
            Header::Via(format!("SIP/2.0/UDP client.example.com;branch={}", self.branch).into()),
            Header::MaxForwards(70.into()),
            Header::From(format!("<sip:alice@client.example.com>;tag={}", self.from_tag).into()),
            Header::To(to_value.into()),
            Header::CallId(self.call_id.clone().into()),
            Header::CSeq(format!("{} {}", self.cseq, self.method).into()),
            Header::Contact("<sip:alice@client.example.com>".into()),
        ];
        headers.extend(self.extra);
        headers.push(Header::ContentLength((self.body.len() as u32).into()));
        rsip::Request {
            method: self.method,
            uri: rsip::Uri::try_from("sip:uas@example.com").expect("test uri"),
            version: rsip::Version::V2,
            headers: headers.into(),
            body: self.body,
        }
    }
}
