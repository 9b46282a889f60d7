//! RFC 3891 section 3: matching a Replaces header to a local invite
//! session.

mod common;

use common::new_dum;

use sip_dum::events::DumEvent;
use sip_dum::rsip_ext::{self, Replaces};
use sip_dum::util;

/// Drive a UAC INVITE out through the manager and return the sent
/// request plus the dialog identity pieces the tests need.
fn start_uac_invite(
    stack: &common::MockStack,
    dum: &mut sip_dum::DialogUsageManager,
) -> rsip::Request {
    let shared = dum
        .make_invite_session("sip:bob@example.com", None, None)
        .expect("can create sessions while running");
    dum.send(&shared).expect("send succeeds");
    stack
        .sent_requests()
        .into_iter()
        .find(|r| r.method == rsip::Method::Invite)
        .expect("INVITE left")
}

fn deliver_response(dum: &mut sip_dum::DialogUsageManager, response: rsip::Response) {
    dum.post(DumEvent::Sip(rsip::SipMessage::Response(response)));
    dum.process_pending();
}

fn replaces_for(invite: &rsip::Request, remote_tag: &str, early_only: bool) -> Replaces {
    Replaces {
        call_id: rsip_ext::header_value(&invite.headers, "Call-ID").expect("call id"),
        to_tag: rsip_ext::from_tag(invite).expect("our tag"),
        from_tag: remote_tag.to_string(),
        early_only,
    }
}

/// No session at all: 481.
#[tokio::test]
async fn unmatched_replaces_is_481() {
    let (_stack, dum) = new_dum();
    let replaces = Replaces {
        call_id: "nothing@client.example.com".into(),
        to_tag: "a".into(),
        from_tag: "b".into(),
        early_only: false,
    };
    let (handle, code) = dum.find_invite_session_by_replaces(&replaces);
    assert!(handle.is_none());
    assert_eq!(util::status_u16(&code), 481);
}

/// A connected session matches; with early-only it draws 486 instead.
#[tokio::test]
async fn connected_session_matches_unless_early_only() {
    let (stack, mut dum) = new_dum();
    let invite = start_uac_invite(&stack, &mut dum);

    let mut ok = util::make_response(&invite, rsip::StatusCode::OK, None);
    rsip_ext::remove_header(&mut ok.headers, "To");
    ok.headers.push(rsip::Header::To(
        "<sip:bob@example.com>;tag=remote1".into(),
    ));
    ok.headers
        .push(rsip::Header::Contact("<sip:bob@host.example.com>".into()));
    deliver_response(&mut dum, ok);

    let replaces = replaces_for(&invite, "remote1", false);
    let (handle, code) = dum.find_invite_session_by_replaces(&replaces);
    assert!(handle.is_some());
    assert_eq!(util::status_u16(&code), 200);

    let early_only = replaces_for(&invite, "remote1", true);
    let (handle, code) = dum.find_invite_session_by_replaces(&early_only);
    assert!(handle.is_none());
    assert_eq!(util::status_u16(&code), 486);
}

/// A locally initiated early session matches.
#[tokio::test]
async fn early_uac_session_matches() {
    let (stack, mut dum) = new_dum();
    let invite = start_uac_invite(&stack, &mut dum);

    let mut ringing = util::make_response(&invite, rsip::StatusCode::Ringing, None);
    rsip_ext::remove_header(&mut ringing.headers, "To");
    ringing.headers.push(rsip::Header::To(
        "<sip:bob@example.com>;tag=early1".into(),
    ));
    deliver_response(&mut dum, ringing);

    let replaces = replaces_for(&invite, "early1", false);
    let (handle, code) = dum.find_invite_session_by_replaces(&replaces);
    assert!(handle.is_some(), "early UAC dialog should match");
    assert_eq!(util::status_u16(&code), 200);
}

/// A terminated-but-not-yet-reaped session draws 603.
#[tokio::test]
async fn terminated_session_draws_603() {
    let (stack, mut dum) = new_dum();
    let invite = start_uac_invite(&stack, &mut dum);

    let mut busy = util::make_response(&invite, rsip::StatusCode::BusyHere, None);
    rsip_ext::remove_header(&mut busy.headers, "To");
    busy.headers.push(rsip::Header::To(
        "<sip:bob@example.com>;tag=gone1".into(),
    ));
    // Process just the response, leaving the deferred dialog teardown
    // queued: the session is terminated but still present.
    dum.post(DumEvent::Sip(rsip::SipMessage::Response(busy)));
    dum.try_process();

    let replaces = replaces_for(&invite, "gone1", false);
    let (handle, code) = dum.find_invite_session_by_replaces(&replaces);
    assert!(handle.is_none());
    assert_eq!(util::status_u16(&code), 603);

    // Once the teardown drains the dialog is gone entirely: 481.
    dum.process_pending();
    let (_, code) = dum.find_invite_session_by_replaces(&replaces);
    assert_eq!(util::status_u16(&code), 481);
}
