//! Request validation tests: the RFC 3261 8.2 rejection table.

mod common;

use common::{deliver, new_dum, new_dum_with, RequestSpec};

use rsip::Header;
use sip_dum::rsip_ext;
use sip_dum::{MasterProfile, ReliableProvisionalMode, UserProfile};

/// A method outside the master profile's allowed set draws 405 with an
/// Allow header listing what we do take.
#[tokio::test]
async fn unsupported_method_gets_405_with_allow() {
    let user = UserProfile::default().with_default_from("<sip:uas@example.com>");
    let master = MasterProfile::new(user); // INVITE/ACK/CANCEL/OPTIONS/BYE only
    let (stack, mut dum) = new_dum_with(master);

    let message = RequestSpec::new(rsip::Method::Message).build();
    deliver(&mut dum, message);

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 405);
    let allow = rsip_ext::header_value(&response.headers, "Allow").expect("Allow present");
    assert!(allow.contains("INVITE"));
    assert!(allow.contains("OPTIONS"));
    assert!(!allow.contains("MESSAGE"));
}

/// A Request-URI scheme we do not serve draws 416.
#[tokio::test]
async fn unsupported_scheme_gets_416() {
    let (stack, mut dum) = new_dum();

    let mut invite = RequestSpec::new(rsip::Method::Invite).build();
    invite.uri.scheme = Some(rsip::Scheme::Other("tel".into()));
    deliver(&mut dum, invite);

    assert_eq!(stack.last_status(), Some(416));
}

/// Unknown Require tags draw 420 naming them in Unsupported.
#[tokio::test]
async fn unknown_require_tags_get_420() {
    let (stack, mut dum) = new_dum();

    let invite = RequestSpec::new(rsip::Method::Invite)
        .header(Header::Require("foobar".into()))
        .build();
    deliver(&mut dum, invite);

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 420);
    assert_eq!(
        rsip_ext::header_value(&response.headers, "Unsupported").as_deref(),
        Some("foobar")
    );
}

/// When the UAS requires reliable provisionals, an INVITE that offers
/// neither Supported nor Require 100rel draws 421.
#[tokio::test]
async fn missing_100rel_gets_421_when_required() {
    let mut master = common::default_master_profile();
    master.set_uas_reliable_provisional_mode(ReliableProvisionalMode::Required);
    let (stack, mut dum) = new_dum_with(master);

    deliver(&mut dum, RequestSpec::new(rsip::Method::Invite).build());

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 421);
    assert_eq!(
        rsip_ext::header_value(&response.headers, "Require").as_deref(),
        Some("100rel")
    );

    // The same INVITE offering 100rel passes the gate.
    stack.clear_sent();
    let offered = RequestSpec::new(rsip::Method::Invite)
        .branch("z9hG4bKwith100rel")
        .call_id("second-call@client.example.com")
        .header(Header::Supported("100rel".into()))
        .build();
    deliver(&mut dum, offered);
    assert_ne!(stack.last_status(), Some(421));
}

/// An unsupported body type draws 415 with an Accept header.
#[tokio::test]
async fn unsupported_content_type_gets_415() {
    let (stack, mut dum) = new_dum();

    let invite = RequestSpec::new(rsip::Method::Invite)
        .header(Header::ContentType("application/x-unknown".into()))
        .body(b"opaque")
        .build();
    deliver(&mut dum, invite);

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 415);
    assert!(rsip_ext::header_value(&response.headers, "Accept")
        .expect("Accept present")
        .contains("application/sdp"));
}

/// Content marked optional in Content-Disposition skips the 415 check.
#[tokio::test]
async fn optional_content_disposition_skips_content_validation() {
    let (stack, mut dum) = new_dum();

    let invite = RequestSpec::new(rsip::Method::Invite)
        .header(Header::ContentType("application/x-unknown".into()))
        .header(Header::ContentDisposition("render;handling=optional".into()))
        .body(b"opaque")
        .build();
    deliver(&mut dum, invite);

    assert_ne!(stack.last_status(), Some(415));
}

/// With accept validation on, an Accept matching nothing we produce
/// draws 406.
#[tokio::test]
async fn unmatched_accept_gets_406() {
    let mut master = common::default_master_profile();
    master.set_validate_accept_enabled(true);
    let (stack, mut dum) = new_dum_with(master);

    let invite = RequestSpec::new(rsip::Method::Invite)
        .header(Header::Accept("application/x-bogus".into()))
        .build();
    deliver(&mut dum, invite);

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 406);
    assert!(rsip_ext::header_value(&response.headers, "Accept").is_some());
}

/// Missing or unparseable From/To/Call-ID draws exactly 400 with the bad
/// header named, except for ACK which is dropped silently.
#[tokio::test]
async fn malformed_core_headers_get_400_naming_them() {
    let (stack, mut dum) = new_dum();

    let invite = common::request(
        rsip::Method::Invite,
        "sip:uas@example.com",
        vec![
            Header::Via("SIP/2.0/UDP client.example.com;branch=z9hG4bKmal".into()),
            Header::To("<sip:uas@example.com>".into()),
            Header::CallId("malformed@client.example.com".into()),
            Header::CSeq("1 INVITE".into()),
        ],
    );
    deliver(&mut dum, invite);

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 400);
    let warning =
        rsip_ext::header_value(&response.headers, "Warning").expect("diagnostic present");
    assert!(warning.contains("From"), "warning was: {}", warning);

    stack.clear_sent();
    let ack = common::request(
        rsip::Method::Ack,
        "sip:uas@example.com",
        vec![
            Header::Via("SIP/2.0/UDP client.example.com;branch=z9hG4bKmal2".into()),
            Header::To("<sip:uas@example.com>".into()),
            Header::CallId("malformed2@client.example.com".into()),
            Header::CSeq("1 ACK".into()),
        ],
    );
    deliver(&mut dum, ack);
    assert!(stack.sent_responses().is_empty(), "ACK must be dropped");
}

/// SUBSCRIBE for an event package nobody registered draws 489 listing
/// the packages we do accept.
#[tokio::test]
async fn unknown_event_package_gets_489_with_allow_events() {
    let (stack, mut dum) = new_dum();

    let subscribe = RequestSpec::new(rsip::Method::Subscribe)
        .header(Header::Other("Event".into(), "presence".into()))
        .header(Header::Expires("600".into()))
        .build();
    deliver(&mut dum, subscribe);

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 489);
    // The built-in refer handler is the only registration.
    assert_eq!(
        rsip_ext::header_value(&response.headers, "Allow-Events").as_deref(),
        Some("refer")
    );
}

/// A SUBSCRIBE without any Event header draws 400.
#[tokio::test]
async fn subscribe_without_event_gets_400() {
    let (stack, mut dum) = new_dum();

    let subscribe = RequestSpec::new(rsip::Method::Subscribe).build();
    deliver(&mut dum, subscribe);

    assert_eq!(stack.last_status(), Some(400));
}
