//! Dialog-set routing: merged requests, in-dialog matching, CANCEL,
//! and the destroy invariant.

mod common;

use common::{deliver, new_dum, RequestSpec};

use rsip::Header;
use sip_dum::rsip_ext;

/// RFC 3261 8.2.2.2: a second INVITE identical in (Call-ID, From tag,
/// CSeq) on a different branch is a merged request and draws 482.
#[tokio::test]
async fn merged_invite_gets_482() {
    let (stack, mut dum) = new_dum();

    let first = RequestSpec::new(rsip::Method::Invite)
        .call_id("merge-me@client.example.com")
        .from_tag("123")
        .branch("z9hG4bKfirst")
        .build();
    deliver(&mut dum, first);
    // The first INVITE enters a new dialog set and waits for the
    // application; nothing goes out on the wire yet.
    assert!(stack.sent_responses().is_empty());

    let second = RequestSpec::new(rsip::Method::Invite)
        .call_id("merge-me@client.example.com")
        .from_tag("123")
        .branch("z9hG4bKsecond")
        .build();
    deliver(&mut dum, second);

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 482);
}

/// The merge window closes when the scheduled removal fires; after that
/// the same origin is fresh traffic again.
#[tokio::test]
async fn merge_window_expiry_forgets_the_key() {
    let (stack, mut dum) = new_dum();

    let first = RequestSpec::new(rsip::Method::Invite)
        .call_id("short-merge@client.example.com")
        .from_tag("123")
        .branch("z9hG4bKone")
        .build();
    deliver(&mut dum, first);

    // The removal command was scheduled on the stack's timer facility.
    assert!(!stack.posted.lock().unwrap().is_empty());
    stack.fire_timers();
    dum.process_pending();

    let retry = RequestSpec::new(rsip::Method::Invite)
        .call_id("short-merge@client.example.com")
        .from_tag("123")
        .branch("z9hG4bKtwo")
        .build();
    deliver(&mut dum, retry);

    // Not merged; it collides with the still-live dialog set instead and
    // is routed there rather than rejected with 482.
    assert_ne!(stack.last_status(), Some(482));
}

/// An in-dialog request whose To tag matches nothing draws 481; a stray
/// ACK is silently dropped.
#[tokio::test]
async fn unmatched_in_dialog_requests() {
    let (stack, mut dum) = new_dum();

    let bye = RequestSpec::new(rsip::Method::Bye)
        .to_tag("nosuchtag")
        .build();
    deliver(&mut dum, bye);
    assert_eq!(stack.last_status(), Some(481));

    stack.clear_sent();
    let ack = RequestSpec::new(rsip::Method::Ack)
        .to_tag("nosuchtag")
        .branch("z9hG4bKack")
        .build();
    deliver(&mut dum, ack);
    assert!(stack.sent_responses().is_empty());
}

/// Initial PRACK/BYE/UPDATE/INFO have nothing to match and draw 481.
#[tokio::test]
async fn initial_mid_dialog_methods_get_481() {
    for method in [
        rsip::Method::PRack,
        rsip::Method::Bye,
        rsip::Method::Update,
        rsip::Method::Info,
    ] {
        let (stack, mut dum) = new_dum();
        deliver(&mut dum, RequestSpec::new(method).build());
        assert_eq!(stack.last_status(), Some(481), "{} should draw 481", method);
    }
}

/// CANCEL against a live server INVITE answers the CANCEL with 200 and
/// the INVITE with 487; CANCEL against nothing draws 481.
#[tokio::test]
async fn cancel_matches_through_the_cancel_map() {
    let (stack, mut dum) = new_dum();

    let invite = RequestSpec::new(rsip::Method::Invite)
        .call_id("cancel-me@client.example.com")
        .branch("z9hG4bKinv1")
        .build();
    deliver(&mut dum, invite);

    let cancel = RequestSpec::new(rsip::Method::Cancel)
        .call_id("cancel-me@client.example.com")
        .branch("z9hG4bKinv1")
        .build();
    deliver(&mut dum, cancel);

    let codes: Vec<u16> = stack
        .sent_responses()
        .iter()
        .map(|r| sip_dum::util::status_u16(&r.status_code))
        .collect();
    assert!(codes.contains(&200), "CANCEL must be answered: {:?}", codes);
    assert!(codes.contains(&487), "INVITE must be terminated: {:?}", codes);

    stack.clear_sent();
    let stray = RequestSpec::new(rsip::Method::Cancel)
        .call_id("unknown@client.example.com")
        .branch("z9hG4bKnothing")
        .build();
    deliver(&mut dum, stray);
    assert_eq!(stack.last_status(), Some(481));
}

/// Full UAS subscription round trip: SUBSCRIBE creates the dialog and is
/// answered 202 with our tag; a refresh routed by that tag reaches the
/// same dialog; an unsubscribe destroys it, after which nothing matches.
#[tokio::test]
async fn subscription_dialog_lifecycle_and_destroy_invariant() {
    let (stack, mut dum) = new_dum();

    let subscribe = RequestSpec::new(rsip::Method::Subscribe)
        .call_id("subs@client.example.com")
        .branch("z9hG4bKsub1")
        .header(Header::Other("Event".into(), "refer".into()))
        .header(Header::Expires("600".into()))
        .build();
    deliver(&mut dum, subscribe);

    let accepted = stack.last_response().expect("202 went out");
    assert_eq!(sip_dum::util::status_u16(&accepted.status_code), 202);
    let our_tag = rsip_ext::to_tag(&accepted).expect("202 carries our tag");

    // Refresh inside the dialog.
    stack.clear_sent();
    let refresh = RequestSpec::new(rsip::Method::Subscribe)
        .call_id("subs@client.example.com")
        .branch("z9hG4bKsub2")
        .cseq(2)
        .to_tag(&our_tag)
        .header(Header::Other("Event".into(), "refer".into()))
        .header(Header::Expires("300".into()))
        .build();
    deliver(&mut dum, refresh);
    assert_eq!(stack.last_status(), Some(200));

    // Unsubscribe tears the dialog (and with it the set) down.
    stack.clear_sent();
    let unsubscribe = RequestSpec::new(rsip::Method::Subscribe)
        .call_id("subs@client.example.com")
        .branch("z9hG4bKsub3")
        .cseq(3)
        .to_tag(&our_tag)
        .header(Header::Other("Event".into(), "refer".into()))
        .header(Header::Expires("0".into()))
        .build();
    deliver(&mut dum, unsubscribe);
    assert_eq!(stack.last_status(), Some(200));

    // The destroy invariant: nothing reaches the dead set any more.
    let set_id = sip_dum::DialogSetId::new("subs@client.example.com", our_tag.clone());
    assert!(dum.find_dialog_set(&set_id).is_none());

    stack.clear_sent();
    let late = RequestSpec::new(rsip::Method::Subscribe)
        .call_id("subs@client.example.com")
        .branch("z9hG4bKsub4")
        .cseq(4)
        .to_tag(&our_tag)
        .header(Header::Other("Event".into(), "refer".into()))
        .build();
    deliver(&mut dum, late);
    assert_eq!(stack.last_status(), Some(481));
}

/// A REGISTER carrying a To tag is invalid unless the profile opts into
/// tolerating broken registrars.
#[tokio::test]
async fn register_with_to_tag_gets_400_unless_allowed() {
    let (stack, mut dum) = new_dum();
    let register = RequestSpec::new(rsip::Method::Register)
        .to_tag("bogus")
        .build();
    deliver(&mut dum, register);
    assert_eq!(stack.last_status(), Some(400));

    let mut master = common::default_master_profile();
    master.set_allow_bad_registration(true);
    let (stack, mut dum) = common::new_dum_with(master);
    let register = RequestSpec::new(rsip::Method::Register)
        .to_tag("bogus")
        .build();
    deliver(&mut dum, register);
    // Treated as an initial REGISTER; no server registration handler is
    // installed, so it draws 405 rather than the To-tag 400.
    assert_eq!(stack.last_status(), Some(405));
}

/// OPTIONS is answered with the advertised capability set.
#[tokio::test]
async fn options_reports_capabilities() {
    let mut master = common::default_master_profile();
    let user = master.user_profile().clone()
        .with_advertised_capability(sip_dum::AdvertisedCapability::Allow);
    *master.user_profile_mut() = user;
    let (stack, mut dum) = common::new_dum_with(master);

    deliver(&mut dum, RequestSpec::new(rsip::Method::Options).build());

    let response = stack.last_response().expect("200 went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 200);
    assert!(rsip_ext::header_value(&response.headers, "Allow")
        .expect("Allow advertised")
        .contains("INVITE"));
}
