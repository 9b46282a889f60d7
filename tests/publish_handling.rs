//! PUBLISH processing (RFC 3903): entity tags, refreshes and the
//! persistence fallback.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{deliver, new_dum, RequestSpec};

use rsip::Header;
use sip_dum::handlers::ServerPublicationHandler;
use sip_dum::persistence::PublicationPersistenceManager;
use sip_dum::rsip_ext;
use sip_dum::usage::UsageHandle;

struct NullPublicationHandler;
impl ServerPublicationHandler for NullPublicationHandler {}

fn with_presence_handler(dum: &mut sip_dum::DialogUsageManager) {
    dum.add_server_publication_handler("presence", Arc::new(NullPublicationHandler))
        .unwrap();
}

fn publish(body: &[u8]) -> RequestSpec {
    let spec = RequestSpec::new(rsip::Method::Publish)
        .header(Header::Other("Event".into(), "presence".into()))
        .header(Header::Expires("3600".into()));
    if body.is_empty() {
        spec
    } else {
        spec.body(body)
    }
}

/// An initial PUBLISH without a body draws 400.
#[tokio::test]
async fn publish_without_body_gets_400() {
    let (stack, mut dum) = new_dum();
    with_presence_handler(&mut dum);

    deliver(&mut dum, publish(b"").build());
    assert_eq!(stack.last_status(), Some(400));
}

/// A SIP-If-Match nobody knows draws 412.
#[tokio::test]
async fn publish_with_unknown_etag_gets_412() {
    let (stack, mut dum) = new_dum();
    with_presence_handler(&mut dum);

    let request = publish(b"<presence/>")
        .header(Header::Other("SIP-If-Match".into(), "deadbeef".into()))
        .build();
    deliver(&mut dum, request);
    assert_eq!(stack.last_status(), Some(412));
}

/// An initial PUBLISH mints a random 8-hex entity tag; a refresh against
/// it succeeds and mints a fresh one.
#[tokio::test]
async fn publish_lifecycle_rotates_entity_tags() {
    let (stack, mut dum) = new_dum();
    with_presence_handler(&mut dum);

    deliver(&mut dum, publish(b"<presence/>").build());
    let response = stack.last_response().expect("200 went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 200);
    let etag = rsip_ext::header_value(&response.headers, "SIP-ETag").expect("etag minted");
    assert_eq!(etag.len(), 8);
    assert!(etag.chars().all(|c| c.is_ascii_hexdigit()));

    stack.clear_sent();
    let refresh = publish(b"<presence/>")
        .branch("z9hG4bKrefresh")
        .cseq(2)
        .header(Header::Other("SIP-If-Match".into(), etag.clone()))
        .build();
    deliver(&mut dum, refresh);

    let response = stack.last_response().expect("refresh answered");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 200);
    let fresh = rsip_ext::header_value(&response.headers, "SIP-ETag").expect("etag rotated");
    assert_ne!(fresh, etag);

    // The superseded tag no longer matches.
    stack.clear_sent();
    let stale = publish(b"<presence/>")
        .branch("z9hG4bKstale")
        .cseq(3)
        .header(Header::Other("SIP-If-Match".into(), etag))
        .build();
    deliver(&mut dum, stale);
    assert_eq!(stack.last_status(), Some(412));
}

/// Expires: 0 removes the publication and reports it to the handler.
#[tokio::test]
async fn publish_with_zero_expires_removes() {
    struct RemovalFlag(AtomicBool);
    impl ServerPublicationHandler for RemovalFlag {
        fn on_removed(&self, _handle: &UsageHandle) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let (stack, mut dum) = new_dum();
    let flag = Arc::new(RemovalFlag(AtomicBool::new(false)));
    dum.add_server_publication_handler("presence", flag.clone())
        .unwrap();

    deliver(&mut dum, publish(b"<presence/>").build());
    let etag = rsip_ext::header_value(
        &stack.last_response().expect("200").headers,
        "SIP-ETag",
    )
    .expect("etag minted");

    stack.clear_sent();
    let remove = RequestSpec::new(rsip::Method::Publish)
        .branch("z9hG4bKremove")
        .cseq(2)
        .header(Header::Other("Event".into(), "presence".into()))
        .header(Header::Other("SIP-If-Match".into(), etag))
        .header(Header::Expires("0".into()))
        .build();
    deliver(&mut dum, remove);

    assert_eq!(stack.last_status(), Some(200));
    assert!(flag.0.load(Ordering::SeqCst));
}

/// A publication that only exists in the persistence store is rebuilt in
/// memory instead of drawing 412.
#[tokio::test]
async fn publish_resurrects_from_the_persistence_store() {
    struct KnowsEverything;
    impl PublicationPersistenceManager for KnowsEverything {
        fn document_exists(&self, _event: &str, _aor: &str, _etag: &str) -> bool {
            true
        }
    }

    let (stack, mut dum) = new_dum();
    with_presence_handler(&mut dum);
    dum.set_publication_persistence_manager(Arc::new(KnowsEverything))
        .unwrap();

    let request = publish(b"<presence/>")
        .header(Header::Other("SIP-If-Match".into(), "11112222".into()))
        .build();
    deliver(&mut dum, request);

    let response = stack.last_response().expect("200 went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 200);
    assert!(rsip_ext::header_value(&response.headers, "SIP-ETag").is_some());
}

/// PUBLISH for an event with no publication handler draws 489.
#[tokio::test]
async fn publish_unknown_event_package_gets_489() {
    let (stack, mut dum) = new_dum();
    with_presence_handler(&mut dum);

    let request = RequestSpec::new(rsip::Method::Publish)
        .header(Header::Other("Event".into(), "dialog".into()))
        .body(b"<dialog-info/>")
        .build();
    deliver(&mut dum, request);

    let response = stack.last_response().expect("a response went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 489);
    assert_eq!(
        rsip_ext::header_value(&response.headers, "Allow-Events").as_deref(),
        Some("presence")
    );
}
