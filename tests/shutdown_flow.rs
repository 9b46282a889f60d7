//! The shutdown state machine and its traffic gate.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{deliver, new_dum, RequestSpec};

use sip_dum::handlers::DumShutdownHandler;
use sip_dum::rsip_ext;
use sip_dum::ShutdownState;

#[derive(Default)]
struct CountingShutdownHandler(AtomicUsize);

impl DumShutdownHandler for CountingShutdownHandler {
    fn on_dum_can_be_deleted(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// With nothing open, shutdown walks straight through to Shutdown and
/// fires the completion callback exactly once.
#[tokio::test]
async fn idle_shutdown_completes_once() {
    let (stack, mut dum) = new_dum();
    let handler = Arc::new(CountingShutdownHandler::default());

    assert_eq!(dum.shutdown_state(), ShutdownState::Running);
    dum.shutdown(handler.clone());
    assert!(stack.shutdown_requested.load(Ordering::SeqCst));
    assert!(stack.unregistered.load(Ordering::SeqCst));
    assert_eq!(dum.shutdown_state(), ShutdownState::RemovingTransactionUser);

    // The mock stack acknowledged by posting TransactionUserRemoved.
    dum.process_pending();
    assert_eq!(dum.shutdown_state(), ShutdownState::Shutdown);
    assert_eq!(handler.0.load(Ordering::SeqCst), 1);

    // Tolerated, and the callback does not fire again.
    dum.shutdown(Arc::new(CountingShutdownHandler::default()));
    dum.process_pending();
    assert_eq!(handler.0.load(Ordering::SeqCst), 1);
}

/// While a usage is still open, shutdown waits; the last teardown
/// advances it.
#[tokio::test]
async fn shutdown_waits_for_open_dialog_sets() {
    let (stack, mut dum) = new_dum();

    // Open a UAS dialog set.
    let subscribe = RequestSpec::new(rsip::Method::Subscribe)
        .header(rsip::Header::Other("Event".into(), "refer".into()))
        .header(rsip::Header::Expires("600".into()))
        .build();
    deliver(&mut dum, subscribe);
    let our_tag = rsip_ext::to_tag(&stack.last_response().expect("202")).expect("tagged");

    let handler = Arc::new(CountingShutdownHandler::default());
    dum.shutdown(handler.clone());
    dum.process_pending();
    assert_eq!(dum.shutdown_state(), ShutdownState::ShutdownRequested);
    assert_eq!(handler.0.load(Ordering::SeqCst), 0);

    // Unsubscribe; the set drains and shutdown progresses.
    let unsubscribe = RequestSpec::new(rsip::Method::Subscribe)
        .branch("z9hG4bKbye")
        .cseq(2)
        .to_tag(&our_tag)
        .header(rsip::Header::Other("Event".into(), "refer".into()))
        .header(rsip::Header::Expires("0".into()))
        .build();
    deliver(&mut dum, unsubscribe);
    dum.process_pending();

    assert_eq!(dum.shutdown_state(), ShutdownState::Shutdown);
    assert_eq!(handler.0.load(Ordering::SeqCst), 1);
}

/// After shutdown is requested, a fresh INVITE draws 480 and no dialog
/// set is created for it.
#[tokio::test]
async fn shutdown_gates_new_initial_requests_with_480() {
    let (stack, mut dum) = new_dum();

    // Keep one set open so the manager stays in ShutdownRequested.
    let subscribe = RequestSpec::new(rsip::Method::Subscribe)
        .header(rsip::Header::Other("Event".into(), "refer".into()))
        .build();
    deliver(&mut dum, subscribe);

    dum.shutdown(Arc::new(CountingShutdownHandler::default()));
    dum.process_pending();
    stack.clear_sent();

    let invite = RequestSpec::new(rsip::Method::Invite)
        .call_id("late@client.example.com")
        .from_tag("late1")
        .branch("z9hG4bKlate")
        .build();
    deliver(&mut dum, invite);

    let response = stack.last_response().expect("480 went out");
    assert_eq!(sip_dum::util::status_u16(&response.status_code), 480);

    // No set was created for the rejected INVITE.
    let late_tag = rsip_ext::from_tag(
        &RequestSpec::new(rsip::Method::Invite)
            .call_id("late@client.example.com")
            .from_tag("late1")
            .build(),
    )
    .unwrap();
    let id = sip_dum::DialogSetId::new("late@client.example.com", late_tag);
    assert!(dum.find_dialog_set(&id).is_none());
}

/// Force shutdown skips the wait for open usages.
#[tokio::test]
async fn force_shutdown_ignores_open_usages() {
    let (stack, mut dum) = new_dum();

    let subscribe = RequestSpec::new(rsip::Method::Subscribe)
        .header(rsip::Header::Other("Event".into(), "refer".into()))
        .build();
    deliver(&mut dum, subscribe);

    let handler = Arc::new(CountingShutdownHandler::default());
    dum.force_shutdown(handler.clone());
    assert!(stack.unregistered.load(Ordering::SeqCst));
    dum.process_pending();
    assert_eq!(dum.shutdown_state(), ShutdownState::Shutdown);
    assert_eq!(handler.0.load(Ordering::SeqCst), 1);
}
