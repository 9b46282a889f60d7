//! Per-transaction feature chains.
//!
//! Features are interceptors a transaction's traffic flows through before
//! reaching core dispatch (incoming) or the wire (outgoing): identity
//! checks, server-side authentication, encryption. One chain exists per
//! direction per transaction; it is dropped as soon as it reports done.
//!
//! Ordering contract: on the incoming side a server auth manager is always
//! first; on the outgoing side new features are prepended, which keeps the
//! encryption feature installed at construction time last, directly before
//! the wire.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::events::TransactionId;

/// Flag set returned by [`DumFeature::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessingResult(u8);

impl ProcessingResult {
    /// Let the event continue to the next feature / core dispatch.
    pub const CONTINUE: ProcessingResult = ProcessingResult(0);
    /// The feature consumed the event; it must not travel further.
    pub const EVENT_TAKEN: ProcessingResult = ProcessingResult(1);
    /// This feature has finished its role for the transaction.
    pub const FEATURE_DONE: ProcessingResult = ProcessingResult(2);
    /// The whole chain is finished and can be destroyed.
    pub const CHAIN_DONE: ProcessingResult = ProcessingResult(4);

    pub fn contains(&self, other: ProcessingResult) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProcessingResult {
    type Output = ProcessingResult;

    fn bitor(self, rhs: ProcessingResult) -> ProcessingResult {
        ProcessingResult(self.0 | rhs.0)
    }
}

/// Which way a chain faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureDirection {
    Incoming,
    Outgoing,
}

/// The event a feature sees: the transaction's message, mutable so a
/// feature can rewrite it (decryption, identity stamping).
#[derive(Debug)]
pub struct FeatureEvent {
    pub transaction_id: TransactionId,
    pub direction: FeatureDirection,
    pub message: rsip::SipMessage,
}

/// A single interceptor. Features are shared across the chains of many
/// transactions; per-transaction state lives in the chain's cursor or in
/// the feature's own interior state keyed by transaction id.
pub trait DumFeature: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, event: &mut FeatureEvent) -> ProcessingResult;
}

/// Outcome of pushing one event through a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainOutcome {
    pub event_taken: bool,
    pub chain_done: bool,
}

/// Ordered feature list with a cursor, keyed by (direction, transaction).
pub struct FeatureChain {
    features: Vec<Arc<dyn DumFeature>>,
    cursor: usize,
}

impl FeatureChain {
    pub fn new(features: Vec<Arc<dyn DumFeature>>) -> Self {
        FeatureChain {
            features,
            cursor: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Drive `event` through the chain starting at the cursor.
    ///
    /// A feature reporting `FEATURE_DONE` is skipped from then on; an
    /// event not taken by the current feature flows onward only past
    /// finished features. Once every feature is done the chain reports
    /// done and the owner removes it.
    pub fn process(&mut self, event: &mut FeatureEvent) -> ChainOutcome {
        let mut outcome = ChainOutcome::default();
        while self.cursor < self.features.len() {
            let result = self.features[self.cursor].process(event);
            if result.contains(ProcessingResult::FEATURE_DONE) {
                self.cursor += 1;
            }
            if result.contains(ProcessingResult::CHAIN_DONE) {
                outcome.chain_done = true;
            }
            if result.contains(ProcessingResult::EVENT_TAKEN) {
                outcome.event_taken = true;
            }
            if outcome.event_taken || outcome.chain_done {
                break;
            }
            if !result.contains(ProcessingResult::FEATURE_DONE) {
                break;
            }
        }
        if self.cursor >= self.features.len() {
            outcome.chain_done = true;
        }
        outcome
    }
}

impl fmt::Debug for FeatureChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureChain")
            .field("features", &self.features.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeature {
        name: &'static str,
        calls: AtomicUsize,
        result: ProcessingResult,
    }

    impl CountingFeature {
        fn new(name: &'static str, result: ProcessingResult) -> Arc<Self> {
            Arc::new(CountingFeature {
                name,
                calls: AtomicUsize::new(0),
                result,
            })
        }
    }

    impl DumFeature for CountingFeature {
        fn name(&self) -> &str {
            self.name
        }

        fn process(&self, _event: &mut FeatureEvent) -> ProcessingResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    fn event() -> FeatureEvent {
        FeatureEvent {
            transaction_id: TransactionId::new("z9hG4bKtest"),
            direction: FeatureDirection::Incoming,
            message: rsip::SipMessage::Request(rsip::Request {
                method: rsip::Method::Options,
                uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
                version: rsip::Version::V2,
                headers: Default::default(),
                body: Default::default(),
            }),
        }
    }

    #[test]
    fn done_features_drain_the_chain() {
        let first = CountingFeature::new("first", ProcessingResult::FEATURE_DONE);
        let second = CountingFeature::new("second", ProcessingResult::FEATURE_DONE);
        let mut chain = FeatureChain::new(vec![first.clone(), second.clone()]);

        let outcome = chain.process(&mut event());
        assert!(outcome.chain_done);
        assert!(!outcome.event_taken);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn taken_event_stops_propagation() {
        let first = CountingFeature::new(
            "auth",
            ProcessingResult::EVENT_TAKEN,
        );
        let second = CountingFeature::new("later", ProcessingResult::FEATURE_DONE);
        let mut chain = FeatureChain::new(vec![first, second.clone()]);

        let outcome = chain.process(&mut event());
        assert!(outcome.event_taken);
        assert!(!outcome.chain_done);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn waiting_feature_sees_subsequent_events() {
        let waiting = CountingFeature::new("waiting", ProcessingResult::CONTINUE);
        let mut chain = FeatureChain::new(vec![waiting.clone()]);

        assert!(!chain.process(&mut event()).chain_done);
        assert!(!chain.process(&mut event()).chain_done);
        assert_eq!(waiting.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn chain_done_flag_short_circuits() {
        let first = CountingFeature::new(
            "encrypt",
            ProcessingResult::EVENT_TAKEN | ProcessingResult::CHAIN_DONE,
        );
        let mut chain = FeatureChain::new(vec![first]);
        let outcome = chain.process(&mut event());
        assert!(outcome.event_taken);
        assert!(outcome.chain_done);
    }
}
