//! # sip-dum
//!
//! RFC 3261 dialog usage management for SIP endpoints: the protocol-state
//! layer that sits on top of a transaction stack and turns raw signalling
//! into stateful usages (invite sessions, subscriptions, publications,
//! registrations, out-of-dialog requests and pager messages).
//!
//! ## Architecture
//!
//! - [`manager::DialogUsageManager`] owns everything and drains a single
//!   FIFO the stack posts into; all state is touched only by the worker
//!   that calls `process()`.
//! - [`dialog::DialogSet`] groups the dialogs created by one UAC request
//!   (forking can produce several) and the non-dialog usages sharing its
//!   identity; [`dialog::Dialog`] owns at most one invite session plus
//!   any number of subscriptions.
//! - [`creator::Creator`] builds the first request of each new usage.
//! - [`feature::FeatureChain`] runs ordered per-transaction interceptors
//!   on both directions.
//! - [`stack::SipStack`] and [`stack::TransactionUser`] are the narrow
//!   seams to the transaction layer below.
//!
//! The wire behaviour follows RFC 3261 plus 3262 (100rel), 3265/6665
//! (events), 3311 (UPDATE), 3428 (MESSAGE), 3515 (REFER), 3891
//! (Replaces), 3903 (PUBLISH) and 5626 (client outbound).

pub mod creator;
pub mod dialog;
pub mod errors;
pub mod events;
pub mod feature;
pub mod handlers;
pub mod keep_alive;
pub mod manager;
pub mod persistence;
pub mod profile;
pub mod rsip_ext;
pub mod stack;
pub mod usage;
pub mod util;

pub use creator::{Creator, SharedRequest};
pub use dialog::{Dialog, DialogId, DialogSet, DialogSetId, DialogState, MergedRequestKey};
pub use errors::{DumError, DumResult};
pub use events::{
    DestroyTarget, DumAction, DumCommand, DumEvent, DumTimeout, FlowTuple, TimeoutKind,
    TransactionId,
};
pub use feature::{DumFeature, FeatureChain, FeatureDirection, FeatureEvent, ProcessingResult};
pub use handlers::Handlers;
pub use keep_alive::KeepAliveManager;
pub use manager::{DialogUsageManager, ShutdownState};
pub use profile::{AdvertisedCapability, MasterProfile, Mime, ReliableProvisionalMode, UserProfile};
pub use stack::{DumHandle, SendTarget, SipStack, TransactionUser};
pub use usage::{UsageHandle, UsageId, UsageKind};
