//! Identity and policy profiles.
//!
//! A [`UserProfile`] bundles the per-identity options that shape outgoing
//! traffic: identity headers, outbound routing, Via adjustments, RFC 5626
//! client-outbound flows. The [`MasterProfile`] extends one user profile
//! with the endpoint-wide validation policy consulted when no dialog
//! context exists.

pub mod master_profile;
pub mod user_profile;

pub use master_profile::{MasterProfile, Mime, ReliableProvisionalMode};
pub use user_profile::{AdvertisedCapability, UserProfile};
