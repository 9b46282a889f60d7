//! The dialog model: identifiers, dialog sets, dialogs and their state.

pub mod dialog_id;
pub mod dialog_impl;
pub mod dialog_set;
pub mod dialog_state;

pub use dialog_id::{DialogId, DialogSetId, MergedRequestKey};
pub use dialog_impl::Dialog;
pub use dialog_set::DialogSet;
pub use dialog_state::DialogState;
