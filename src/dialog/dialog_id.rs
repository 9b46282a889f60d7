//! Dialog and dialog-set identifiers (RFC 3261 section 12).

use serde::{Deserialize, Serialize};
use std::fmt;

use rsip::prelude::{HeadersExt, UntypedHeader};

use crate::rsip_ext;

/// Identity of a dialog set: the Call-ID plus our tag on it.
///
/// Every dialog created by a single UAC request shares this pair; forking
/// produces several dialogs under one set. For a UAS the local tag is
/// generated when the set is created and stamped onto every non-100
/// response, so in-dialog requests from the peer carry it in their To
/// header and resolve back to the same set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogSetId {
    call_id: String,
    local_tag: String,
}

impl DialogSetId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>) -> Self {
        DialogSetId {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
        }
    }

    /// Identity of the set an outgoing request belongs to: our tag is the
    /// From tag we generated.
    pub fn of_outgoing_request(request: &rsip::Request) -> Option<DialogSetId> {
        Some(DialogSetId::new(
            request.call_id_header().ok()?.value().to_string(),
            rsip_ext::from_tag(request)?,
        ))
    }

    /// Identity of the set a received response resolves to: we sent the
    /// request, so our tag is the From tag.
    pub fn of_incoming_response(response: &rsip::Response) -> Option<DialogSetId> {
        Some(DialogSetId::new(
            response.call_id_header().ok()?.value().to_string(),
            rsip_ext::from_tag(response)?,
        ))
    }

    /// Identity of the set a received in-dialog request resolves to: the
    /// peer addressed us, so our tag is the To tag. `None` for initial
    /// requests, which carry no To tag.
    pub fn of_incoming_request(request: &rsip::Request) -> Option<DialogSetId> {
        Some(DialogSetId::new(
            request.call_id_header().ok()?.value().to_string(),
            rsip_ext::to_tag(request)?,
        ))
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }
}

impl fmt::Display for DialogSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.call_id, self.local_tag)
    }
}

/// Identity of a single dialog: its set plus the remote tag.
///
/// An empty remote tag denotes a dialog that is not yet established (no
/// tagged response observed). Tags are immutable once the establishing
/// response has been seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId {
    set_id: DialogSetId,
    remote_tag: String,
}

impl DialogId {
    pub fn new(set_id: DialogSetId, remote_tag: impl Into<String>) -> Self {
        DialogId {
            set_id,
            remote_tag: remote_tag.into(),
        }
    }

    pub fn from_parts(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        DialogId::new(DialogSetId::new(call_id, local_tag), remote_tag)
    }

    /// Dialog addressed by a received in-dialog request: remote tag is the
    /// peer's From tag.
    pub fn of_incoming_request(request: &rsip::Request) -> Option<DialogId> {
        Some(DialogId::new(
            DialogSetId::of_incoming_request(request)?,
            rsip_ext::from_tag(request).unwrap_or_default(),
        ))
    }

    /// Dialog established/addressed by a received response: remote tag is
    /// the To tag (may be absent on 100s).
    pub fn of_incoming_response(response: &rsip::Response) -> Option<DialogId> {
        Some(DialogId::new(
            DialogSetId::of_incoming_response(response)?,
            rsip_ext::to_tag(response).unwrap_or_default(),
        ))
    }

    pub fn set_id(&self) -> &DialogSetId {
        &self.set_id
    }

    pub fn call_id(&self) -> &str {
        self.set_id.call_id()
    }

    pub fn local_tag(&self) -> &str {
        self.set_id.local_tag()
    }

    pub fn remote_tag(&self) -> &str {
        &self.remote_tag
    }

    pub fn is_established(&self) -> bool {
        !self.remote_tag.is_empty()
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.set_id, self.remote_tag)
    }
}

/// Key for merged-request detection (RFC 3261 section 8.2.2.2): an initial
/// request resubmitted on a different branch matches an accepted one on
/// Call-ID, From tag and CSeq. The Request-URI joins the key when the
/// master profile asks for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergedRequestKey {
    call_id: String,
    from_tag: String,
    cseq: String,
    request_uri: Option<String>,
}

impl MergedRequestKey {
    pub fn from_request(request: &rsip::Request, check_request_uri: bool) -> Option<MergedRequestKey> {
        let (seq, method) = crate::rsip_ext::cseq_of(request)?;
        Some(MergedRequestKey {
            call_id: request.call_id_header().ok()?.value().to_string(),
            from_tag: rsip_ext::from_tag(request)?,
            cseq: format!("{} {}", seq, method),
            request_uri: check_request_uri.then(|| request.uri.to_string()),
        })
    }
}

impl fmt::Display for MergedRequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.from_tag, self.cseq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_set_id_equality_is_structural() {
        let a = DialogSetId::new("call-1", "tag-a");
        let b = DialogSetId::new("call-1", "tag-a");
        let c = DialogSetId::new("call-1", "tag-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn empty_remote_tag_means_unestablished() {
        let id = DialogId::from_parts("call-1", "local", "");
        assert!(!id.is_established());
        let id = DialogId::from_parts("call-1", "local", "remote");
        assert!(id.is_established());
    }
}
