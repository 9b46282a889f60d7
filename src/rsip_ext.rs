//! Helpers layered over the `rsip` message model.
//!
//! `rsip` keeps the RFC 3261 core headers as dedicated variants and leaves
//! extension headers to `Header::Other`. The accessors here go through the
//! rendered header line so a lookup works the same way whichever variant a
//! parser produced.

use rand::Rng;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Headers, Param};

/// `Headers` only appends; building a route set or forcing a feature to the
/// front of a list needs insertion at the head.
pub trait HeadersPushFront {
    fn push_front(&mut self, header: Header);
}

impl HeadersPushFront for Headers {
    fn push_front(&mut self, header: Header) {
        let mut headers = self.iter().cloned().collect::<Vec<_>>();
        headers.insert(0, header);
        *self = headers.into();
    }
}

/// Generate a local tag for From/To headers.
pub fn make_tag() -> String {
    random_hex(8)
}

/// Generate a fresh Via branch with the RFC 3261 magic cookie.
pub fn make_branch() -> String {
    format!("z9hG4bK{}", random_hex(12))
}

/// Generate a globally unique Call-ID.
pub fn make_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Cryptographically random lowercase hex string of `len` characters.
pub fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Find the first header named `name` (case-insensitive), returning its
/// rendered value. Works for extension headers regardless of whether the
/// parser mapped them to a dedicated variant or to `Header::Other`.
pub fn header_value(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| {
        let line = h.to_string();
        let (n, v) = line.split_once(':')?;
        if n.trim().eq_ignore_ascii_case(name) {
            Some(v.trim().to_string())
        } else {
            None
        }
    })
}

/// All values for `name`, with comma-separated lists split into tokens.
pub fn header_tokens(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| {
            let line = h.to_string();
            let (n, v) = line.split_once(':')?;
            if n.trim().eq_ignore_ascii_case(name) {
                Some(v.to_string())
            } else {
                None
            }
        })
        .flat_map(|v| {
            v.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Remove every header named `name` (case-insensitive).
pub fn remove_header(headers: &mut Headers, name: &str) {
    headers.retain(|h| {
        h.to_string()
            .split_once(':')
            .map(|(n, _)| !n.trim().eq_ignore_ascii_case(name))
            .unwrap_or(true)
    });
}

/// The event package named by the Event header, without any `;id=` part.
pub fn event_package(headers: &Headers) -> Option<String> {
    header_value(headers, "Event")
        .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The SIP-If-Match entity tag of a PUBLISH refresh/modify/remove.
pub fn sip_if_match(headers: &Headers) -> Option<String> {
    header_value(headers, "SIP-If-Match").filter(|v| !v.is_empty())
}

/// From-header tag of a message, if present and parseable.
pub fn from_tag<M: HeadersExt>(msg: &M) -> Option<String> {
    let from = msg.from_header().ok()?.typed().ok()?;
    tag_of(&from.params)
}

/// To-header tag of a message, if present and parseable.
pub fn to_tag<M: HeadersExt>(msg: &M) -> Option<String> {
    let to = msg.to_header().ok()?.typed().ok()?;
    tag_of(&to.params)
}

fn tag_of(params: &[Param]) -> Option<String> {
    params.iter().find_map(|p| match p {
        Param::Tag(tag) => Some(tag.value().to_string()),
        _ => None,
    })
}

/// CSeq sequence number and method, if parseable.
pub fn cseq_of<M: HeadersExt>(msg: &M) -> Option<(u32, rsip::Method)> {
    let cseq = msg.cseq_header().ok()?.typed().ok()?;
    Some((cseq.seq, cseq.method))
}

/// Branch parameter of the topmost Via. This is the transaction identity
/// recovered from the wire: a CANCEL or ACK carries the branch of the
/// request it addresses.
pub fn top_via_branch<M: HeadersExt>(msg: &M) -> Option<String> {
    let via = msg.via_header().ok()?.typed().ok()?;
    via.params.iter().find_map(|p| match p {
        Param::Branch(branch) => Some(branch.value().to_string()),
        _ => None,
    })
}

/// Core-header well-formedness per RFC 3261 8.2: returns the names of the
/// From/To/Call-ID headers that are missing or unparseable.
pub fn malformed_core_headers<M: HeadersExt>(msg: &M) -> Vec<&'static str> {
    let mut bad = Vec::new();
    if msg
        .from_header()
        .ok()
        .and_then(|h| h.typed().ok())
        .is_none()
    {
        bad.push("From");
    }
    if msg.to_header().ok().and_then(|h| h.typed().ok()).is_none() {
        bad.push("To");
    }
    if msg
        .call_id_header()
        .map(|h| h.value().trim().is_empty())
        .unwrap_or(true)
    {
        bad.push("Call-Id");
    }
    bad
}

/// Rewrite the topmost Via of a request in place. The rewriters below
/// work on the rendered value, which keeps them independent of how the
/// parser decomposed the header.
pub fn rewrite_top_via<F: FnOnce(&str) -> String>(request: &mut rsip::Request, rewrite: F) {
    let mut rewrite = Some(rewrite);
    let headers: Vec<Header> = request
        .headers
        .iter()
        .cloned()
        .map(|h| match h {
            Header::Via(via) => match rewrite.take() {
                Some(f) => Header::Via(f(via.value()).into()),
                None => Header::Via(via),
            },
            other => other,
        })
        .collect();
    request.headers = headers.into();
}

/// Replace (or remove, with `None`) a parameter of a Via value. A bare
/// parameter like `rport` passes `Some("")`.
pub fn via_with_param(value: &str, name: &str, new_value: Option<&str>) -> String {
    let mut parts = value.split(';').map(str::trim);
    let mut out = parts.next().unwrap_or_default().to_string();
    for part in parts {
        let param_name = part.split('=').next().unwrap_or(part);
        if !param_name.eq_ignore_ascii_case(name) && !part.is_empty() {
            out.push(';');
            out.push_str(part);
        }
    }
    match new_value {
        Some("") => {
            out.push(';');
            out.push_str(name);
        }
        Some(new_value) => {
            out.push(';');
            out.push_str(name);
            out.push('=');
            out.push_str(new_value);
        }
        None => {}
    }
    out
}

/// Rewrite the sent-by of a Via value: `host` and/or `port` replace the
/// current ones.
pub fn via_with_sent_by(value: &str, host: Option<&str>, port: Option<u16>) -> String {
    let (head, params) = match value.split_once(';') {
        Some((head, params)) => (head.trim(), Some(params)),
        None => (value.trim(), None),
    };
    let (protocol, sent_by) = match head.rsplit_once(' ') {
        Some((protocol, sent_by)) => (protocol.trim(), sent_by.trim()),
        None => (head, ""),
    };
    let (current_host, current_port) = match sent_by.rsplit_once(':') {
        // Guard against bare IPv6 references, which also contain colons.
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host, Some(port.to_string()))
        }
        _ => (sent_by, None),
    };
    let host = host.unwrap_or(current_host);
    let port = port
        .map(|p| p.to_string())
        .or(current_port)
        .map(|p| format!(":{}", p))
        .unwrap_or_default();
    let mut out = format!("{} {}{}", protocol, host, port);
    if let Some(params) = params {
        out.push(';');
        out.push_str(params);
    }
    out
}

/// Pull the URI out of a Contact header value, tolerating display names
/// and parameters. Only transport parameters survive, the rest is
/// contact-specific decoration.
pub fn extract_uri_from_contact(line: &str) -> Option<rsip::Uri> {
    if let Ok(contact) = rsip::headers::Contact::try_from(line) {
        if let Ok(mut uri) = contact.uri() {
            uri.params.retain(|p| matches!(p, Param::Transport(_)));
            return Some(uri);
        }
    }

    line.split('<')
        .nth(1)
        .and_then(|s| s.split('>').next())
        .and_then(|uri| rsip::Uri::try_from(uri).ok())
}

/// Contact URI of a message, if a parseable Contact is present.
pub fn contact_uri<M: HeadersExt>(msg: &M) -> Option<rsip::Uri> {
    let value = msg.contact_header().ok()?.value().to_string();
    extract_uri_from_contact(&value)
}

/// Parsed Replaces header (RFC 3891 section 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaces {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
    pub early_only: bool,
}

impl Replaces {
    pub fn parse(value: &str) -> Option<Replaces> {
        let mut parts = value.split(';').map(str::trim);
        let call_id = parts.next()?.to_string();
        if call_id.is_empty() {
            return None;
        }
        let mut to_tag = None;
        let mut from_tag = None;
        let mut early_only = false;
        for part in parts {
            match part.split_once('=') {
                Some((k, v)) if k.eq_ignore_ascii_case("to-tag") => {
                    to_tag = Some(v.trim().to_string());
                }
                Some((k, v)) if k.eq_ignore_ascii_case("from-tag") => {
                    from_tag = Some(v.trim().to_string());
                }
                None if part.eq_ignore_ascii_case("early-only") => early_only = true,
                _ => {}
            }
        }
        Some(Replaces {
            call_id,
            to_tag: to_tag?,
            from_tag: from_tag?,
            early_only,
        })
    }

    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            "{};to-tag={};from-tag={}",
            self.call_id, self.to_tag, self.from_tag
        );
        if self.early_only {
            value.push_str(";early-only");
        }
        value
    }
}

/// Replaces header of a request, if present and complete.
pub fn replaces(headers: &Headers) -> Option<Replaces> {
    header_value(headers, "Replaces").and_then(|v| Replaces::parse(&v))
}
