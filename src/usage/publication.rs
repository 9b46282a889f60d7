//! Publication usages (RFC 3903).

use crate::rsip_ext;

/// Publication we issue with outgoing PUBLISH requests.
#[derive(Debug, Clone)]
pub struct ClientPublication {
    pub serial: u64,
    pub event: String,
    pub expires: u32,
    /// Entity tag returned by the event state compositor.
    pub etag: Option<String>,
}

impl ClientPublication {
    pub fn new(serial: u64, event: impl Into<String>, expires: u32) -> Self {
        ClientPublication {
            serial,
            event: event.into(),
            expires,
            etag: None,
        }
    }

    /// Record the SIP-ETag of a 2xx.
    pub fn on_success(&mut self, response: &rsip::Response) {
        if let Some(etag) = rsip_ext::header_value(&response.headers, "SIP-ETag") {
            self.etag = Some(etag);
        }
    }
}

/// Event state published to us, addressed by entity tag.
///
/// Accepting a PUBLISH mints a fresh entity tag (RFC 3903 section 6); the
/// manager re-keys its map with the outcome.
#[derive(Debug, Clone)]
pub struct ServerPublication {
    pub serial: u64,
    pub etag: String,
    pub aor: String,
    pub event: String,
    pub expires: u32,
}

/// What an accepted PUBLISH did to the publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Initial publish or refresh/modify; carries the fresh entity tag.
    Updated { new_etag: String },
    /// Expires: 0 removal.
    Removed,
}

impl ServerPublication {
    pub fn new(
        serial: u64,
        etag: impl Into<String>,
        aor: impl Into<String>,
        event: impl Into<String>,
        expires: u32,
    ) -> Self {
        ServerPublication {
            serial,
            etag: etag.into(),
            aor: aor.into(),
            event: event.into(),
            expires,
        }
    }

    /// Apply a PUBLISH addressed at this publication.
    pub fn on_publish(&mut self, request: &rsip::Request) -> PublishOutcome {
        let expires = rsip_ext::header_value(&request.headers, "Expires")
            .and_then(|v| v.parse::<u32>().ok());
        if expires == Some(0) {
            self.expires = 0;
            return PublishOutcome::Removed;
        }
        if let Some(expires) = expires {
            self.expires = expires;
        }
        let new_etag = rsip_ext::random_hex(8);
        self.etag = new_etag.clone();
        PublishOutcome::Updated { new_etag }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(expires: Option<&str>) -> rsip::Request {
        let mut headers: Vec<rsip::Header> = vec![];
        if let Some(expires) = expires {
            headers.push(rsip::Header::Expires(expires.into()));
        }
        rsip::Request {
            method: rsip::Method::Publish,
            uri: rsip::Uri::try_from("sip:resource@example.com").unwrap(),
            version: rsip::Version::V2,
            headers: headers.into(),
            body: b"<presence/>".to_vec(),
        }
    }

    #[test]
    fn refresh_mints_a_fresh_entity_tag() {
        let mut publication = ServerPublication::new(1, "aaaa1111", "resource@example.com", "presence", 3600);
        let outcome = publication.on_publish(&publish(Some("1800")));
        match outcome {
            PublishOutcome::Updated { new_etag } => {
                assert_eq!(new_etag, publication.etag);
                assert_ne!(new_etag, "aaaa1111");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(publication.expires, 1800);
    }

    #[test]
    fn zero_expires_removes() {
        let mut publication = ServerPublication::new(1, "aaaa1111", "resource@example.com", "presence", 3600);
        assert_eq!(publication.on_publish(&publish(Some("0"))), PublishOutcome::Removed);
    }
}
