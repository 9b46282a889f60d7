//! Message construction helpers shared by the dispatcher and the dialog
//! model.

use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Param};

/// Build a response for `request` per RFC 3261 section 8.2.6: CSeq, From,
/// To, Call-ID and every Via are copied from the request. A To without a
/// tag picks up `local_tag` on non-100 responses, so all responses within
/// one dialog carry the same tag.
pub fn make_response(
    request: &rsip::Request,
    status: rsip::StatusCode,
    local_tag: Option<&str>,
) -> rsip::Response {
    let mut headers = rsip::Headers::default();

    for header in request.headers.iter() {
        match header {
            Header::Via(via) => headers.push(Header::Via(via.clone())),
            Header::From(from) => headers.push(Header::From(from.clone())),
            Header::To(to) => {
                let needs_tag = status != rsip::StatusCode::Trying && local_tag.is_some();
                match (needs_tag, to.clone().typed()) {
                    (true, Ok(mut typed)) => {
                        if !typed.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                            typed.params.push(Param::Tag(
                                local_tag.unwrap_or_default().to_string().into(),
                            ));
                        }
                        headers.push(Header::To(typed.into()));
                    }
                    _ => headers.push(Header::To(to.clone())),
                }
            }
            Header::CallId(call_id) => headers.push(Header::CallId(call_id.clone())),
            Header::CSeq(cseq) => headers.push(Header::CSeq(cseq.clone())),
            Header::RecordRoute(rr) => headers.push(Header::RecordRoute(rr.clone())),
            _ => {}
        }
    }

    headers.push(Header::ContentLength(0.into()));

    rsip::Response {
        status_code: status,
        version: request.version.clone(),
        headers,
        body: Vec::new(),
    }
}

/// Attach a diagnostic the peer can read. `rsip` renders canonical reason
/// phrases only, so rejection detail rides in a Warning header.
pub fn add_warning(response: &mut rsip::Response, text: &str) {
    response
        .headers
        .push(Header::Warning(format!("399 sip-dum \"{}\"", text).into()));
}

/// Numeric value of a status code.
pub fn status_u16(status: &rsip::StatusCode) -> u16 {
    status.code()
}

/// Topmost Via for a request we originate. The sent-by is a placeholder
/// the transport layer completes when it picks the egress interface; the
/// branch is what matters to the transaction layer.
pub fn make_via(branch: &str) -> Header {
    Header::Via(format!("SIP/2.0/UDP 0.0.0.0;branch={}", branch).into())
}

/// Stamp the capability headers the profile is willing to advertise
/// (RFC 3261 section 20: Allow, Accept-Encoding, Accept-Language,
/// Allow-Events, Supported), valued from the master profile.
pub fn add_capabilities(
    headers: &mut rsip::Headers,
    master: &crate::profile::MasterProfile,
    profile: &crate::profile::UserProfile,
) {
    use crate::profile::AdvertisedCapability;

    if profile.advertises(AdvertisedCapability::Allow) {
        headers.unique_push(Header::Allow(master.allowed_methods_value().into()));
    }
    if profile.advertises(AdvertisedCapability::AcceptEncoding) {
        headers.unique_push(Header::AcceptEncoding(
            master.supported_encodings_value().into(),
        ));
    }
    if profile.advertises(AdvertisedCapability::AcceptLanguage) {
        headers.unique_push(Header::AcceptLanguage(
            master.supported_languages_value().into(),
        ));
    }
    if profile.advertises(AdvertisedCapability::AllowEvents) {
        headers.unique_push(Header::Other(
            "Allow-Events".into(),
            master.allowed_events_value(),
        ));
    }
    if profile.advertises(AdvertisedCapability::Supported) {
        headers.unique_push(Header::Supported(
            master.supported_option_tags_value().into(),
        ));
    }
}

/// Method a response answers, read from its CSeq.
pub fn response_method(response: &rsip::Response) -> Option<rsip::Method> {
    crate::rsip_ext::cseq_of(response).map(|(_, method)| method)
}

/// The AOR of a request: its Request-URI without parameters or headers.
pub fn request_aor(request: &rsip::Request) -> String {
    let mut uri = request.uri.clone();
    uri.params.clear();
    uri.headers.clear();
    uri.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::prelude::UntypedHeader;

    fn request() -> rsip::Request {
        rsip::Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            version: rsip::Version::V2,
            headers: vec![
                Header::Via("SIP/2.0/UDP client.example.com;branch=z9hG4bK74bf9".into()),
                Header::From("<sip:alice@example.com>;tag=9fxced76sl".into()),
                Header::To("<sip:bob@example.com>".into()),
                Header::CallId("3848276298220188511@client.example.com".into()),
                Header::CSeq("1 INVITE".into()),
                Header::MaxForwards(70.into()),
            ]
            .into(),
            body: Vec::new(),
        }
    }

    #[test]
    fn response_echoes_request_identity() {
        let req = request();
        let resp = make_response(&req, rsip::StatusCode::OK, Some("totag1"));
        assert_eq!(
            resp.from_header().unwrap().value(),
            req.from_header().unwrap().value()
        );
        assert_eq!(
            resp.call_id_header().unwrap().value(),
            req.call_id_header().unwrap().value()
        );
        assert_eq!(
            resp.cseq_header().unwrap().value(),
            req.cseq_header().unwrap().value()
        );
        assert_eq!(
            resp.via_header().unwrap().value(),
            req.via_header().unwrap().value()
        );
    }

    #[test]
    fn non_provisional_response_gains_a_to_tag() {
        let req = request();
        let resp = make_response(&req, rsip::StatusCode::OK, Some("totag1"));
        assert_eq!(crate::rsip_ext::to_tag(&resp), Some("totag1".to_string()));
    }

    #[test]
    fn trying_keeps_the_bare_to() {
        let req = request();
        let resp = make_response(&req, rsip::StatusCode::Trying, Some("totag1"));
        assert_eq!(crate::rsip_ext::to_tag(&resp), None);
    }

    #[test]
    fn existing_to_tag_is_preserved() {
        let mut req = request();
        req.headers.retain(|h| !matches!(h, Header::To(_)));
        req.headers
            .push(Header::To("<sip:bob@example.com>;tag=already".into()));
        let resp = make_response(&req, rsip::StatusCode::OK, Some("other"));
        assert_eq!(crate::rsip_ext::to_tag(&resp), Some("already".to_string()));
    }
}
