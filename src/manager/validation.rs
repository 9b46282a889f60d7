//! Request validation (RFC 3261 sections 8.2.1 through 8.2.3).
//!
//! Each validator either passes or answers on the wire with the mandated
//! status code and returns false, short-circuiting the pipeline. The
//! optional request-validation handler observes every rejection.

use std::sync::Arc;

use tracing::info;

use rsip::Header;

use crate::manager::DialogUsageManager;
use crate::profile::Mime;
use crate::rsip_ext;
use crate::util;

impl DialogUsageManager {
    /// RFC 3261 8.2.1 (method) and 8.2.2 (Request-URI scheme).
    pub(crate) fn validate_request_uri(&mut self, request: &rsip::Request) -> bool {
        let Ok(master) = self.master_profile().map(Arc::clone) else {
            return false;
        };

        if !master.is_method_supported(&request.method) {
            info!("unsupported method {}, answering 405", request.method);
            let mut response = util::make_response(
                request,
                rsip::StatusCode::MethodNotAllowed,
                Some(&rsip_ext::make_tag()),
            );
            response
                .headers
                .push(Header::Allow(master.allowed_methods_value().into()));
            self.send_response(response);
            if let Some(handler) = &self.handlers.request_validation {
                handler.on_invalid_method(request);
            }
            return false;
        }

        if !master.is_scheme_supported(request.uri.scheme.as_ref()) {
            info!("unsupported scheme on {}, answering 416", request.uri);
            let response = util::make_response(
                request,
                rsip::StatusCode::UnsupportedUriScheme,
                Some(&rsip_ext::make_tag()),
            );
            self.send_response(response);
            if let Some(handler) = &self.handlers.request_validation {
                handler.on_invalid_scheme(request);
            }
            return false;
        }

        true
    }

    /// RFC 3261 8.2.2: every Require tag must be supported.
    pub(crate) fn validate_required_options(&mut self, request: &rsip::Request) -> bool {
        let Ok(master) = self.master_profile().map(Arc::clone) else {
            return false;
        };

        let required = rsip_ext::header_tokens(&request.headers, "Require");
        if required.is_empty() {
            return true;
        }
        let unsupported = master.unsupported_option_tags(&required);
        if unsupported.is_empty() {
            return true;
        }

        info!("unsupported option tags {:?}, answering 420", unsupported);
        let mut response = util::make_response(
            request,
            rsip::StatusCode::BadExtension,
            Some(&rsip_ext::make_tag()),
        );
        response
            .headers
            .push(Header::Unsupported(unsupported.join(", ").into()));
        self.send_response(response);
        if let Some(handler) = &self.handlers.request_validation {
            handler.on_invalid_required_options(request);
        }
        false
    }

    /// RFC 3262: when this UAS requires reliable provisionals, the INVITE
    /// must offer or require 100rel.
    pub(crate) fn validate_100rel_support(&mut self, request: &rsip::Request) -> bool {
        use crate::profile::ReliableProvisionalMode;

        if request.method != rsip::Method::Invite {
            return true;
        }
        let Ok(master) = self.master_profile().map(Arc::clone) else {
            return false;
        };
        if master.uas_reliable_provisional_mode() != ReliableProvisionalMode::Required {
            return true;
        }

        let offered = rsip_ext::header_tokens(&request.headers, "Require")
            .iter()
            .chain(rsip_ext::header_tokens(&request.headers, "Supported").iter())
            .any(|tag| tag.eq_ignore_ascii_case("100rel"));
        if offered {
            return true;
        }

        info!("peer does not support 100rel, answering 421");
        let mut response = util::make_response(
            request,
            rsip::StatusCode::ExtensionRequired,
            Some(&rsip_ext::make_tag()),
        );
        response.headers.push(Header::Require("100rel".into()));
        self.send_response(response);
        if let Some(handler) = &self.handlers.request_validation {
            handler.on_100rel_not_supported_by_remote(request);
        }
        false
    }

    /// RFC 3261 8.2.3: Content-Type, Content-Encoding and (optionally)
    /// Content-Language must be understood, unless the content is marked
    /// optional.
    pub(crate) fn validate_content(&mut self, request: &rsip::Request) -> bool {
        let Ok(master) = self.master_profile().map(Arc::clone) else {
            return false;
        };

        let disposition_optional = rsip_ext::header_value(&request.headers, "Content-Disposition")
            .map(|v| {
                v.split(';').any(|p| {
                    p.trim()
                        .to_ascii_lowercase()
                        .replace(' ', "")
                        .starts_with("handling=optional")
                })
            })
            .unwrap_or(false);
        if disposition_optional {
            return true;
        }

        if let Some(content_type) = rsip_ext::header_value(&request.headers, "Content-Type") {
            let supported = Mime::parse(&content_type)
                .map(|mime| master.is_mime_type_supported(&request.method, &mime))
                .unwrap_or(false);
            if !supported {
                info!("unsupported content type '{}', answering 415", content_type);
                let mut response = util::make_response(
                    request,
                    rsip::StatusCode::UnsupportedMediaType,
                    Some(&rsip_ext::make_tag()),
                );
                response.headers.push(Header::Accept(
                    master.supported_mime_types_value(&request.method).into(),
                ));
                self.send_response(response);
                if let Some(handler) = &self.handlers.request_validation {
                    handler.on_invalid_content_type(request);
                }
                return false;
            }
        }

        if let Some(encoding) = rsip_ext::header_value(&request.headers, "Content-Encoding") {
            if !master.is_encoding_supported(encoding.trim()) {
                info!("unsupported content encoding '{}', answering 415", encoding);
                let mut response = util::make_response(
                    request,
                    rsip::StatusCode::UnsupportedMediaType,
                    Some(&rsip_ext::make_tag()),
                );
                response.headers.push(Header::AcceptEncoding(
                    master.supported_encodings_value().into(),
                ));
                self.send_response(response);
                if let Some(handler) = &self.handlers.request_validation {
                    handler.on_invalid_content_encoding(request);
                }
                return false;
            }
        }

        if master.validate_content_language_enabled() {
            let languages = rsip_ext::header_tokens(&request.headers, "Content-Language");
            if !languages.is_empty()
                && !languages.iter().any(|l| master.is_language_supported(l))
            {
                info!("unsupported content language, answering 415");
                let mut response = util::make_response(
                    request,
                    rsip::StatusCode::UnsupportedMediaType,
                    Some(&rsip_ext::make_tag()),
                );
                response.headers.push(Header::AcceptLanguage(
                    master.supported_languages_value().into(),
                ));
                self.send_response(response);
                if let Some(handler) = &self.handlers.request_validation {
                    handler.on_invalid_content_language(request);
                }
                return false;
            }
        }

        true
    }

    /// Accept-header check: at least one advertised type must be one we
    /// can produce; an absent Accept implies application/sdp for the
    /// offer/answer methods.
    pub(crate) fn validate_accept(&mut self, request: &rsip::Request) -> bool {
        use rsip::Method;

        let Ok(master) = self.master_profile().map(Arc::clone) else {
            return false;
        };

        let accepted = rsip_ext::header_tokens(&request.headers, "Accept");
        if !accepted.is_empty() {
            let any_supported = accepted
                .iter()
                .filter_map(|token| Mime::parse(token))
                .any(|mime| master.is_mime_type_supported(&request.method, &mime));
            if any_supported {
                return true;
            }
        } else if matches!(
            request.method,
            Method::Invite | Method::Options | Method::PRack | Method::Update
        ) {
            if master.is_mime_type_supported(&request.method, &Mime::new("application", "sdp")) {
                return true;
            }
        } else {
            return true;
        }

        info!("no acceptable mime type in Accept, answering 406");
        let mut response = util::make_response(
            request,
            rsip::StatusCode::NotAcceptable,
            Some(&rsip_ext::make_tag()),
        );
        response.headers.push(Header::Accept(
            master.supported_mime_types_value(&request.method).into(),
        ));
        self.send_response(response);
        if let Some(handler) = &self.handlers.request_validation {
            handler.on_invalid_accept(request);
        }
        false
    }
}
