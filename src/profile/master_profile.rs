//! Endpoint-wide policy: what the UAS accepts and how strictly it checks.

use std::fmt;
use std::time::Duration;

use crate::profile::UserProfile;

/// MIME type/subtype pair used by the content and Accept validators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mime {
    type_: String,
    subtype: String,
}

impl Mime {
    pub fn new(type_: impl Into<String>, subtype: impl Into<String>) -> Self {
        Mime {
            type_: type_.into(),
            subtype: subtype.into(),
        }
    }

    /// Parse "application/sdp" style values, dropping any parameters.
    pub fn parse(value: &str) -> Option<Mime> {
        let value = value.split(';').next()?.trim();
        let (type_, subtype) = value.split_once('/')?;
        if type_.is_empty() || subtype.is_empty() {
            return None;
        }
        Some(Mime::new(type_.trim(), subtype.trim()))
    }

    pub fn matches(&self, other: &Mime) -> bool {
        self.type_.eq_ignore_ascii_case(&other.type_)
            && (self.subtype == "*" || self.subtype.eq_ignore_ascii_case(&other.subtype))
    }
}

impl fmt::Display for Mime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_, self.subtype)
    }
}

/// UAS policy for reliable provisional responses (RFC 3262).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableProvisionalMode {
    Never,
    Supported,
    SupportedEssential,
    Required,
}

/// Endpoint-wide profile: one [`UserProfile`] worth of identity defaults
/// plus the validation policy applied to every incoming request.
#[derive(Debug, Clone)]
pub struct MasterProfile {
    user_profile: UserProfile,
    supported_methods: Vec<rsip::Method>,
    supported_schemes: Vec<rsip::Scheme>,
    supported_option_tags: Vec<String>,
    supported_mime_types: Vec<(rsip::Method, Mime)>,
    supported_encodings: Vec<String>,
    supported_languages: Vec<String>,
    allowed_events: Vec<String>,
    uas_reliable_provisional_mode: ReliableProvisionalMode,
    validate_content_enabled: bool,
    validate_accept_enabled: bool,
    validate_content_language_enabled: bool,
    check_req_uri_in_merge_detection: bool,
    allow_bad_registration: bool,
    merge_window: Duration,
}

impl Default for MasterProfile {
    fn default() -> Self {
        use rsip::Method;
        let mut profile = MasterProfile {
            user_profile: UserProfile::default(),
            supported_methods: vec![
                Method::Invite,
                Method::Ack,
                Method::Cancel,
                Method::Options,
                Method::Bye,
            ],
            supported_schemes: vec![rsip::Scheme::Sip, rsip::Scheme::Sips],
            supported_option_tags: Vec::new(),
            supported_mime_types: Vec::new(),
            supported_encodings: Vec::new(),
            supported_languages: Vec::new(),
            allowed_events: Vec::new(),
            uas_reliable_provisional_mode: ReliableProvisionalMode::Supported,
            validate_content_enabled: true,
            validate_accept_enabled: false,
            validate_content_language_enabled: false,
            check_req_uri_in_merge_detection: false,
            allow_bad_registration: false,
            merge_window: Duration::from_secs(32),
        };
        for method in [Method::Invite, Method::Options, Method::PRack, Method::Update] {
            profile
                .supported_mime_types
                .push((method, Mime::new("application", "sdp")));
        }
        profile
    }
}

impl MasterProfile {
    pub fn new(user_profile: UserProfile) -> Self {
        MasterProfile {
            user_profile,
            ..Default::default()
        }
    }

    pub fn user_profile(&self) -> &UserProfile {
        &self.user_profile
    }

    pub fn user_profile_mut(&mut self) -> &mut UserProfile {
        &mut self.user_profile
    }

    pub fn add_supported_method(&mut self, method: rsip::Method) {
        if !self.supported_methods.contains(&method) {
            self.supported_methods.push(method);
        }
    }

    pub fn clear_supported_methods(&mut self) {
        self.supported_methods.clear();
    }

    pub fn is_method_supported(&self, method: &rsip::Method) -> bool {
        self.supported_methods.contains(method)
    }

    /// Value for an Allow header listing every supported method.
    pub fn allowed_methods_value(&self) -> String {
        self.supported_methods
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn add_supported_scheme(&mut self, scheme: rsip::Scheme) {
        if !self.supported_schemes.contains(&scheme) {
            self.supported_schemes.push(scheme);
        }
    }

    pub fn is_scheme_supported(&self, scheme: Option<&rsip::Scheme>) -> bool {
        // An absent scheme on a parsed URI means plain sip.
        match scheme {
            Some(scheme) => self.supported_schemes.contains(scheme),
            None => self.supported_schemes.contains(&rsip::Scheme::Sip),
        }
    }

    pub fn add_supported_option_tag(&mut self, tag: impl Into<String>) {
        self.supported_option_tags.push(tag.into());
    }

    /// Tokens of a Require header we do not support.
    pub fn unsupported_option_tags(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|tag| {
                !self
                    .supported_option_tags
                    .iter()
                    .any(|supported| supported.eq_ignore_ascii_case(tag))
            })
            .cloned()
            .collect()
    }

    pub fn supported_option_tags_value(&self) -> String {
        self.supported_option_tags.join(", ")
    }

    pub fn add_supported_mime_type(&mut self, method: rsip::Method, mime: Mime) {
        self.supported_mime_types.push((method, mime));
    }

    pub fn is_mime_type_supported(&self, method: &rsip::Method, mime: &Mime) -> bool {
        self.supported_mime_types
            .iter()
            .any(|(m, supported)| m == method && supported.matches(mime))
    }

    /// Value for an Accept header listing what we take for `method`.
    pub fn supported_mime_types_value(&self, method: &rsip::Method) -> String {
        self.supported_mime_types
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, mime)| mime.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn add_supported_encoding(&mut self, encoding: impl Into<String>) {
        self.supported_encodings.push(encoding.into());
    }

    pub fn is_encoding_supported(&self, encoding: &str) -> bool {
        self.supported_encodings
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(encoding))
    }

    pub fn supported_encodings_value(&self) -> String {
        self.supported_encodings.join(", ")
    }

    pub fn add_supported_language(&mut self, language: impl Into<String>) {
        self.supported_languages.push(language.into());
    }

    pub fn is_language_supported(&self, language: &str) -> bool {
        self.supported_languages
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(language))
    }

    pub fn supported_languages_value(&self) -> String {
        self.supported_languages.join(", ")
    }

    pub fn add_allowed_event(&mut self, event: impl Into<String>) {
        let event = event.into();
        if !self.allowed_events.contains(&event) {
            self.allowed_events.push(event);
        }
    }

    pub fn allowed_events(&self) -> &[String] {
        &self.allowed_events
    }

    pub fn allowed_events_value(&self) -> String {
        self.allowed_events.join(", ")
    }

    pub fn uas_reliable_provisional_mode(&self) -> ReliableProvisionalMode {
        self.uas_reliable_provisional_mode
    }

    pub fn set_uas_reliable_provisional_mode(&mut self, mode: ReliableProvisionalMode) {
        self.uas_reliable_provisional_mode = mode;
    }

    pub fn validate_content_enabled(&self) -> bool {
        self.validate_content_enabled
    }

    pub fn set_validate_content_enabled(&mut self, enabled: bool) {
        self.validate_content_enabled = enabled;
    }

    pub fn validate_accept_enabled(&self) -> bool {
        self.validate_accept_enabled
    }

    pub fn set_validate_accept_enabled(&mut self, enabled: bool) {
        self.validate_accept_enabled = enabled;
    }

    pub fn validate_content_language_enabled(&self) -> bool {
        self.validate_content_language_enabled
    }

    pub fn set_validate_content_language_enabled(&mut self, enabled: bool) {
        self.validate_content_language_enabled = enabled;
    }

    pub fn check_req_uri_in_merge_detection(&self) -> bool {
        self.check_req_uri_in_merge_detection
    }

    pub fn set_check_req_uri_in_merge_detection(&mut self, enabled: bool) {
        self.check_req_uri_in_merge_detection = enabled;
    }

    pub fn allow_bad_registration(&self) -> bool {
        self.allow_bad_registration
    }

    pub fn set_allow_bad_registration(&mut self, allowed: bool) {
        self.allow_bad_registration = allowed;
    }

    pub fn merge_window(&self) -> Duration {
        self.merge_window
    }

    pub fn set_merge_window(&mut self, window: Duration) {
        self.merge_window = window;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_methods_cover_basic_calls() {
        let profile = MasterProfile::default();
        assert!(profile.is_method_supported(&rsip::Method::Invite));
        assert!(!profile.is_method_supported(&rsip::Method::Subscribe));
        assert!(profile.allowed_methods_value().contains("INVITE"));
    }

    #[test]
    fn mime_matching_ignores_case_and_supports_wildcard_subtype() {
        let sdp = Mime::new("application", "sdp");
        assert!(sdp.matches(&Mime::new("Application", "SDP")));
        assert!(Mime::new("text", "*").matches(&Mime::new("text", "plain")));
        assert!(!sdp.matches(&Mime::new("text", "plain")));
    }

    #[test]
    fn mime_parse_drops_parameters() {
        assert_eq!(
            Mime::parse("application/sdp;charset=utf-8"),
            Some(Mime::new("application", "sdp"))
        );
        assert_eq!(Mime::parse("garbage"), None);
    }

    #[test]
    fn unsupported_option_tags_filters_known_ones() {
        let mut profile = MasterProfile::default();
        profile.add_supported_option_tag("100rel");
        let unsupported =
            profile.unsupported_option_tags(&["100rel".to_string(), "timer".to_string()]);
        assert_eq!(unsupported, vec!["timer".to_string()]);
    }

    #[test]
    fn absent_scheme_counts_as_sip() {
        let profile = MasterProfile::default();
        assert!(profile.is_scheme_supported(None));
        assert!(!profile.is_scheme_supported(Some(&rsip::Scheme::Other("http".into()))));
    }
}
