//! Per-identity configuration consulted on every outgoing message.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::events::FlowTuple;
use crate::handlers::MessageDecorator;

/// Capability headers a profile is willing to advertise on requests and
/// responses it originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertisedCapability {
    Allow,
    AcceptEncoding,
    AcceptLanguage,
    AllowEvents,
    Supported,
}

/// Options for one local identity.
///
/// A dialog set references exactly one profile for its lifetime. The
/// builder-style `with_*` methods cover construction; `set_*` mutators
/// exist where the value changes at runtime (service route learned from a
/// registrar, client-outbound flow established by the stack).
#[derive(Clone)]
pub struct UserProfile {
    default_from: Option<String>,
    user_agent: Option<String>,
    anonymous: bool,
    proxy_requires: Vec<String>,
    outbound_proxy: Option<rsip::Uri>,
    force_outbound_proxy_on_all_requests: bool,
    express_outbound_as_route_set: bool,
    rport_enabled: bool,
    fixed_transport_port: Option<u16>,
    fixed_transport_interface: Option<String>,
    client_outbound_enabled: bool,
    client_outbound_flow_tuple: Option<FlowTuple>,
    service_route: Vec<rsip::Uri>,
    default_subscription_time: u32,
    default_registration_time: u32,
    advertised_capabilities: HashSet<AdvertisedCapability>,
    outbound_decorator: Option<Arc<dyn MessageDecorator>>,
}

impl fmt::Debug for UserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserProfile")
            .field("default_from", &self.default_from)
            .field("user_agent", &self.user_agent)
            .field("anonymous", &self.anonymous)
            .field("proxy_requires", &self.proxy_requires)
            .field("outbound_proxy", &self.outbound_proxy)
            .field(
                "force_outbound_proxy_on_all_requests",
                &self.force_outbound_proxy_on_all_requests,
            )
            .field(
                "express_outbound_as_route_set",
                &self.express_outbound_as_route_set,
            )
            .field("rport_enabled", &self.rport_enabled)
            .field("fixed_transport_port", &self.fixed_transport_port)
            .field("fixed_transport_interface", &self.fixed_transport_interface)
            .field("client_outbound_enabled", &self.client_outbound_enabled)
            .field(
                "client_outbound_flow_tuple",
                &self.client_outbound_flow_tuple,
            )
            .field("service_route", &self.service_route)
            .field("default_subscription_time", &self.default_subscription_time)
            .field("default_registration_time", &self.default_registration_time)
            .field("advertised_capabilities", &self.advertised_capabilities)
            .field("outbound_decorator", &self.outbound_decorator.is_some())
            .finish()
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        UserProfile {
            default_from: None,
            user_agent: None,
            anonymous: false,
            proxy_requires: Vec::new(),
            outbound_proxy: None,
            force_outbound_proxy_on_all_requests: false,
            express_outbound_as_route_set: false,
            rport_enabled: true,
            fixed_transport_port: None,
            fixed_transport_interface: None,
            client_outbound_enabled: false,
            client_outbound_flow_tuple: None,
            service_route: Vec::new(),
            default_subscription_time: 3600,
            default_registration_time: 3600,
            advertised_capabilities: HashSet::new(),
            outbound_decorator: None,
        }
    }
}

impl UserProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_from(mut self, from: impl Into<String>) -> Self {
        self.default_from = Some(from.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn with_proxy_require(mut self, option_tag: impl Into<String>) -> Self {
        self.proxy_requires.push(option_tag.into());
        self
    }

    pub fn with_outbound_proxy(mut self, proxy: rsip::Uri) -> Self {
        self.outbound_proxy = Some(proxy);
        self
    }

    pub fn with_force_outbound_proxy_on_all_requests(mut self, force: bool) -> Self {
        self.force_outbound_proxy_on_all_requests = force;
        self
    }

    pub fn with_express_outbound_as_route_set(mut self, express: bool) -> Self {
        self.express_outbound_as_route_set = express;
        self
    }

    pub fn with_rport(mut self, enabled: bool) -> Self {
        self.rport_enabled = enabled;
        self
    }

    pub fn with_fixed_transport_port(mut self, port: u16) -> Self {
        self.fixed_transport_port = Some(port);
        self
    }

    pub fn with_fixed_transport_interface(mut self, interface: impl Into<String>) -> Self {
        self.fixed_transport_interface = Some(interface.into());
        self
    }

    pub fn with_client_outbound(mut self, enabled: bool) -> Self {
        self.client_outbound_enabled = enabled;
        self
    }

    pub fn with_default_subscription_time(mut self, seconds: u32) -> Self {
        self.default_subscription_time = seconds;
        self
    }

    pub fn with_default_registration_time(mut self, seconds: u32) -> Self {
        self.default_registration_time = seconds;
        self
    }

    pub fn with_advertised_capability(mut self, capability: AdvertisedCapability) -> Self {
        self.advertised_capabilities.insert(capability);
        self
    }

    pub fn with_outbound_decorator(mut self, decorator: Arc<dyn MessageDecorator>) -> Self {
        self.outbound_decorator = Some(decorator);
        self
    }

    pub fn default_from(&self) -> Option<&str> {
        self.default_from.as_deref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn proxy_requires(&self) -> &[String] {
        &self.proxy_requires
    }

    pub fn outbound_proxy(&self) -> Option<&rsip::Uri> {
        self.outbound_proxy.as_ref()
    }

    pub fn force_outbound_proxy_on_all_requests(&self) -> bool {
        self.force_outbound_proxy_on_all_requests
    }

    pub fn express_outbound_as_route_set(&self) -> bool {
        self.express_outbound_as_route_set
    }

    pub fn rport_enabled(&self) -> bool {
        self.rport_enabled
    }

    pub fn fixed_transport_port(&self) -> Option<u16> {
        self.fixed_transport_port
    }

    pub fn fixed_transport_interface(&self) -> Option<&str> {
        self.fixed_transport_interface.as_deref()
    }

    pub fn client_outbound_enabled(&self) -> bool {
        self.client_outbound_enabled
    }

    pub fn client_outbound_flow_tuple(&self) -> Option<&FlowTuple> {
        self.client_outbound_flow_tuple.as_ref()
    }

    pub fn set_client_outbound_flow_tuple(&mut self, flow: Option<FlowTuple>) {
        self.client_outbound_flow_tuple = flow;
    }

    pub fn service_route(&self) -> &[rsip::Uri] {
        &self.service_route
    }

    pub fn set_service_route(&mut self, route: Vec<rsip::Uri>) {
        self.service_route = route;
    }

    pub fn default_subscription_time(&self) -> u32 {
        self.default_subscription_time
    }

    pub fn default_registration_time(&self) -> u32 {
        self.default_registration_time
    }

    pub fn advertises(&self, capability: AdvertisedCapability) -> bool {
        self.advertised_capabilities.contains(&capability)
    }

    pub fn outbound_decorator(&self) -> Option<&Arc<dyn MessageDecorator>> {
        self.outbound_decorator.as_ref()
    }

    pub fn set_outbound_decorator(&mut self, decorator: Option<Arc<dyn MessageDecorator>>) {
        self.outbound_decorator = decorator;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_endpoint_conventions() {
        let profile = UserProfile::default();
        assert!(profile.rport_enabled());
        assert!(!profile.is_anonymous());
        assert_eq!(profile.default_registration_time(), 3600);
        assert!(!profile.advertises(AdvertisedCapability::Allow));
    }
}
