//! Client and server subscription usages (RFC 6665).

use crate::usage::EndReason;

/// RFC 6665 subscription state as carried in Subscription-State headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Terminated,
}

impl SubscriptionState {
    /// Parse the leading token of a Subscription-State header value.
    pub fn parse(value: &str) -> Option<SubscriptionState> {
        match value
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "pending" => Some(SubscriptionState::Pending),
            "active" => Some(SubscriptionState::Active),
            "terminated" => Some(SubscriptionState::Terminated),
            _ => None,
        }
    }
}

/// Subscription we created with an outgoing SUBSCRIBE (or REFER's implicit
/// subscription).
#[derive(Debug, Clone)]
pub struct ClientSubscription {
    pub serial: u64,
    pub event: String,
    pub id_param: Option<String>,
    pub state: SubscriptionState,
    pub expires: u32,
}

impl ClientSubscription {
    pub fn new(serial: u64, event: impl Into<String>, expires: u32) -> Self {
        ClientSubscription {
            serial,
            event: event.into(),
            id_param: None,
            state: SubscriptionState::Pending,
            expires,
        }
    }

    /// Apply an incoming NOTIFY's Subscription-State. Returns true when
    /// the subscription terminated with this NOTIFY.
    pub fn on_notify(&mut self, subscription_state: Option<&str>) -> bool {
        if let Some(state) = subscription_state.and_then(SubscriptionState::parse) {
            self.state = state;
        }
        self.state == SubscriptionState::Terminated
    }

    pub fn end(&mut self, _reason: EndReason) {
        self.state = SubscriptionState::Terminated;
    }
}

/// Subscription a peer created with an incoming SUBSCRIBE or REFER.
#[derive(Debug, Clone)]
pub struct ServerSubscription {
    pub serial: u64,
    pub event: String,
    pub id_param: Option<String>,
    pub state: SubscriptionState,
    pub expires: u32,
}

impl ServerSubscription {
    pub fn new(serial: u64, event: impl Into<String>, expires: u32) -> Self {
        ServerSubscription {
            serial,
            event: event.into(),
            id_param: None,
            state: SubscriptionState::Pending,
            expires,
        }
    }

    pub fn set_subscription_state(&mut self, state: SubscriptionState) {
        self.state = state;
    }

    /// Subscription-State header value for an outgoing NOTIFY.
    pub fn subscription_state_value(&self) -> String {
        match self.state {
            SubscriptionState::Pending => format!("pending;expires={}", self.expires),
            SubscriptionState::Active => format!("active;expires={}", self.expires),
            SubscriptionState::Terminated => "terminated;reason=noresource".to_string(),
        }
    }

    pub fn end(&mut self, reason: EndReason) {
        let _ = reason;
        self.state = SubscriptionState::Terminated;
    }
}
