//! Registration usages (RFC 3261 section 10, RFC 5626 client outbound).

/// Client registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Adding,
    Registered,
    Removing,
    Unregistered,
}

/// Binding we maintain at a registrar with outgoing REGISTER requests.
///
/// When the registration rides an RFC 5626 client-outbound flow, a
/// terminated connection invalidates the binding; the manager notifies
/// these usages ahead of everything else on the same flow so the
/// application can re-register first.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub serial: u64,
    pub aor: String,
    pub state: RegistrationState,
    pub expires: u32,
}

impl ClientRegistration {
    pub fn new(serial: u64, aor: impl Into<String>, expires: u32) -> Self {
        ClientRegistration {
            serial,
            aor: aor.into(),
            state: RegistrationState::Adding,
            expires,
        }
    }

    pub fn on_status(&mut self, status: u16) {
        match (self.state, status) {
            (RegistrationState::Adding, 200..=299) => self.state = RegistrationState::Registered,
            (RegistrationState::Removing, 200..=299) => {
                self.state = RegistrationState::Unregistered
            }
            (_, 300..=699) => self.state = RegistrationState::Unregistered,
            _ => {}
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }
}

/// A REGISTER received from a peer, surfaced to the server registration
/// handler. The binding store itself is behind the registration
/// persistence manager; this usage only carries the request context.
#[derive(Debug, Clone)]
pub struct ServerRegistration {
    pub serial: u64,
    pub aor: String,
}

impl ServerRegistration {
    pub fn new(serial: u64, aor: impl Into<String>) -> Self {
        ServerRegistration {
            serial,
            aor: aor.into(),
        }
    }
}
