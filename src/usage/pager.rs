//! Pager-message usages (RFC 3428 MESSAGE).

/// Outbound pager conversation: MESSAGE requests queued on one dialog set
/// so they share Call-ID and From tag.
#[derive(Debug, Clone)]
pub struct ClientPagerMessage {
    pub serial: u64,
    /// Pages handed over while an earlier one is still in flight.
    pub queued: Vec<(String, Vec<u8>)>,
    pub in_flight: bool,
}

impl ClientPagerMessage {
    pub fn new(serial: u64) -> Self {
        ClientPagerMessage {
            serial,
            queued: Vec::new(),
            in_flight: false,
        }
    }

    /// Queue a page body; returns true when it can go out immediately.
    pub fn page(&mut self, content_type: impl Into<String>, body: Vec<u8>) -> bool {
        if self.in_flight {
            self.queued.push((content_type.into(), body));
            false
        } else {
            self.in_flight = true;
            self.queued.insert(0, (content_type.into(), body));
            true
        }
    }

    /// A final answer arrived; pop the completed page and report whether
    /// another one is waiting.
    pub fn on_final_response(&mut self) -> bool {
        if !self.queued.is_empty() {
            self.queued.remove(0);
        }
        self.in_flight = !self.queued.is_empty();
        self.in_flight
    }
}

/// A MESSAGE a peer sent us; exists for the duration of one transaction.
#[derive(Debug, Clone)]
pub struct ServerPagerMessage {
    pub serial: u64,
}

impl ServerPagerMessage {
    pub fn new(serial: u64) -> Self {
        ServerPagerMessage { serial }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_queue_behind_an_in_flight_one() {
        let mut pager = ClientPagerMessage::new(1);
        assert!(pager.page("text/plain", b"hi".to_vec()));
        assert!(!pager.page("text/plain", b"again".to_vec()));
        assert!(pager.on_final_response());
        assert!(!pager.on_final_response());
    }
}
