//! Keep-alive bookkeeping for RFC 5626 flows.
//!
//! The stack owns the sockets and actually emits the CRLF pings; this
//! manager tracks which flows want keeping alive, at what cadence, and
//! whether a solicited pong is overdue. Timer events and pongs are routed
//! here by the dispatcher.

use std::time::Duration;

use tracing::{debug, warn};

use crate::events::FlowTuple;

struct NetworkAssociation {
    flow: FlowTuple,
    interval: Duration,
    pong_outstanding: bool,
}

/// Tracks keep-alive state per flow.
#[derive(Default)]
pub struct KeepAliveManager {
    associations: Vec<NetworkAssociation>,
}

impl KeepAliveManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_flow(&mut self, flow: FlowTuple, interval: Duration) {
        if self.find(&flow).is_none() {
            debug!("keepalive tracking {} every {:?}", flow, interval);
            self.associations.push(NetworkAssociation {
                flow,
                interval,
                pong_outstanding: false,
            });
        }
    }

    pub fn remove_flow(&mut self, flow: &FlowTuple) {
        self.associations.retain(|a| !a.flow.matches(flow));
    }

    pub fn interval_for(&self, flow: &FlowTuple) -> Option<Duration> {
        self.find(flow).map(|a| a.interval)
    }

    /// A pong arrived; the flow is alive.
    pub fn received_pong(&mut self, flow: &FlowTuple) {
        if let Some(association) = self.find_mut(flow) {
            debug!("keepalive pong on {}", flow);
            association.pong_outstanding = false;
        }
    }

    /// The send timer fired. Returns true when a ping should go out (and
    /// the timer be re-armed); false when the flow is no longer tracked.
    pub fn on_keep_alive_timeout(&mut self, flow: &FlowTuple) -> bool {
        match self.find_mut(flow) {
            Some(association) => {
                association.pong_outstanding = true;
                true
            }
            None => false,
        }
    }

    /// The pong-wait timer fired. Returns true when the flow should be
    /// treated as dead (pong never came back).
    pub fn on_pong_timeout(&mut self, flow: &FlowTuple) -> bool {
        let dead = self
            .find(flow)
            .map(|a| a.pong_outstanding)
            .unwrap_or(false);
        if dead {
            warn!("keepalive pong overdue on {}, flow presumed dead", flow);
            self.remove_flow(flow);
        }
        dead
    }

    fn find(&self, flow: &FlowTuple) -> Option<&NetworkAssociation> {
        self.associations.iter().find(|a| a.flow.matches(flow))
    }

    fn find_mut(&mut self, flow: &FlowTuple) -> Option<&mut NetworkAssociation> {
        self.associations.iter_mut().find(|a| a.flow.matches(flow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowTuple {
        FlowTuple {
            transport: rsip::Transport::Tcp,
            remote: "192.0.2.9:5060".parse().unwrap(),
            flow_key: 42,
        }
    }

    #[test]
    fn pong_clears_the_outstanding_flag() {
        let mut manager = KeepAliveManager::new();
        manager.add_flow(flow(), Duration::from_secs(30));
        assert!(manager.on_keep_alive_timeout(&flow()));
        manager.received_pong(&flow());
        assert!(!manager.on_pong_timeout(&flow()));
    }

    #[test]
    fn missing_pong_kills_the_flow() {
        let mut manager = KeepAliveManager::new();
        manager.add_flow(flow(), Duration::from_secs(30));
        assert!(manager.on_keep_alive_timeout(&flow()));
        assert!(manager.on_pong_timeout(&flow()));
        assert!(!manager.on_keep_alive_timeout(&flow()));
    }
}
