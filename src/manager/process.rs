//! The FIFO drain loop and top-level event classification.

use std::time::Duration;

use tracing::{debug, error, info};

use crate::dialog::DialogSetId;
use crate::events::{DestroyTarget, DumCommand, DumEvent, DumTimeout, FlowTuple, TimeoutKind};
use crate::manager::shutdown::ShutdownState;
use crate::manager::DialogUsageManager;
use crate::usage::{SubscriptionState, UsageKind};

impl DialogUsageManager {
    /// Wait up to `timeout` (forever with `None`) for one event and
    /// handle it. Returns true when an event was processed.
    pub async fn process(&mut self, timeout: Option<Duration>) -> bool {
        let event = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.fifo.recv())
                .await
                .ok()
                .flatten(),
            None => self.fifo.recv().await,
        };
        match event {
            Some(event) => {
                self.internal_process(event);
                true
            }
            None => false,
        }
    }

    /// Handle one queued event without waiting. Returns true when an
    /// event was processed.
    pub fn try_process(&mut self) -> bool {
        match self.fifo.try_recv() {
            Ok(event) => {
                self.internal_process(event);
                true
            }
            Err(_) => false,
        }
    }

    /// Drain everything currently queued. Returns how many events were
    /// handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while self.try_process() {
            handled += 1;
        }
        handled
    }

    /// Classification order mirrors the FIFO contract: lifecycle
    /// acknowledgements and commands ahead of SIP traffic, SIP traffic
    /// last.
    pub(crate) fn internal_process(&mut self, event: DumEvent) {
        // One logical worker owns this manager; catch strays early in
        // debug builds.
        let current = std::thread::current().id();
        match self.worker_thread {
            None => self.worker_thread = Some(current),
            Some(owner) => debug_assert_eq!(owner, current, "internal_process crossed threads"),
        }

        // After the stack's shutdown acknowledgement nothing else runs.
        if self.shutdown_state() == ShutdownState::Shutdown {
            return;
        }

        match event {
            DumEvent::TransactionUserRemoved => self.on_transaction_user_removed(),
            DumEvent::KeepAlivePong { flow } => {
                if let Some(keep_alive) = &mut self.keep_alive {
                    keep_alive.received_pong(&flow);
                }
            }
            DumEvent::DestroyUsage(target) => self.destroy_now(target),
            DumEvent::Timeout(timeout) => self.deliver_timeout(timeout),
            DumEvent::KeepAliveTimeout { flow } => {
                if let Some(keep_alive) = &mut self.keep_alive {
                    keep_alive.on_keep_alive_timeout(&flow);
                }
            }
            DumEvent::KeepAlivePongTimeout { flow } => {
                if let Some(keep_alive) = &mut self.keep_alive {
                    keep_alive.on_pong_timeout(&flow);
                }
            }
            DumEvent::ConnectionTerminated { flow } => self.on_connection_terminated(flow),
            DumEvent::Command(command) => match command {
                DumCommand::RemoveMergedRequest(key) => self.remove_merged_request(&key),
                DumCommand::Send(message) => match message {
                    rsip::SipMessage::Request(request) => {
                        if let Err(err) = self.send_request_now(request) {
                            info!("queued send failed: {}", err);
                        }
                    }
                    rsip::SipMessage::Response(response) => self.send_response(response),
                },
                DumCommand::App(command) => command(self),
            },
            DumEvent::External(message) => {
                let mut handled = false;
                for handler in &self.external_handlers {
                    handler.on_message(message.as_ref(), &mut handled);
                    if handled {
                        break;
                    }
                }
            }
            DumEvent::Sip(message) => {
                // A panicking handler callback must not take the whole
                // manager down; the offending message is discarded.
                let dispatch = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    self.incoming_process(message)
                }));
                if dispatch.is_err() {
                    error!("dispatch panicked; discarding the offending message");
                }
            }
        }
    }

    /// A transport flow died. Dialog sets riding it via client outbound
    /// are notified, client registrations first so re-registration starts
    /// before anything else reacts.
    fn on_connection_terminated(&mut self, flow: FlowTuple) {
        info!("connection terminated: {}", flow);

        let mut to_notify: Vec<DialogSetId> = Vec::new();
        for ds in self.dialog_sets.values() {
            let profile = ds.user_profile();
            let rides_flow = profile.client_outbound_enabled()
                && profile
                    .client_outbound_flow_tuple()
                    .map(|t| t.matches(&flow))
                    .unwrap_or(false);
            if rides_flow {
                if ds.client_registration.is_some() {
                    to_notify.insert(0, ds.id().clone());
                } else {
                    to_notify.push(ds.id().clone());
                }
            }
        }
        for id in to_notify {
            if let Some(ds) = self.dialog_sets.get(&id) {
                ds.flow_terminated(&self.handlers);
            }
        }

        for listener in &self.connection_terminated_listeners {
            listener.on_connection_terminated(&flow);
        }
    }

    /// Hand a fired timer to its usage; a dead handle swallows it.
    fn deliver_timeout(&mut self, timeout: DumTimeout) {
        if !self.is_handle_valid(&timeout.target) {
            debug!("timeout {:?} for a dead usage, dropping", timeout.kind);
            return;
        }

        match (timeout.kind, timeout.target.id.kind) {
            (TimeoutKind::SubscriptionExpiration, UsageKind::ClientSubscription)
            | (TimeoutKind::SubscriptionExpiration, UsageKind::ServerSubscription) => {
                let handle = timeout.target.clone();
                let expired = handle
                    .id
                    .dialog
                    .as_ref()
                    .zip(handle.id.key.as_deref())
                    .and_then(|(dialog_id, event)| {
                        let ds = self.dialog_sets.get_mut(dialog_id.set_id())?;
                        let dialog = ds.find_dialog_mut(dialog_id)?;
                        let sub = dialog
                            .client_subscriptions
                            .iter_mut()
                            .find(|s| s.event == event)
                            .map(|s| &mut s.state)
                            .or_else(|| {
                                dialog
                                    .server_subscriptions
                                    .iter_mut()
                                    .find(|s| s.event == event)
                                    .map(|s| &mut s.state)
                            })?;
                        *sub = SubscriptionState::Terminated;
                        Some(())
                    })
                    .is_some();
                if expired {
                    info!("subscription expired: {}", handle);
                    self.destroy_now(DestroyTarget::Usage(handle));
                }
            }
            (kind, _) => {
                // Refresh-style timers are the application's cue; the
                // usage state itself does not change.
                debug!("timer {:?} fired for {}", kind, timeout.target);
            }
        }
    }
}
