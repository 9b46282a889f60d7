//! The shutdown state machine.
//!
//! ```text
//! Running --shutdown()--> ShutdownRequested --all handles gone-->
//!   RemovingTransactionUser --stack ack--> Shutdown --drop--> Destroying
//! ```
//!
//! `force_shutdown` skips the wait for handles. The state only ever
//! advances; repeated `shutdown()` calls are tolerated and the completion
//! callback fires at most once.

use std::sync::Arc;

use tracing::{info, warn};

use crate::handlers::DumShutdownHandler;
use crate::manager::DialogUsageManager;

/// Where the manager is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    ShutdownRequested,
    RemovingTransactionUser,
    Shutdown,
    Destroying,
}

impl DialogUsageManager {
    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown_state
    }

    /// The state machine only moves forward; a repeated `shutdown()` call
    /// cannot drag it backwards.
    pub(crate) fn advance_shutdown(&mut self, next: ShutdownState) {
        if self.shutdown_state < next {
            self.shutdown_state = next;
        }
    }

    /// Orderly shutdown: refuse new work, wait for existing usages to
    /// drain, then unregister from the stack. `handler` hears about
    /// completion exactly once.
    pub fn shutdown(&mut self, handler: Arc<dyn DumShutdownHandler>) {
        info!("shutdown requested: dialog_sets={}", self.dialog_set_count());
        self.shutdown_handler = Some(handler);
        self.advance_shutdown(ShutdownState::ShutdownRequested);
        self.stack().request_transaction_user_shutdown();
        self.shutdown_when_empty();
    }

    /// Immediate shutdown: do not wait for usages.
    pub fn force_shutdown(&mut self, handler: Arc<dyn DumShutdownHandler>) {
        warn!("forced shutdown with {} dialog sets", self.dialog_set_count());
        self.shutdown_handler = Some(handler);
        self.advance_shutdown(ShutdownState::ShutdownRequested);
        self.on_all_handles_destroyed();
    }

    /// Every application-visible handle is gone; time to leave the stack.
    pub(crate) fn on_all_handles_destroyed(&mut self) {
        if self.shutdown_handler.is_some()
            && self.shutdown_state == ShutdownState::ShutdownRequested
        {
            info!("all handles destroyed, removing transaction user");
            self.advance_shutdown(ShutdownState::RemovingTransactionUser);
            self.stack().unregister_transaction_user();
        }
    }

    /// Progress shutdown when the last dialog set or publication died.
    pub(crate) fn shutdown_when_empty(&mut self) {
        if self.dialog_set_count() == 0 && self.server_publication_count() == 0 {
            self.on_all_handles_destroyed();
        }
    }

    /// The stack acknowledged our deregistration.
    pub(crate) fn on_transaction_user_removed(&mut self) {
        info!("transaction user removed by stack");
        debug_assert_eq!(self.shutdown_state, ShutdownState::RemovingTransactionUser);
        self.advance_shutdown(ShutdownState::Shutdown);
        if let Some(handler) = self.shutdown_handler.take() {
            handler.on_dum_can_be_deleted();
        }
    }
}
