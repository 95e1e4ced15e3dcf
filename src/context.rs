//! `EngineContext`: the single mutable-state value threaded by exclusive
//! reference through every operation (§9 Design Notes — no ambient
//! singletons). Owns the timing counters, the session's 14a
//! configuration and derived polling profile, and the cooperative
//! cancellation flag; current decoders and the send buffer are local to
//! whichever component (C4/C5/C6) is mid-operation rather than living
//! here, since exactly one of them writes at a time (§5).

use crate::config::{EngineOptions, Hf14aConfig};
use crate::timing::TimingController;
use crate::types::PollingProfile;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation token: cheap to clone, observed at the
/// checkpoints the concurrency model specifies (nibble boundaries,
/// between protocol steps, roughly every 12000 polls in a tight loop).
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    /// A fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; observed by the next checkpoint.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The engine's session-scoped mutable state.
#[derive(Debug, Clone)]
pub struct EngineContext {
    /// Sub-carrier-cycle clock arithmetic and transmit alignment (C3).
    pub timing: TimingController,
    /// `hf14a_config_t` equivalent: anticollision/BCC/cascade/RATS
    /// overrides and the magsafe/annotation polling additions.
    pub config: Hf14aConfig,
    /// Timeouts, nonce-capture and trigger-mode knobs.
    pub options: EngineOptions,
    /// Derived from `config` by `refresh_polling_profile`; cached so
    /// callers don't rebuild it on every poll iteration.
    pub polling: PollingProfile,
    /// Cooperative cancellation, shared with whatever drives the CLI/tests.
    pub cancel: Cancel,
    /// `iso14a_set_trigger`'s flag, consumed by the sniffer's trigger-mode
    /// selection.
    pub trigger_armed: bool,
}

impl EngineContext {
    /// A fresh context with default configuration and options.
    pub fn new() -> Self {
        let config = Hf14aConfig::new();
        let polling = config.build_polling_profile();
        EngineContext {
            timing: TimingController::new(),
            config,
            options: EngineOptions::new(),
            polling,
            cancel: Cancel::new(),
            trigger_armed: false,
        }
    }

    /// Merges a configuration update and rebuilds the cached polling
    /// profile from it, mirroring how `setHf14aConfig` always rebuilds
    /// `hf14a_polling_parameters` after an update.
    pub fn set_config(&mut self, update: &crate::config::Hf14aConfigUpdate) {
        self.config.merge(update);
        self.polling = self.config.build_polling_profile();
    }

    /// `iso14a_set_trigger`.
    pub fn set_trigger(&mut self, enable: bool) {
        self.trigger_armed = enable;
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hf14aConfigUpdate;

    #[test]
    fn cancel_token_observed_after_cancel() {
        let cancel = Cancel::new();
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn cloned_cancel_token_shares_state() {
        let a = Cancel::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn set_config_rebuilds_polling_profile() {
        let mut ctx = EngineContext::new();
        assert_eq!(ctx.polling.frames.len(), 1);
        ctx.set_config(&Hf14aConfigUpdate {
            magsafe: Some(true),
            ..Default::default()
        });
        assert!(ctx.polling.frames.len() > 1);
    }
}
