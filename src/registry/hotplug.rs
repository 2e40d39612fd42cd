//! Debouncing of flapping connections.
//!
//! A loss is reported at once when the threshold is zero or the device was
//! streaming. Otherwise the `device_lost` status waits out the threshold; a
//! re-plug inside the window cancels it and the device comes back in its
//! previous visible state. Resources are always released immediately.

use crate::types::{DeviceCapabilities, DeviceIdentity, Lifecycle, SelectedConfig};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// What a device looked like when it was lost.
#[derive(Debug, Clone)]
pub(super) struct PendingLoss {
    pub identity: DeviceIdentity,
    pub lifecycle: Lifecycle,
    pub capabilities: Option<DeviceCapabilities>,
    pub selected_config: Option<SelectedConfig>,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LossReport {
    Now,
    Deferred,
}

#[derive(Debug)]
pub(super) enum Reappearance {
    Fresh,
    Restored(PendingLoss),
    Expired(DeviceIdentity),
}

#[derive(Debug)]
pub(super) struct FlapFilter {
    threshold: Duration,
    pending: HashMap<String, PendingLoss>,
}

impl FlapFilter {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            pending: HashMap::new(),
        }
    }

    pub fn on_lost(
        &mut self,
        identity: DeviceIdentity,
        lifecycle: Lifecycle,
        capabilities: Option<DeviceCapabilities>,
        selected_config: Option<SelectedConfig>,
        now: Instant,
    ) -> LossReport {
        if self.threshold.is_zero() || lifecycle.is_streaming() {
            return LossReport::Now;
        }
        self.pending.insert(
            identity.stable_id.clone(),
            PendingLoss {
                identity,
                lifecycle,
                capabilities,
                selected_config,
                deadline: now + self.threshold,
            },
        );
        LossReport::Deferred
    }

    /// A device reappeared. A loss still inside its window is cancelled and
    /// the pre-loss state handed back; one whose window already closed must
    /// be reported before the device is announced again.
    pub fn on_found(&mut self, stable_id: &str, now: Instant) -> Reappearance {
        match self.pending.remove(stable_id) {
            Some(pending) if pending.deadline > now => Reappearance::Restored(pending),
            Some(pending) => Reappearance::Expired(pending.identity),
            None => Reappearance::Fresh,
        }
    }

    /// Losses whose window has closed.
    pub fn due(&mut self, now: Instant) -> Vec<DeviceIdentity> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|p| p.identity)
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
