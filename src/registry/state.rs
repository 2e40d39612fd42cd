//! Lifecycle transition table and the per-device runtime record.

use super::capture::{CaptureCounters, CaptureTask, FrameTap};
use super::consumers::{ConsumerTask, RecordTask};
use crate::cache::CachedDevice;
use crate::errors::TransitionFailure;
use crate::types::{
    DeviceCapabilities, DeviceIdentity, DeviceSnapshot, FrameRecord, Lifecycle, SelectedConfig,
    TaskKind,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Select,
    EnablePreview,
    StartRecord,
    StopRecord,
    DisablePreview,
    Fault,
    Unplug,
    Reset,
}

impl LifecycleEvent {
    pub fn verb(&self) -> &'static str {
        match self {
            LifecycleEvent::Select => "select",
            LifecycleEvent::EnablePreview => "enable_preview",
            LifecycleEvent::StartRecord => "start_record",
            LifecycleEvent::StopRecord => "stop_record",
            LifecycleEvent::DisablePreview => "disable_preview",
            LifecycleEvent::Fault => "fault",
            LifecycleEvent::Unplug => "unplug",
            LifecycleEvent::Reset => "reset",
        }
    }
}

/// The transition table. Anything not listed is refused.
pub fn next_state(from: Lifecycle, event: LifecycleEvent) -> Result<Lifecycle, TransitionFailure> {
    use Lifecycle::*;
    use LifecycleEvent::*;

    let to = match (from, event) {
        (Discovered | Selected, Select) => Selected,
        (Selected, EnablePreview) => Previewing,
        (Previewing, StartRecord) => Recording,
        (Recording, StopRecord) => Previewing,
        (Previewing, DisablePreview) => Selected,
        (Discovered | Selected | Previewing | Recording, Fault) => Error,
        (Discovered | Selected | Previewing | Recording | Error, Unplug) => Removed,
        (Error, Reset) => Discovered,
        (from, event) => return Err(TransitionFailure::invalid_transition(from, event.verb())),
    };
    Ok(to)
}

#[derive(Debug, Default)]
pub(super) struct ProbeState {
    pub failures: u32,
    pub in_flight: bool,
    pub retry_scheduled: bool,
    pub disabled: bool,
    pub last_probe: Option<DateTime<Utc>>,
}

/// Tasks running for a device while it streams.
#[derive(Default)]
pub(super) struct StreamingTasks {
    pub capture: Option<CaptureTask>,
    pub preview: Option<ConsumerTask>,
    pub record: Option<RecordTask>,
}

impl StreamingTasks {
    pub fn is_empty(&self) -> bool {
        self.capture.is_none() && self.preview.is_none() && self.record.is_none()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds = Vec::new();
        if self.capture.is_some() {
            kinds.push(TaskKind::Capture);
        }
        if self.preview.is_some() {
            kinds.push(TaskKind::Preview);
        }
        if self.record.is_some() {
            kinds.push(TaskKind::Record);
        }
        kinds
    }
}

pub(super) struct DeviceRuntimeState {
    pub identity: DeviceIdentity,
    pub generation: u64,
    /// Index of the backend that enumerated the device.
    pub source: usize,
    pub lifecycle: Lifecycle,
    pub capabilities: Option<DeviceCapabilities>,
    pub selected_config: Option<SelectedConfig>,
    /// Last known selection (cache or earlier session), offered as the
    /// starting point for the next `select`.
    pub preferred_config: Option<SelectedConfig>,
    /// Cache contents held until a probe result can be merged with them.
    pub cached: Option<CachedDevice>,
    pub last_error: Option<String>,
    pub probe: ProbeState,
    pub tasks: StreamingTasks,
    pub tap: Arc<FrameTap>,
    pub counters: Arc<CaptureCounters>,
    pub latest_frame: Arc<Mutex<Option<FrameRecord>>>,
}

impl DeviceRuntimeState {
    pub fn new(identity: DeviceIdentity, generation: u64, source: usize) -> Self {
        Self {
            identity,
            generation,
            source,
            lifecycle: Lifecycle::Discovered,
            capabilities: None,
            selected_config: None,
            preferred_config: None,
            cached: None,
            last_error: None,
            probe: ProbeState::default(),
            tasks: StreamingTasks::default(),
            tap: Arc::new(FrameTap::new()),
            counters: Arc::new(CaptureCounters::default()),
            latest_frame: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stable_id(&self) -> &str {
        &self.identity.stable_id
    }

    /// Apply a table transition, logging refusals.
    pub fn transition(&mut self, event: LifecycleEvent) -> Result<Lifecycle, TransitionFailure> {
        match next_state(self.lifecycle, event) {
            Ok(next) => {
                log::debug!(
                    "{}: {} -> {} ({})",
                    self.identity.stable_id,
                    self.lifecycle,
                    next,
                    event.verb()
                );
                self.lifecycle = next;
                Ok(next)
            }
            Err(failure) => {
                log::warn!("{}: {}", self.identity.stable_id, failure);
                Err(failure)
            }
        }
    }

    /// Check a transition without applying it.
    pub fn check(&self, event: LifecycleEvent) -> Result<Lifecycle, TransitionFailure> {
        next_state(self.lifecycle, event).map_err(|failure| {
            log::warn!("{}: {}", self.identity.stable_id, failure);
            failure
        })
    }

    pub fn latest_frame(&self) -> Option<FrameRecord> {
        self.latest_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let mut active_tasks = self.tasks.kinds();
        if self.tap.external_outputs() > 0 {
            active_tasks.push(TaskKind::Tap);
        }
        if self.probe.in_flight {
            active_tasks.push(TaskKind::Probe);
        }
        DeviceSnapshot {
            identity: self.identity.clone(),
            generation: self.generation,
            lifecycle: self.lifecycle,
            capabilities: self.capabilities.clone(),
            selected_config: self.selected_config.clone(),
            active_tasks,
            last_error: self.last_error.clone(),
            metrics: self.counters.metrics(self.tap.dropped_total()),
            probe_failures: self.probe.failures,
            probing_disabled: self.probe.disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use Lifecycle::*;
    use LifecycleEvent::*;

    #[test]
    fn test_happy_path() {
        let mut state = Discovered;
        for (event, expected) in [
            (Select, Selected),
            (EnablePreview, Previewing),
            (StartRecord, Recording),
            (StopRecord, Previewing),
            (DisablePreview, Selected),
            (Select, Selected),
        ] {
            state = next_state(state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_invalid_transitions_are_refused() {
        for (from, event) in [
            (Discovered, StartRecord),
            (Discovered, EnablePreview),
            (Selected, StartRecord),
            (Recording, DisablePreview),
            (Recording, Select),
            (Previewing, Select),
            (Error, EnablePreview),
            (Selected, Reset),
        ] {
            let failure = next_state(from, event).unwrap_err();
            assert_eq!(failure.kind, FailureKind::InvalidTransition, "{:?} {:?}", from, event);
        }
    }

    #[test]
    fn test_removed_is_terminal() {
        for event in [
            Select,
            EnablePreview,
            StartRecord,
            StopRecord,
            DisablePreview,
            Fault,
            Unplug,
            Reset,
        ] {
            assert!(next_state(Removed, event).is_err());
        }
    }

    #[test]
    fn test_fault_and_reset() {
        for from in [Discovered, Selected, Previewing, Recording] {
            assert_eq!(next_state(from, Fault).unwrap(), Error);
        }
        assert!(next_state(Error, Fault).is_err());
        assert_eq!(next_state(Error, Reset).unwrap(), Discovered);
        assert_eq!(next_state(Error, Unplug).unwrap(), Removed);
    }
}
