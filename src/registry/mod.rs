//! Device registry: lifecycle state machine, discovery, capture orchestration.
//!
//! [`DeviceRegistry`] is a cheap, cloneable handle. Every call is a message to
//! a single dispatcher task that owns all per-device state; replies come back
//! over oneshot channels. Side effects the caller did not ask for (devices
//! appearing, probes finishing, faults) arrive on the event receiver returned
//! by [`DeviceRegistry::spawn`].

mod capture;
mod consumers;
mod discovery;
mod dispatch;
mod hotplug;
mod state;

pub use consumers::{RecordSummary, RECORDING_MAGIC};
pub use state::{next_state, LifecycleEvent};

use crate::backend::BackendSet;
use crate::buffer::{AdmissionPolicy, FrameBuffer};
use crate::cache::CapabilityCache;
use crate::config::RigConfig;
use crate::errors::TransitionFailure;
use crate::policy::DiscoveryPolicy;
use crate::selection::{ConfigRequest, Selection};
use crate::types::{CapabilitySource, DeviceSnapshot};
use dispatch::{Dispatcher, Internal, Reply, Request};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Runtime knobs of the registry, usually derived from [`RigConfig`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub policy: DiscoveryPolicy,
    /// `None` disables the background enumeration loop; rounds then only
    /// run on [`DeviceRegistry::discover_now`].
    pub poll_interval: Option<Duration>,
    pub enumerate_timeout: Duration,
    pub probe_timeout: Duration,
    pub flapping_threshold: Duration,
    pub grace_period: Duration,
    pub buffer_capacity: usize,
    pub record_capacity: usize,
    pub recording_dir: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl RegistrySettings {
    pub fn from_config(config: &RigConfig) -> Self {
        Self {
            policy: DiscoveryPolicy::from_config(&config.discovery),
            poll_interval: config.discovery.poll_interval(),
            enumerate_timeout: config.discovery.enumerate_timeout(),
            probe_timeout: config.discovery.probe_timeout(),
            flapping_threshold: config.discovery.flapping_threshold(),
            grace_period: config.runtime.grace_period(),
            buffer_capacity: config.buffer.capacity,
            record_capacity: config.buffer.record_capacity,
            recording_dir: config.storage.recording_directory.clone(),
            snapshot_dir: config.storage.snapshot_directory.clone(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&RigConfig::default())
    }
}

/// Things that happened inside the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Searching,
    /// An enumeration round found nothing (reported once per empty stretch).
    DeviceNotFound,
    DeviceDiscovered {
        device: DeviceSnapshot,
    },
    CapabilitiesReady {
        stable_id: String,
        source: CapabilitySource,
        modes: usize,
    },
    DeviceSelected {
        stable_id: String,
        selection: Selection,
    },
    PreviewStarted {
        stable_id: String,
    },
    PreviewStopped {
        stable_id: String,
    },
    RecordingStarted {
        stable_id: String,
        path: PathBuf,
    },
    RecordingStopped {
        stable_id: String,
        summary: RecordSummary,
    },
    RecordingFailed {
        stable_id: String,
        message: String,
    },
    SnapshotTaken {
        stable_id: String,
        path: PathBuf,
        frame_number: u64,
    },
    DeviceError {
        stable_id: String,
        message: String,
    },
    DeviceLost {
        stable_id: String,
    },
    DeviceReset {
        stable_id: String,
    },
}

impl RegistryEvent {
    pub fn stable_id(&self) -> Option<&str> {
        match self {
            RegistryEvent::Searching | RegistryEvent::DeviceNotFound => None,
            RegistryEvent::DeviceDiscovered { device } => Some(&device.identity.stable_id),
            RegistryEvent::CapabilitiesReady { stable_id, .. }
            | RegistryEvent::DeviceSelected { stable_id, .. }
            | RegistryEvent::PreviewStarted { stable_id }
            | RegistryEvent::PreviewStopped { stable_id }
            | RegistryEvent::RecordingStarted { stable_id, .. }
            | RegistryEvent::RecordingStopped { stable_id, .. }
            | RegistryEvent::RecordingFailed { stable_id, .. }
            | RegistryEvent::SnapshotTaken { stable_id, .. }
            | RegistryEvent::DeviceError { stable_id, .. }
            | RegistryEvent::DeviceLost { stable_id }
            | RegistryEvent::DeviceReset { stable_id } => Some(stable_id),
        }
    }
}

/// Handle to the registry dispatcher.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    requests: mpsc::UnboundedSender<Request>,
}

impl DeviceRegistry {
    /// Start the dispatcher on the current tokio runtime.
    pub fn spawn(
        settings: RegistrySettings,
        backends: BackendSet,
        cache: Arc<CapabilityCache>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel::<Internal>();

        log::info!(
            "Starting device registry with backends: {}",
            backends.names().join(", ")
        );
        let dispatcher = Dispatcher::new(settings, backends, cache, events, internal);
        tokio::spawn(dispatcher.run(requests_rx, internal_rx));

        (Self { requests }, events_rx)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, TransitionFailure> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| TransitionFailure::closed())?;
        rx.await.map_err(|_| TransitionFailure::closed())?
    }

    /// Run one enumeration round and apply it before returning.
    pub async fn discover_now(&self) -> Result<(), TransitionFailure> {
        self.call(|reply| Request::Discover { reply }).await
    }

    /// Resolve and apply a configuration. Waits for a running probe when the
    /// device's capabilities are not known yet.
    pub async fn select_device(
        &self,
        stable_id: &str,
        request: ConfigRequest,
    ) -> Result<Selection, TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::Select {
            stable_id,
            request,
            reply,
        })
        .await
    }

    pub async fn enable_preview(&self, stable_id: &str) -> Result<(), TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::EnablePreview { stable_id, reply })
            .await
    }

    /// Stop capture. The backend handle is closed before this returns.
    pub async fn disable_preview(&self, stable_id: &str) -> Result<(), TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::DisablePreview { stable_id, reply })
            .await
    }

    /// Start writing frames to a new file; returns its path.
    pub async fn start_record(&self, stable_id: &str) -> Result<PathBuf, TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::StartRecord { stable_id, reply })
            .await
    }

    pub async fn stop_record(&self, stable_id: &str) -> Result<RecordSummary, TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::StopRecord { stable_id, reply })
            .await
    }

    pub async fn take_snapshot(&self, stable_id: &str) -> Result<PathBuf, TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::TakeSnapshot { stable_id, reply })
            .await
    }

    /// Leave the Error state.
    pub async fn reset_device(&self, stable_id: &str) -> Result<(), TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::Reset { stable_id, reply }).await
    }

    /// Probe again, re-enabling probing if it was disabled.
    pub async fn reprobe(&self, stable_id: &str) -> Result<(), TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::Reprobe { stable_id, reply }).await
    }

    /// Feed a new buffer from the device's capture task. The buffer stays
    /// attached across preview sessions and is closed when the device goes
    /// away.
    pub async fn attach_consumer(
        &self,
        stable_id: &str,
        capacity: usize,
        policy: AdmissionPolicy,
    ) -> Result<Arc<FrameBuffer>, TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::AttachConsumer {
            stable_id,
            capacity,
            policy,
            reply,
        })
        .await
    }

    pub async fn devices(&self) -> Result<Vec<DeviceSnapshot>, TransitionFailure> {
        self.call(|reply| Request::Devices { reply }).await
    }

    pub async fn device(&self, stable_id: &str) -> Result<DeviceSnapshot, TransitionFailure> {
        let stable_id = stable_id.to_string();
        self.call(|reply| Request::Device { stable_id, reply }).await
    }

    /// Stop every task, persist what is known and end the dispatcher.
    /// Later calls on any handle fail with `shutting_down`.
    pub async fn shutdown(&self) -> Result<(), TransitionFailure> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}
