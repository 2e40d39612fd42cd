//! Scriptable in-process backend.
//!
//! Devices are plugged and unplugged by the test (or by the `--mock-devices`
//! runtime flag). Probe failures, slow probes, hanging reads, fatal faults and
//! end of stream can be injected per device. Every open and close is counted
//! so tests can check that a device never has two live handles.

use super::{BackendHandle, CaptureBackend, FrameRead, ProbeReport, RawFrame};
use crate::errors::BackendError;
use crate::testing::synthetic_payload;
use crate::types::{BackendKind, CapabilityMode, DeviceIdentity};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Largest synthetic payload produced per frame.
const MAX_PAYLOAD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub opened: u64,
    pub closed: u64,
    pub open_now: u64,
    pub max_open: u64,
    pub probes: u64,
}

#[derive(Debug)]
struct MockDevice {
    identity: DeviceIdentity,
    report: ProbeReport,
    plugged: bool,
    failing_probes: u32,
    probe_delay: Duration,
    hang_reads: bool,
    fault_pending: bool,
    frames_left: Option<u64>,
}

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<String, MockDevice>,
    stats: BTreeMap<String, HandleStats>,
    frame_interval: Duration,
    enumerate_fails: bool,
}

#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                frame_interval: Duration::from_millis(5),
                ..MockState::default()
            })),
        }
    }

    /// `count` devices named `mock-cam-0001`.. with the reference mode list.
    pub fn with_reference_devices(count: usize) -> Self {
        let backend = Self::new();
        for n in 1..=count {
            let identity = DeviceIdentity::new(BackendKind::Mock, format!("mock-cam-{:04}", n))
                .with_friendly_name(format!("Mock Camera {}", n));
            backend.plug(identity, crate::testing::reference_probe_report());
        }
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device(&self, stable_id: &str, apply: impl FnOnce(&mut MockDevice)) {
        match self.lock().devices.get_mut(stable_id) {
            Some(device) => apply(device),
            None => log::warn!("mock device {} is not known", stable_id),
        }
    }

    /// Attach a device, or re-attach one that was unplugged.
    pub fn plug(&self, identity: DeviceIdentity, report: ProbeReport) {
        let mut state = self.lock();
        state.devices.insert(
            identity.stable_id.clone(),
            MockDevice {
                identity,
                report,
                plugged: true,
                failing_probes: 0,
                probe_delay: Duration::ZERO,
                hang_reads: false,
                fault_pending: false,
                frames_left: None,
            },
        );
    }

    /// Re-attach a previously plugged device with its last report.
    pub fn replug(&self, stable_id: &str) {
        self.with_device(stable_id, |device| device.plugged = true);
    }

    pub fn unplug(&self, stable_id: &str) {
        self.with_device(stable_id, |device| device.plugged = false);
    }

    pub fn set_report(&self, stable_id: &str, report: ProbeReport) {
        self.with_device(stable_id, |device| device.report = report);
    }

    pub fn fail_next_probes(&self, stable_id: &str, count: u32) {
        self.with_device(stable_id, |device| device.failing_probes = count);
    }

    pub fn set_probe_delay(&self, stable_id: &str, delay: Duration) {
        self.with_device(stable_id, |device| device.probe_delay = delay);
    }

    /// Reads never complete while set.
    pub fn set_hang(&self, stable_id: &str, hang: bool) {
        self.with_device(stable_id, |device| device.hang_reads = hang);
    }

    /// The next read fails with a fatal error.
    pub fn inject_fault(&self, stable_id: &str) {
        self.with_device(stable_id, |device| device.fault_pending = true);
    }

    /// Report end of stream after `frames` more frames.
    pub fn end_stream_after(&self, stable_id: &str, frames: u64) {
        self.with_device(stable_id, |device| device.frames_left = Some(frames));
    }

    pub fn set_frame_interval(&self, interval: Duration) {
        self.lock().frame_interval = interval;
    }

    pub fn set_enumerate_fails(&self, fails: bool) {
        self.lock().enumerate_fails = fails;
    }

    pub fn stats(&self, stable_id: &str) -> HandleStats {
        self.lock()
            .stats
            .get(stable_id)
            .copied()
            .unwrap_or_default()
    }
}

impl CaptureBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn serves(&self, kind: BackendKind) -> bool {
        kind == BackendKind::Mock
    }

    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<DeviceIdentity>, BackendError>> {
        Box::pin(async move {
            let state = self.lock();
            if state.enumerate_fails {
                return Err(BackendError::unreachable("mock enumeration failure"));
            }
            Ok(state
                .devices
                .values()
                .filter(|d| d.plugged)
                .map(|d| d.identity.clone())
                .collect())
        })
    }

    fn probe<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<ProbeReport, BackendError>> {
        Box::pin(async move {
            let delay = {
                let mut state = self.lock();
                state
                    .stats
                    .entry(identity.stable_id.clone())
                    .or_default()
                    .probes += 1;
                match state.devices.get(&identity.stable_id) {
                    Some(device) => device.probe_delay,
                    None => return Err(BackendError::unreachable("device not attached")),
                }
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.lock();
            let device = state
                .devices
                .get_mut(&identity.stable_id)
                .filter(|d| d.plugged)
                .ok_or_else(|| BackendError::unreachable("device not attached"))?;
            if device.failing_probes > 0 {
                device.failing_probes -= 1;
                return Err(BackendError::unreachable("mock probe failure"));
            }
            Ok(device.report.clone())
        })
    }

    fn open<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
        mode: &'a CapabilityMode,
    ) -> BoxFuture<'a, Result<Box<dyn BackendHandle>, BackendError>> {
        Box::pin(async move {
            let mut state = self.lock();
            let plugged = state
                .devices
                .get(&identity.stable_id)
                .map(|d| d.plugged)
                .unwrap_or(false);
            if !plugged {
                return Err(BackendError::unreachable("device not attached"));
            }
            let stats = state.stats.entry(identity.stable_id.clone()).or_default();
            stats.opened += 1;
            stats.open_now += 1;
            stats.max_open = stats.max_open.max(stats.open_now);

            let payload_len = (mode.width as usize * mode.height as usize).clamp(64, MAX_PAYLOAD);
            let handle: Box<dyn BackendHandle> = Box::new(MockHandle {
                state: self.state.clone(),
                stable_id: identity.stable_id.clone(),
                width: mode.width,
                payload_len,
                sequence: 0,
                closed: false,
            });
            Ok(handle)
        })
    }
}

enum ReadPlan {
    Hang,
    Fault,
    Unplugged,
    EndOfStream,
    Frame,
}

struct MockHandle {
    state: Arc<Mutex<MockState>>,
    stable_id: String,
    width: u32,
    payload_len: usize,
    sequence: u64,
    closed: bool,
}

impl MockHandle {
    fn plan(&self) -> (ReadPlan, Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let interval = state.frame_interval;
        let plan = match state.devices.get_mut(&self.stable_id) {
            None => ReadPlan::Unplugged,
            Some(device) if !device.plugged => ReadPlan::Unplugged,
            Some(device) if device.hang_reads => ReadPlan::Hang,
            Some(device) if device.fault_pending => {
                device.fault_pending = false;
                ReadPlan::Fault
            }
            Some(device) => match device.frames_left.as_mut() {
                Some(0) => ReadPlan::EndOfStream,
                Some(left) => {
                    *left -= 1;
                    ReadPlan::Frame
                }
                None => ReadPlan::Frame,
            },
        };
        (plan, interval)
    }
}

impl BackendHandle for MockHandle {
    fn read_frame(&mut self) -> BoxFuture<'_, Result<FrameRead, BackendError>> {
        Box::pin(async move {
            if self.closed {
                return Err(BackendError::fatal("read on closed handle"));
            }
            let (plan, interval) = self.plan();
            match plan {
                ReadPlan::Hang => std::future::pending().await,
                ReadPlan::Fault => Err(BackendError::fatal("injected mock fault")),
                ReadPlan::Unplugged => {
                    tokio::time::sleep(interval).await;
                    Err(BackendError::unreachable("device disconnected"))
                }
                ReadPlan::EndOfStream => Ok(FrameRead::EndOfStream),
                ReadPlan::Frame => {
                    tokio::time::sleep(interval).await;
                    self.sequence += 1;
                    let payload = synthetic_payload(self.sequence, self.width, self.payload_len);
                    Ok(FrameRead::Frame(RawFrame {
                        payload,
                        sensor_timestamp: Some(self.sequence * interval.as_nanos() as u64),
                    }))
                }
            }
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = state.stats.entry(self.stable_id.clone()).or_default();
        stats.closed += 1;
        stats.open_now = stats.open_now.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::reference_probe_report;
    use crate::types::PixelFormat;

    fn identity(id: &str) -> DeviceIdentity {
        DeviceIdentity::new(BackendKind::Mock, id)
    }

    #[tokio::test]
    async fn test_enumerate_follows_plug_state() {
        let backend = MockBackend::new();
        backend.plug(identity("a"), reference_probe_report());
        backend.plug(identity("b"), reference_probe_report());
        assert_eq!(backend.enumerate().await.unwrap().len(), 2);

        backend.unplug("a");
        let found = backend.enumerate().await.unwrap();
        assert_eq!(found, vec![identity("b")]);

        backend.replug("a");
        assert_eq!(backend.enumerate().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_probe_failures_then_success() {
        let backend = MockBackend::new();
        backend.plug(identity("a"), reference_probe_report());
        backend.fail_next_probes("a", 2);
        assert!(backend.probe(&identity("a")).await.is_err());
        assert!(backend.probe(&identity("a")).await.is_err());
        assert!(backend.probe(&identity("a")).await.is_ok());
        assert_eq!(backend.stats("a").probes, 3);
    }

    #[tokio::test]
    async fn test_reads_and_faults() {
        let backend = MockBackend::new();
        backend.set_frame_interval(Duration::from_millis(1));
        backend.plug(identity("a"), reference_probe_report());
        let mode = CapabilityMode::new(640, 480, 60.0, PixelFormat::Rgb);
        let mut handle = backend.open(&identity("a"), &mode).await.unwrap();

        assert!(matches!(handle.read_frame().await, Ok(FrameRead::Frame(_))));
        backend.inject_fault("a");
        assert!(handle.read_frame().await.unwrap_err().is_fatal());

        backend.end_stream_after("a", 1);
        assert!(matches!(handle.read_frame().await, Ok(FrameRead::Frame(_))));
        assert!(matches!(handle.read_frame().await, Ok(FrameRead::EndOfStream)));

        handle.close();
        handle.close();
        let stats = backend.stats("a");
        assert_eq!((stats.opened, stats.closed, stats.open_now), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_open_unplugged_fails() {
        let backend = MockBackend::new();
        backend.plug(identity("a"), reference_probe_report());
        backend.unplug("a");
        let mode = CapabilityMode::new(640, 480, 60.0, PixelFormat::Rgb);
        assert!(backend.open(&identity("a"), &mode).await.is_err());
        assert_eq!(backend.stats("a").opened, 0);
    }
}
