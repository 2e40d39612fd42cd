//! Capture backends.
//!
//! A backend enumerates devices, probes their modes and opens capture
//! handles. The registry only talks to the [`CaptureBackend`] and
//! [`BackendHandle`] traits; [`BackendSet::from_kinds`] builds the concrete
//! set named in the configuration.

pub mod mock;
#[cfg(all(target_os = "linux", feature = "v4l2"))]
pub mod v4l2;

pub use mock::{HandleStats, MockBackend};

use crate::errors::{BackendError, RigError};
use crate::types::{
    BackendKind, CapabilityMode, ControlRange, DeviceCapabilities, DeviceIdentity, PixelFormat,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A mode exactly as the backend reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMode {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: String,
    #[serde(default)]
    pub controls: BTreeMap<String, ControlRange>,
}

impl RawMode {
    pub fn new(width: u32, height: u32, fps: f64, format: impl Into<String>) -> Self {
        Self {
            width,
            height,
            fps,
            format: format.into(),
            controls: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub modes: Vec<RawMode>,
    /// `"WxH"` to maximum sustained fps, when the backend knows better than
    /// the mode list.
    #[serde(default)]
    pub limits: BTreeMap<String, f64>,
}

impl ProbeReport {
    pub fn new(modes: Vec<RawMode>) -> Self {
        Self {
            modes,
            limits: BTreeMap::new(),
        }
    }

    /// Canonicalize into [`DeviceCapabilities`].
    ///
    /// Modes with unknown pixel formats are dropped with a warning. `None`
    /// when no usable mode remains.
    pub fn into_capabilities(self, probed_at: DateTime<Utc>) -> Option<DeviceCapabilities> {
        let modes = self
            .modes
            .into_iter()
            .filter_map(|raw| match PixelFormat::canonicalize(&raw.format) {
                Some(pixel_format) => Some(CapabilityMode {
                    width: raw.width,
                    height: raw.height,
                    fps: raw.fps,
                    pixel_format,
                    controls: raw.controls,
                }),
                None => {
                    log::warn!(
                        "Dropping {}x{}@{} mode with unknown pixel format {:?}",
                        raw.width,
                        raw.height,
                        raw.fps,
                        raw.format
                    );
                    None
                }
            })
            .collect();
        DeviceCapabilities::from_modes(modes, self.limits, probed_at)
    }
}

#[derive(Debug, Clone)]
pub struct RawFrame {
    pub payload: Bytes,
    /// Nanoseconds, in the sensor's own clock.
    pub sensor_timestamp: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum FrameRead {
    Frame(RawFrame),
    EndOfStream,
}

pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether devices of this kind are handled here.
    fn serves(&self, kind: BackendKind) -> bool;

    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<DeviceIdentity>, BackendError>>;

    fn probe<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<ProbeReport, BackendError>>;

    fn open<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
        mode: &'a CapabilityMode,
    ) -> BoxFuture<'a, Result<Box<dyn BackendHandle>, BackendError>>;
}

/// An open device. `close` must be idempotent.
pub trait BackendHandle: Send {
    fn read_frame(&mut self) -> BoxFuture<'_, Result<FrameRead, BackendError>>;
    fn close(&mut self);
}

/// Owns a backend handle and closes it when dropped, including when the
/// owning task is aborted.
pub struct HandleGuard {
    handle: Option<Box<dyn BackendHandle>>,
}

impl HandleGuard {
    pub fn new(handle: Box<dyn BackendHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub async fn read_frame(&mut self) -> Result<FrameRead, BackendError> {
        match self.handle.as_mut() {
            Some(handle) => handle.read_frame().await,
            None => Err(BackendError::fatal("handle already released")),
        }
    }

    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// The backends a runtime enumerates, in configuration order.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: Vec<Arc<dyn CaptureBackend>>,
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|b| b.name()))
            .finish()
    }
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn CaptureBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Build the backends for the configured kinds.
    ///
    /// USB and CSI share the V4L2 backend. `mock` uses `mock` when given,
    /// otherwise an empty scriptable mock.
    pub fn from_kinds(kinds: &[BackendKind], mock: Option<MockBackend>) -> Result<Self, RigError> {
        let mut set = BackendSet::new();
        let mut mock = mock;
        for kind in kinds {
            if set.backends.iter().any(|b| b.serves(*kind)) {
                continue;
            }
            match kind {
                BackendKind::Mock => {
                    let backend = mock.take().unwrap_or_default();
                    set.backends.push(Arc::new(backend));
                }
                BackendKind::Usb | BackendKind::Csi => {
                    set.backends.push(v4l2_backend()?);
                }
                BackendKind::Network => {
                    return Err(RigError::Backend(BackendError::unsupported(
                        "no network capture backend is available",
                    )));
                }
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<dyn CaptureBackend>)> {
        self.backends.iter().enumerate()
    }

    pub fn get(&self, index: usize) -> Option<Arc<dyn CaptureBackend>> {
        self.backends.get(index).cloned()
    }

    /// First backend that serves devices of `kind`.
    pub fn resolve(&self, kind: BackendKind) -> Option<Arc<dyn CaptureBackend>> {
        self.backends.iter().find(|b| b.serves(kind)).cloned()
    }
}

#[cfg(all(target_os = "linux", feature = "v4l2"))]
fn v4l2_backend() -> Result<Arc<dyn CaptureBackend>, RigError> {
    Ok(Arc::new(v4l2::V4l2Backend::new()))
}

#[cfg(not(all(target_os = "linux", feature = "v4l2")))]
fn v4l2_backend() -> Result<Arc<dyn CaptureBackend>, RigError> {
    Err(RigError::Backend(BackendError::unsupported(
        "V4L2 support not compiled in (enable the `v4l2` feature on Linux)",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_report_drops_unknown_formats() {
        let report = ProbeReport::new(vec![
            RawMode::new(1920, 1080, 30.0, "MJPG"),
            RawMode::new(1920, 1080, 30.0, "BA81"),
            RawMode::new(640, 480, 30.0, "yuy2"),
        ]);
        let caps = report.into_capabilities(Utc::now()).unwrap();
        assert_eq!(caps.modes.len(), 2);
        assert!(caps
            .modes
            .iter()
            .all(|m| matches!(m.pixel_format, PixelFormat::Mjpeg | PixelFormat::Yuyv)));
    }

    #[test]
    fn test_probe_report_without_usable_modes() {
        let report = ProbeReport::new(vec![RawMode::new(1920, 1080, 30.0, "BA81")]);
        assert!(report.into_capabilities(Utc::now()).is_none());
    }

    #[test]
    fn test_backend_set_factory() {
        let set = BackendSet::from_kinds(&[BackendKind::Mock, BackendKind::Mock], None).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.resolve(BackendKind::Mock).is_some());
        assert!(set.resolve(BackendKind::Usb).is_none());
        assert!(BackendSet::from_kinds(&[BackendKind::Network], None).is_err());
    }

    #[test]
    fn test_handle_guard_closes_on_drop() {
        let backend = MockBackend::new();
        let identity = DeviceIdentity::new(BackendKind::Mock, "cam-guard");
        backend.plug(identity.clone(), crate::testing::reference_probe_report());
        let mode = CapabilityMode::new(640, 480, 60.0, PixelFormat::Rgb);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.block_on(backend.open(&identity, &mode)).unwrap();
        let guard = HandleGuard::new(handle);
        assert_eq!(backend.stats("cam-guard").open_now, 1);
        drop(guard);
        let stats = backend.stats("cam-guard");
        assert_eq!(stats.open_now, 0);
        assert_eq!(stats.closed, 1);
    }
}
