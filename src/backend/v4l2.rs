//! V4L2 capture backend (USB UVC and CSI sensors on Linux).
//!
//! Device I/O is blocking, so enumeration and probing run on the blocking
//! pool and streaming runs on a dedicated thread per open handle. That thread
//! only ever `try_send`s into a bounded channel: a slow consumer costs frames,
//! never a stalled driver queue.

use super::{BackendHandle, CaptureBackend, FrameRead, ProbeReport, RawFrame, RawMode};
use crate::errors::BackendError;
use crate::types::{BackendKind, CapabilityMode, ControlRange, DeviceIdentity, PixelFormat};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Format, FourCC};

const STREAM_BUFFERS: u32 = 4;
const FRAME_QUEUE: usize = 4;
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct V4l2Backend {
    device_root: PathBuf,
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Backend {
    pub fn new() -> Self {
        Self::with_root("/dev")
    }

    pub fn with_root(device_root: impl Into<PathBuf>) -> Self {
        Self {
            device_root: device_root.into(),
        }
    }
}

fn blocking_error(err: tokio::task::JoinError) -> BackendError {
    BackendError::fatal(format!("V4L2 worker failed: {}", err))
}

/// `v4l2:<bus>:<card>`, stable across reboots for the same port and sensor.
fn stable_id(bus: &str, card: &str) -> String {
    let clean = |s: &str| {
        s.trim()
            .chars()
            .map(|c| if c.is_whitespace() { '-' } else { c })
            .collect::<String>()
    };
    format!("v4l2:{}:{}", clean(bus), clean(card))
}

fn kind_for_bus(bus: &str) -> BackendKind {
    if bus.starts_with("platform:") || bus.contains("csi") {
        BackendKind::Csi
    } else {
        BackendKind::Usb
    }
}

fn scan_devices(root: &Path) -> Result<Vec<DeviceIdentity>, BackendError> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("video"))
                .unwrap_or(false)
        })
        .collect();
    nodes.sort();

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for path in nodes {
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // metadata nodes share bus and card with the capture node
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let id = stable_id(&caps.bus, &caps.card);
        if !seen.insert(id.clone()) {
            continue;
        }
        found.push(
            DeviceIdentity::new(kind_for_bus(&caps.bus), id)
                .with_friendly_name(caps.card.trim())
                .with_connection_hint(path.to_string_lossy()),
        );
    }
    Ok(found)
}

/// Find the node for an identity, preferring its last known path.
fn locate(root: &Path, identity: &DeviceIdentity) -> Result<PathBuf, BackendError> {
    if let Some(hint) = identity.connection_hint.as_deref() {
        if let Ok(dev) = Device::with_path(hint) {
            if let Ok(caps) = dev.query_caps() {
                if stable_id(&caps.bus, &caps.card) == identity.stable_id {
                    return Ok(PathBuf::from(hint));
                }
            }
        }
    }
    scan_devices(root)?
        .into_iter()
        .find(|found| found.stable_id == identity.stable_id)
        .and_then(|found| found.connection_hint)
        .map(PathBuf::from)
        .ok_or_else(|| BackendError::unreachable(format!("{} not attached", identity.stable_id)))
}

fn fourcc_for(format: PixelFormat) -> FourCC {
    let code: &[u8; 4] = match format {
        PixelFormat::Rgb => b"RGB3",
        PixelFormat::Bgr => b"BGR3",
        PixelFormat::Rgba => b"AB24",
        PixelFormat::Yuv420 => b"YU12",
        PixelFormat::Nv12 => b"NV12",
        PixelFormat::Yuyv => b"YUYV",
        PixelFormat::Uyvy => b"UYVY",
        PixelFormat::Mjpeg => b"MJPG",
        PixelFormat::H264 => b"H264",
        PixelFormat::Gray8 => b"GREY",
        PixelFormat::Gray16 => b"Y16 ",
    };
    FourCC::new(code)
}

fn probe_node(path: &Path) -> Result<ProbeReport, BackendError> {
    let dev = Device::with_path(path)?;

    let mut controls = BTreeMap::new();
    if let Ok(descriptions) = dev.query_controls() {
        for desc in descriptions {
            if matches!(
                desc.typ,
                v4l::control::Type::Integer | v4l::control::Type::Boolean | v4l::control::Type::Menu
            ) {
                controls.insert(
                    desc.name.to_lowercase().replace(' ', "_"),
                    ControlRange {
                        min: desc.minimum as f64,
                        max: desc.maximum as f64,
                        default: desc.default as f64,
                    },
                );
            }
        }
    }

    let mut modes = Vec::new();
    for description in dev.enum_formats()? {
        let fourcc = description.fourcc;
        let format = fourcc.str().unwrap_or("????").to_string();
        let Ok(sizes) = dev.enum_framesizes(fourcc) else {
            continue;
        };
        for size in sizes {
            let dimensions: Vec<(u32, u32)> = match size.size {
                FrameSizeEnum::Discrete(discrete) => vec![(discrete.width, discrete.height)],
                FrameSizeEnum::Stepwise(step) => [(640, 480), (1280, 720), (1920, 1080), (3840, 2160)]
                    .into_iter()
                    .filter(|&(w, h)| {
                        w >= step.min_width
                            && w <= step.max_width
                            && h >= step.min_height
                            && h <= step.max_height
                    })
                    .collect(),
            };
            for (width, height) in dimensions {
                let intervals = dev
                    .enum_frameintervals(fourcc, width, height)
                    .unwrap_or_default();
                let mut rates: Vec<f64> = intervals
                    .into_iter()
                    .filter_map(|interval| match interval.interval {
                        FrameIntervalEnum::Discrete(frac) if frac.numerator > 0 => {
                            Some(frac.denominator as f64 / frac.numerator as f64)
                        }
                        _ => None,
                    })
                    .collect();
                if rates.is_empty() {
                    rates.push(30.0);
                }
                for fps in rates {
                    let mut mode = RawMode::new(width, height, fps, format.clone());
                    mode.controls = controls.clone();
                    modes.push(mode);
                }
            }
        }
    }
    Ok(ProbeReport::new(modes))
}

fn stream_worker(
    path: PathBuf,
    mode: CapabilityMode,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), BackendError>>,
    frames: mpsc::Sender<Result<RawFrame, BackendError>>,
) {
    let setup = || -> Result<Device, BackendError> {
        let dev = Device::with_path(&path)?;
        let format = Format::new(mode.width, mode.height, fourcc_for(mode.pixel_format));
        let applied = dev.set_format(&format)?;
        if applied.width != mode.width || applied.height != mode.height {
            return Err(BackendError::misconfigured(format!(
                "driver chose {}x{} instead of {}x{}",
                applied.width, applied.height, mode.width, mode.height
            )));
        }
        if let Err(e) = dev.set_params(&Parameters::with_fps(mode.fps.round() as u32)) {
            log::warn!("Could not set {} fps on {:?}: {}", mode.fps, path, e);
        }
        Ok(dev)
    };

    let dev = match setup() {
        Ok(dev) => dev,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut stream = match MmapStream::with_buffers(&dev, Type::VideoCapture, STREAM_BUFFERS) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    while !stop.load(Ordering::Relaxed) {
        match stream.next() {
            Ok((buf, meta)) => {
                let sensor_ns = (meta.timestamp.sec as i64)
                    .saturating_mul(1_000_000_000)
                    .saturating_add((meta.timestamp.usec as i64).saturating_mul(1000));
                let frame = RawFrame {
                    payload: Bytes::copy_from_slice(buf),
                    sensor_timestamp: u64::try_from(sensor_ns).ok(),
                };
                match frames.try_send(Ok(frame)) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                let _ = frames.try_send(Err(e.into()));
                break;
            }
        }
    }
    log::debug!("V4L2 stream on {:?} stopped", path);
}

struct V4l2Handle {
    frames: mpsc::Receiver<Result<RawFrame, BackendError>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl BackendHandle for V4l2Handle {
    fn read_frame(&mut self) -> BoxFuture<'_, Result<FrameRead, BackendError>> {
        Box::pin(async move {
            match self.frames.recv().await {
                Some(Ok(frame)) => Ok(FrameRead::Frame(frame)),
                Some(Err(e)) => Err(e),
                None => Ok(FrameRead::EndOfStream),
            }
        })
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.frames.close();
        // The worker releases the device after its current dequeue returns.
        self.worker.take();
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn serves(&self, kind: BackendKind) -> bool {
        matches!(kind, BackendKind::Usb | BackendKind::Csi)
    }

    fn enumerate(&self) -> BoxFuture<'_, Result<Vec<DeviceIdentity>, BackendError>> {
        let root = self.device_root.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || scan_devices(&root))
                .await
                .map_err(blocking_error)?
        })
    }

    fn probe<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<ProbeReport, BackendError>> {
        let root = self.device_root.clone();
        let identity = identity.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let path = locate(&root, &identity)?;
                probe_node(&path)
            })
            .await
            .map_err(blocking_error)?
        })
    }

    fn open<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
        mode: &'a CapabilityMode,
    ) -> BoxFuture<'a, Result<Box<dyn BackendHandle>, BackendError>> {
        let root = self.device_root.clone();
        let identity = identity.clone();
        let mode = mode.clone();
        Box::pin(async move {
            let path = {
                let identity = identity.clone();
                tokio::task::spawn_blocking(move || locate(&root, &identity))
                    .await
                    .map_err(blocking_error)??
            };

            let stop = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = oneshot::channel();
            let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
            let worker = {
                let stop = stop.clone();
                std::thread::Builder::new()
                    .name(format!("crabrig-v4l2-{}", identity.stable_id))
                    .spawn(move || stream_worker(path, mode, stop, ready_tx, frame_tx))?
            };

            let mut handle = V4l2Handle {
                frames: frame_rx,
                stop,
                worker: Some(worker),
            };
            match tokio::time::timeout(OPEN_TIMEOUT, ready_rx).await {
                Ok(Ok(Ok(()))) => {
                    log::info!("Opened V4L2 device {}", identity.stable_id);
                    let handle: Box<dyn BackendHandle> = Box::new(handle);
                    Ok(handle)
                }
                Ok(Ok(Err(e))) => {
                    handle.close();
                    Err(e)
                }
                Ok(Err(_)) => {
                    handle.close();
                    Err(BackendError::fatal("V4L2 worker exited during setup"))
                }
                Err(_) => {
                    handle.close();
                    Err(BackendError::unreachable("timed out opening V4L2 device"))
                }
            }
        })
    }
}
