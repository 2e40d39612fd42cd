//! Core data model shared by the registry, cache and protocol layers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which family of backend a device was found through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Usb,
    Csi,
    Network,
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Usb => "usb",
            BackendKind::Csi => "csi",
            BackendKind::Network => "network",
            BackendKind::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "usb" | "uvc" => Ok(BackendKind::Usb),
            "csi" => Ok(BackendKind::Csi),
            "network" | "net" => Ok(BackendKind::Network),
            "mock" => Ok(BackendKind::Mock),
            other => Err(format!("unknown backend kind: {}", other)),
        }
    }
}

/// Identity of a physical device.
///
/// `stable_id` must survive reboots and re-plugs (serial number, or a
/// connector + sensor signature). Transient handles such as `/dev/video2`
/// belong in `connection_hint`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub backend: BackendKind,
    pub stable_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_hint: Option<String>,
}

impl DeviceIdentity {
    pub fn new(backend: BackendKind, stable_id: impl Into<String>) -> Self {
        Self {
            backend,
            stable_id: stable_id.into(),
            friendly_name: None,
            connection_hint: None,
        }
    }

    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = Some(name.into());
        self
    }

    pub fn with_connection_hint(mut self, hint: impl Into<String>) -> Self {
        self.connection_hint = Some(hint.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.stable_id)
    }
}

/// Canonical pixel formats. Backend-specific names are mapped onto these
/// at ingestion; anything not in the alias table is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PixelFormat {
    Rgb,
    Bgr,
    Rgba,
    Yuv420,
    Nv12,
    Yuyv,
    Uyvy,
    Mjpeg,
    H264,
    Gray8,
    Gray16,
}

lazy_static::lazy_static! {
    static ref FORMAT_ALIASES: HashMap<&'static str, PixelFormat> = {
        let mut aliases = HashMap::new();
        for name in ["RGB", "RGB3", "RGB24", "RGB8", "RGB888"] {
            aliases.insert(name, PixelFormat::Rgb);
        }
        for name in ["BGR", "BGR3", "BGR24", "BGR888"] {
            aliases.insert(name, PixelFormat::Bgr);
        }
        for name in ["RGBA", "RGBA32", "AB24", "RGBA8888"] {
            aliases.insert(name, PixelFormat::Rgba);
        }
        for name in ["YUV420", "YUV420P", "YU12", "I420", "IYUV"] {
            aliases.insert(name, PixelFormat::Yuv420);
        }
        aliases.insert("NV12", PixelFormat::Nv12);
        for name in ["YUYV", "YUY2", "YUV422"] {
            aliases.insert(name, PixelFormat::Yuyv);
        }
        aliases.insert("UYVY", PixelFormat::Uyvy);
        for name in ["MJPEG", "MJPG", "JPEG", "JPG"] {
            aliases.insert(name, PixelFormat::Mjpeg);
        }
        for name in ["H264", "AVC", "AVC1"] {
            aliases.insert(name, PixelFormat::H264);
        }
        for name in ["GRAY8", "GREY", "GRAY", "Y8", "Y800", "MONO8"] {
            aliases.insert(name, PixelFormat::Gray8);
        }
        for name in ["GRAY16", "Y16", "MONO16", "Y16LE"] {
            aliases.insert(name, PixelFormat::Gray16);
        }
        aliases
    };
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 11] = [
        PixelFormat::Rgb,
        PixelFormat::Bgr,
        PixelFormat::Rgba,
        PixelFormat::Yuv420,
        PixelFormat::Nv12,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Mjpeg,
        PixelFormat::H264,
        PixelFormat::Gray8,
        PixelFormat::Gray16,
    ];

    /// Map a backend format string onto the canonical set.
    ///
    /// Case, whitespace, dashes and underscores are ignored, so `"yuy2"`,
    /// `"YUV_420"` and `"RGB3 "` all resolve.
    pub fn canonicalize(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        FORMAT_ALIASES.get(normalized.as_str()).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Rgb => "RGB",
            PixelFormat::Bgr => "BGR",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::H264 => "H264",
            PixelFormat::Gray8 => "GRAY8",
            PixelFormat::Gray16 => "GRAY16",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for PixelFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PixelFormat::canonicalize(&value).ok_or_else(|| format!("unknown pixel format: {}", value))
    }
}

impl From<PixelFormat> for String {
    fn from(format: PixelFormat) -> Self {
        format.as_str().to_string()
    }
}

/// Opaque control range passed through from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlRange {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

/// Identity of a capture mode. fps is held in millihertz so the key can be
/// hashed and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModeKey {
    pub width: u32,
    pub height: u32,
    pub fps_millis: u32,
    pub pixel_format: PixelFormat,
}

impl ModeKey {
    pub fn new(width: u32, height: u32, fps: f64, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            fps_millis: fps_to_millis(fps),
            pixel_format,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps_millis as f64 / 1000.0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for ModeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{} {}",
            self.width,
            self.height,
            self.fps(),
            self.pixel_format
        )
    }
}

pub(crate) fn fps_to_millis(fps: f64) -> u32 {
    if !fps.is_finite() || fps <= 0.0 {
        return 0;
    }
    (fps * 1000.0).round().min(u32::MAX as f64) as u32
}

/// Key used for the per-resolution fps limits map.
pub fn size_key(width: u32, height: u32) -> String {
    format!("{}x{}", width, height)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMode {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pixel_format: PixelFormat,
    #[serde(default)]
    pub controls: BTreeMap<String, ControlRange>,
}

impl CapabilityMode {
    pub fn new(width: u32, height: u32, fps: f64, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            fps,
            pixel_format,
            controls: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ModeKey {
        ModeKey::new(self.width, self.height, self.fps, self.pixel_format)
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.fps.is_finite() && self.fps > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilitySource {
    Probe,
    Cache,
}

/// Largest frame area considered for the default preview mode.
const PREVIEW_AREA_BUDGET: u64 = 1280 * 720;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Deduplicated and ordered by [`ModeKey`].
    pub modes: Vec<CapabilityMode>,
    pub default_preview_mode: ModeKey,
    pub default_record_mode: ModeKey,
    pub probed_at: DateTime<Utc>,
    pub source: CapabilitySource,
    /// `"WxH"` to maximum fps.
    #[serde(default)]
    pub limits: BTreeMap<String, f64>,
}

impl DeviceCapabilities {
    /// Build capabilities from already-canonical modes.
    ///
    /// Invalid modes are dropped and duplicates collapse onto the first
    /// occurrence. Returns `None` when nothing usable remains.
    pub fn from_modes(
        modes: Vec<CapabilityMode>,
        limits: BTreeMap<String, f64>,
        probed_at: DateTime<Utc>,
    ) -> Option<Self> {
        let mut unique: BTreeMap<ModeKey, CapabilityMode> = BTreeMap::new();
        for mode in modes {
            if !mode.is_valid() {
                log::warn!(
                    "Dropping invalid mode {}x{}@{}",
                    mode.width,
                    mode.height,
                    mode.fps
                );
                continue;
            }
            unique.entry(mode.key()).or_insert(mode);
        }
        if unique.is_empty() {
            return None;
        }

        let mut derived: BTreeMap<String, f64> = BTreeMap::new();
        for mode in unique.values() {
            let entry = derived
                .entry(size_key(mode.width, mode.height))
                .or_insert(0.0);
            if mode.fps > *entry {
                *entry = mode.fps;
            }
        }
        for (size, max_fps) in limits {
            if max_fps.is_finite() && max_fps > 0.0 {
                derived.insert(size, max_fps);
            }
        }

        let keys: Vec<ModeKey> = unique.keys().copied().collect();
        let default_record_mode = keys
            .iter()
            .copied()
            .max_by_key(|k| (k.area(), k.fps_millis))?;
        let default_preview_mode = keys
            .iter()
            .copied()
            .filter(|k| k.area() <= PREVIEW_AREA_BUDGET)
            .max_by_key(|k| (k.area(), k.fps_millis))
            .or_else(|| {
                keys.iter()
                    .copied()
                    .min_by_key(|k| (k.area(), std::cmp::Reverse(k.fps_millis)))
            })?;

        Some(Self {
            modes: unique.into_values().collect(),
            default_preview_mode,
            default_record_mode,
            probed_at,
            source: CapabilitySource::Probe,
            limits: derived,
        })
    }

    /// Modes non-empty, valid, sorted by key without duplicates, and both
    /// defaults among them. Holds for anything built by `from_modes`.
    pub fn is_consistent(&self) -> bool {
        !self.modes.is_empty()
            && self.modes.iter().all(CapabilityMode::is_valid)
            && self.modes.windows(2).all(|pair| pair[0].key() < pair[1].key())
            && self.contains(&self.default_preview_mode)
            && self.contains(&self.default_record_mode)
    }

    pub fn contains(&self, key: &ModeKey) -> bool {
        self.mode(key).is_some()
    }

    pub fn mode(&self, key: &ModeKey) -> Option<&CapabilityMode> {
        self.modes
            .binary_search_by(|m| m.key().cmp(key))
            .ok()
            .map(|idx| &self.modes[idx])
    }

    pub fn keys(&self) -> impl Iterator<Item = ModeKey> + '_ {
        self.modes.iter().map(CapabilityMode::key)
    }

    /// Highest fps the device sustains for a mode, honouring the limits map.
    pub fn effective_fps(&self, key: &ModeKey) -> f64 {
        match self.limits.get(&size_key(key.width, key.height)) {
            Some(limit) => key.fps().min(*limit),
            None => key.fps(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedConfig {
    pub preview_mode: ModeKey,
    pub record_mode: ModeKey,
    #[serde(default)]
    pub overlay_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_fps_cap: Option<f64>,
}

impl SelectedConfig {
    pub fn defaults_for(capabilities: &DeviceCapabilities) -> Self {
        Self {
            preview_mode: capabilities.default_preview_mode,
            record_mode: capabilities.default_record_mode,
            overlay_enabled: false,
            target_fps_cap: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Discovered,
    Selected,
    Previewing,
    Recording,
    Error,
    Removed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Discovered => "discovered",
            Lifecycle::Selected => "selected",
            Lifecycle::Previewing => "previewing",
            Lifecycle::Recording => "recording",
            Lifecycle::Error => "error",
            Lifecycle::Removed => "removed",
        }
    }

    /// A capture task is running in these states.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Lifecycle::Previewing | Lifecycle::Recording)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured frame. Immutable once built.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    payload: Bytes,
    frame_number: u64,
    capture_timestamp: Duration,
    sensor_timestamp: Option<u64>,
}

impl FrameRecord {
    pub fn new(
        payload: Bytes,
        frame_number: u64,
        capture_timestamp: Duration,
        sensor_timestamp: Option<u64>,
    ) -> Self {
        Self {
            payload,
            frame_number,
            capture_timestamp,
            sensor_timestamp,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Time since the registry clock started.
    pub fn capture_timestamp(&self) -> Duration {
        self.capture_timestamp
    }

    /// Sensor timestamp in nanoseconds, when the backend provides one.
    pub fn sensor_timestamp(&self) -> Option<u64> {
        self.sensor_timestamp
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub frames_recorded: u64,
    pub last_frame_number: Option<u64>,
    pub measured_fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Capture,
    Preview,
    Record,
    Tap,
    Probe,
}

/// Immutable view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    pub generation: u64,
    pub lifecycle: Lifecycle,
    pub capabilities: Option<DeviceCapabilities>,
    pub selected_config: Option<SelectedConfig>,
    pub active_tasks: Vec<TaskKind>,
    pub last_error: Option<String>,
    pub metrics: FrameMetrics,
    pub probe_failures: u32,
    pub probing_disabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb(width: u32, height: u32, fps: f64) -> CapabilityMode {
        CapabilityMode::new(width, height, fps, PixelFormat::Rgb)
    }

    #[test]
    fn test_pixel_format_aliases() {
        assert_eq!(PixelFormat::canonicalize("RGB3"), Some(PixelFormat::Rgb));
        assert_eq!(PixelFormat::canonicalize("yu12"), Some(PixelFormat::Yuv420));
        assert_eq!(PixelFormat::canonicalize("MJPG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::canonicalize(" yuy2 "), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::canonicalize("YUV_420"), Some(PixelFormat::Yuv420));
        assert_eq!(PixelFormat::canonicalize("Y16"), Some(PixelFormat::Gray16));
        assert_eq!(PixelFormat::canonicalize("BA81"), None);
        assert_eq!(PixelFormat::canonicalize(""), None);
    }

    #[test]
    fn test_every_canonical_name_round_trips() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::canonicalize(format.as_str()), Some(format));
        }
    }

    #[test]
    fn test_pixel_format_serde_uses_canonical_names() {
        let json = serde_json::to_string(&PixelFormat::Yuv420).unwrap();
        assert_eq!(json, "\"YUV420\"");
        let parsed: PixelFormat = serde_json::from_str("\"i420\"").unwrap();
        assert_eq!(parsed, PixelFormat::Yuv420);
        assert!(serde_json::from_str::<PixelFormat>("\"XVID\"").is_err());
    }

    #[test]
    fn test_mode_key_fps_precision() {
        let key = ModeKey::new(1920, 1080, 29.97, PixelFormat::Nv12);
        assert_eq!(key.fps_millis, 29_970);
        assert_eq!(key.to_string(), "1920x1080@29.97 NV12");
        assert_eq!(ModeKey::new(640, 480, 30.0, PixelFormat::Rgb).to_string(), "640x480@30 RGB");
    }

    #[test]
    fn test_capabilities_dedupe_and_order() {
        let caps = DeviceCapabilities::from_modes(
            vec![rgb(1920, 1080, 30.0), rgb(640, 480, 60.0), rgb(1920, 1080, 30.0)],
            BTreeMap::new(),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(caps.modes.len(), 2);
        assert!(caps.modes.windows(2).all(|w| w[0].key() < w[1].key()));
        assert_eq!(caps.default_record_mode, ModeKey::new(1920, 1080, 30.0, PixelFormat::Rgb));
        assert_eq!(caps.default_preview_mode, ModeKey::new(640, 480, 60.0, PixelFormat::Rgb));
        assert_eq!(caps.limits.get("640x480"), Some(&60.0));
    }

    #[test]
    fn test_capabilities_reject_invalid_modes() {
        assert!(DeviceCapabilities::from_modes(
            vec![rgb(0, 480, 30.0), rgb(640, 480, 0.0), rgb(640, 480, f64::NAN)],
            BTreeMap::new(),
            Utc::now(),
        )
        .is_none());
    }

    #[test]
    fn test_preview_default_falls_back_to_smallest() {
        let caps = DeviceCapabilities::from_modes(
            vec![rgb(3840, 2160, 30.0), rgb(1920, 1080, 60.0)],
            BTreeMap::new(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(caps.default_preview_mode.width, 1920);
    }

    #[test]
    fn test_effective_fps_uses_limits() {
        let mut limits = BTreeMap::new();
        limits.insert(size_key(1920, 1080), 24.0);
        let caps =
            DeviceCapabilities::from_modes(vec![rgb(1920, 1080, 30.0)], limits, Utc::now()).unwrap();
        let key = caps.modes[0].key();
        assert_eq!(caps.effective_fps(&key), 24.0);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("USB".parse::<BackendKind>().unwrap(), BackendKind::Usb);
        assert_eq!("mock".parse::<BackendKind>().unwrap(), BackendKind::Mock);
        assert!("firewire".parse::<BackendKind>().is_err());
    }
}
