//! Resolving requested modes against what a device supports.
//!
//! Clamping never fails: an unsupported request resolves to the nearest
//! supported mode and carries a [`DowngradeWarning`] describing the change.

use crate::types::{DeviceCapabilities, ModeKey, PixelFormat, SelectedConfig};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// Two fps values closer than this are treated as equal.
const FPS_TOLERANCE_MILLIS: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeRequest {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub pixel_format: Option<PixelFormat>,
}

impl ModeRequest {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fps: None,
            pixel_format: None,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = Some(format);
        self
    }

    fn describe(&self) -> String {
        let mut text = format!("{}x{}", self.width, self.height);
        if let Some(fps) = self.fps {
            text.push_str(&format!("@{}", fps));
        }
        if let Some(format) = self.pixel_format {
            text.push_str(&format!(" {}", format));
        }
        text
    }
}

/// Everything a `select` request may ask for. Absent roles keep the previous
/// selection when it is still valid, otherwise the device defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigRequest {
    #[serde(default)]
    pub preview: Option<ModeRequest>,
    #[serde(default)]
    pub record: Option<ModeRequest>,
    #[serde(default)]
    pub overlay_enabled: Option<bool>,
    #[serde(default)]
    pub target_fps_cap: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeRole {
    Preview,
    Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DowngradeWarning {
    pub role: ModeRole,
    pub requested: String,
    pub resolved: ModeKey,
    pub reason: String,
}

/// Result of a successful selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub config: SelectedConfig,
    pub warnings: Vec<DowngradeWarning>,
}

/// Pick the supported mode nearest to `request`.
///
/// Order of preference: exact match; the largest mode that fits inside the
/// requested size (closest fps, then higher fps); the smallest mode larger
/// than the request. A requested pixel format narrows the candidates unless
/// the device does not offer it at all.
pub fn select_mode(
    capabilities: &DeviceCapabilities,
    request: &ModeRequest,
    role: ModeRole,
) -> (ModeKey, Option<DowngradeWarning>) {
    let all: Vec<ModeKey> = capabilities.keys().collect();
    let mut reasons = Vec::new();

    let candidates: Vec<ModeKey> = match request.pixel_format {
        Some(format) => {
            let matching: Vec<ModeKey> =
                all.iter().copied().filter(|k| k.pixel_format == format).collect();
            if matching.is_empty() {
                reasons.push(format!("pixel format {} not offered", format));
                all.clone()
            } else {
                matching
            }
        }
        None => all.clone(),
    };

    let wanted_fps = request.fps.map(crate::types::fps_to_millis);
    let fps_distance = |key: &ModeKey| match wanted_fps {
        Some(wanted) => key.fps_millis.abs_diff(wanted),
        None => u32::MAX - key.fps_millis,
    };

    let exact = candidates
        .iter()
        .copied()
        .filter(|k| k.width == request.width && k.height == request.height)
        .filter(|k| match wanted_fps {
            Some(wanted) => k.fps_millis.abs_diff(wanted) <= FPS_TOLERANCE_MILLIS,
            None => true,
        })
        .max_by_key(|k| k.fps_millis);

    let resolved = match exact {
        Some(key) => key,
        None => {
            let fitting = candidates
                .iter()
                .copied()
                .filter(|k| k.width <= request.width && k.height <= request.height)
                .max_by_key(|k| (k.area(), Reverse(fps_distance(k)), k.fps_millis));
            match fitting {
                Some(key) => key,
                None => candidates
                    .iter()
                    .copied()
                    .min_by_key(|k| (k.area(), fps_distance(k), Reverse(k.fps_millis)))
                    .unwrap_or(capabilities.default_preview_mode),
            }
        }
    };

    if resolved.width != request.width || resolved.height != request.height {
        reasons.push(format!(
            "{}x{} not supported",
            request.width, request.height
        ));
    }
    if let Some(wanted) = wanted_fps {
        if resolved.fps_millis.abs_diff(wanted) > FPS_TOLERANCE_MILLIS {
            reasons.push(format!("{} fps not supported at this size", wanted as f64 / 1000.0));
        }
    }

    let warning = (!reasons.is_empty()).then(|| {
        log::info!(
            "Clamped {:?} request {} to {}",
            role,
            request.describe(),
            resolved
        );
        DowngradeWarning {
            role,
            requested: request.describe(),
            resolved,
            reason: reasons.join("; "),
        }
    });
    (resolved, warning)
}

/// Resolve a full configuration request.
///
/// `previous` is the last selection for the device (live or cached); roles
/// the request leaves out keep it when it is still valid.
pub fn resolve_config(
    capabilities: &DeviceCapabilities,
    request: &ConfigRequest,
    previous: Option<&SelectedConfig>,
) -> Selection {
    let mut warnings = Vec::new();

    let mut resolve_role = |wanted: Option<&ModeRequest>, prior: Option<ModeKey>, role: ModeRole| {
        match wanted {
            Some(mode) => {
                let (key, warning) = select_mode(capabilities, mode, role);
                warnings.extend(warning);
                key
            }
            None => {
                let fallback = match role {
                    ModeRole::Preview => capabilities.default_preview_mode,
                    ModeRole::Record => capabilities.default_record_mode,
                };
                match prior {
                    Some(key) if capabilities.contains(&key) => key,
                    Some(key) => {
                        warnings.push(DowngradeWarning {
                            role,
                            requested: key.to_string(),
                            resolved: fallback,
                            reason: "previous selection no longer supported".to_string(),
                        });
                        fallback
                    }
                    None => fallback,
                }
            }
        }
    };

    let preview_mode = resolve_role(
        request.preview.as_ref(),
        previous.map(|p| p.preview_mode),
        ModeRole::Preview,
    );
    let record_mode = resolve_role(
        request.record.as_ref(),
        previous.map(|p| p.record_mode),
        ModeRole::Record,
    );

    let overlay_enabled = request
        .overlay_enabled
        .or(previous.map(|p| p.overlay_enabled))
        .unwrap_or(false);

    let wanted_cap = request
        .target_fps_cap
        .or(previous.and_then(|p| p.target_fps_cap));
    let target_fps_cap = match wanted_cap {
        Some(cap) if cap.is_finite() && cap > 0.0 => {
            let ceiling = capabilities.effective_fps(&preview_mode);
            if cap > ceiling {
                Some(ceiling)
            } else {
                Some(cap)
            }
        }
        Some(cap) => {
            log::warn!("Ignoring invalid target fps cap {}", cap);
            None
        }
        None => None,
    };

    Selection {
        config: SelectedConfig {
            preview_mode,
            record_mode,
            overlay_enabled,
            target_fps_cap,
        },
        warnings,
    }
}
