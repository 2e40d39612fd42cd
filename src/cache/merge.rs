//! Reconciling fresh probe results with what was persisted.

use crate::types::{CapabilitySource, DeviceCapabilities, ModeKey, SelectedConfig};

/// Merge freshly probed capabilities with a cached copy.
///
/// Probed modes, limits and timestamp always win. Cached defaults survive
/// only when the probed mode set still contains them. Applying the merge
/// twice gives the same result as applying it once.
pub fn merge(probed: &DeviceCapabilities, cached: &DeviceCapabilities) -> DeviceCapabilities {
    let keep = |cached_key: ModeKey, probed_key: ModeKey, role: &str| {
        if probed.contains(&cached_key) {
            cached_key
        } else {
            if cached_key != probed_key {
                log::info!(
                    "Cached default {} mode {} no longer offered, using {}",
                    role,
                    cached_key,
                    probed_key
                );
            }
            probed_key
        }
    };

    DeviceCapabilities {
        modes: probed.modes.clone(),
        default_preview_mode: keep(
            cached.default_preview_mode,
            probed.default_preview_mode,
            "preview",
        ),
        default_record_mode: keep(
            cached.default_record_mode,
            probed.default_record_mode,
            "record",
        ),
        probed_at: probed.probed_at,
        source: CapabilitySource::Probe,
        limits: probed.limits.clone(),
    }
}

/// Check a stored selection against current capabilities.
///
/// Returns the selection to use and whether anything had to change.
pub fn reconcile_selection(
    selected: &SelectedConfig,
    capabilities: &DeviceCapabilities,
) -> (SelectedConfig, bool) {
    let mut downgraded = false;
    let mut check = |key: ModeKey, fallback: ModeKey, role: &str| {
        if capabilities.contains(&key) {
            key
        } else {
            log::warn!(
                "Selected {} mode {} no longer supported, reset to {}",
                role,
                key,
                fallback
            );
            downgraded = true;
            fallback
        }
    };

    let preview_mode = check(
        selected.preview_mode,
        capabilities.default_preview_mode,
        "preview",
    );
    let record_mode = check(
        selected.record_mode,
        capabilities.default_record_mode,
        "record",
    );

    let target_fps_cap = selected.target_fps_cap.map(|cap| {
        let ceiling = capabilities.effective_fps(&preview_mode);
        if cap > ceiling {
            downgraded = true;
            ceiling
        } else {
            cap
        }
    });

    (
        SelectedConfig {
            preview_mode,
            record_mode,
            overlay_enabled: selected.overlay_enabled,
            target_fps_cap,
        },
        downgraded,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapabilityMode, PixelFormat};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn caps(modes: &[(u32, u32, f64)], age_days: i64) -> DeviceCapabilities {
        DeviceCapabilities::from_modes(
            modes
                .iter()
                .map(|&(w, h, fps)| CapabilityMode::new(w, h, fps, PixelFormat::Yuyv))
                .collect(),
            BTreeMap::new(),
            Utc::now() - Duration::days(age_days),
        )
        .unwrap()
    }

    #[test]
    fn test_probed_modes_win() {
        let probed = caps(&[(1280, 720, 30.0), (640, 480, 30.0)], 0);
        let mut cached = caps(&[(1920, 1080, 30.0), (1280, 720, 30.0)], 10);
        cached.source = CapabilitySource::Cache;

        let merged = merge(&probed, &cached);
        assert_eq!(merged.modes, probed.modes);
        assert_eq!(merged.probed_at, probed.probed_at);
        assert_eq!(merged.source, CapabilitySource::Probe);
        // cached record default 1920x1080 vanished
        assert_eq!(merged.default_record_mode, probed.default_record_mode);
    }

    #[test]
    fn test_cached_default_retained_when_still_offered() {
        let probed = caps(&[(1280, 720, 30.0), (640, 480, 30.0)], 0);
        let mut cached = probed.clone();
        cached.default_preview_mode = ModeKey::new(640, 480, 30.0, PixelFormat::Yuyv);

        let merged = merge(&probed, &cached);
        assert_eq!(merged.default_preview_mode, cached.default_preview_mode);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let probed = caps(&[(1280, 720, 30.0), (640, 480, 60.0)], 0);
        let cached = caps(&[(1920, 1080, 30.0), (640, 480, 60.0)], 3);
        let once = merge(&probed, &cached);
        assert_eq!(merge(&probed, &once), once);
    }

    #[test]
    fn test_reconcile_selection() {
        let device = caps(&[(1280, 720, 30.0), (640, 480, 30.0)], 0);
        let valid = SelectedConfig {
            preview_mode: ModeKey::new(640, 480, 30.0, PixelFormat::Yuyv),
            record_mode: ModeKey::new(1280, 720, 30.0, PixelFormat::Yuyv),
            overlay_enabled: true,
            target_fps_cap: Some(15.0),
        };
        let (kept, downgraded) = reconcile_selection(&valid, &device);
        assert_eq!(kept, valid);
        assert!(!downgraded);

        let stale = SelectedConfig {
            record_mode: ModeKey::new(3840, 2160, 30.0, PixelFormat::Yuyv),
            target_fps_cap: Some(90.0),
            ..valid.clone()
        };
        let (fixed, downgraded) = reconcile_selection(&stale, &device);
        assert!(downgraded);
        assert_eq!(fixed.record_mode, device.default_record_mode);
        assert_eq!(fixed.target_fps_cap, Some(30.0));
        assert!(fixed.overlay_enabled);
    }
}
