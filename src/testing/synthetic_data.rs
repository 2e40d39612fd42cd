//! Synthetic frames and probe reports
//!
//! Lets the mock backend and the test suite run without hardware. The UVC
//! profile below mirrors what a typical 4K USB webcam reports through V4L2,
//! including a Bayer format the canonical set does not cover.

use crate::backend::{ProbeReport, RawMode};
use crate::types::ControlRange;
use bytes::Bytes;

/// Gradient payload that changes every frame.
///
/// The first eight bytes carry the frame sequence (little endian), so a
/// consumer can tell frames apart without decoding anything.
pub fn synthetic_payload(sequence: u64, width: u32, len: usize) -> Bytes {
    let len = len.max(8);
    let width = width.max(1) as usize;
    let base = (sequence % 256) as u8;
    let mut data = vec![0u8; len];
    for (idx, byte) in data.iter_mut().enumerate().skip(8) {
        let x = idx % width;
        let y = idx / width;
        *byte = base.wrapping_add((x % 256) as u8).wrapping_add((y % 256) as u8);
    }
    data[..8].copy_from_slice(&sequence.to_le_bytes());
    Bytes::from(data)
}

/// Two RGB modes: 1920x1080@30 and 640x480@60.
pub fn reference_probe_report() -> ProbeReport {
    ProbeReport::new(vec![
        RawMode::new(1920, 1080, 30.0, "RGB3"),
        RawMode::new(640, 480, 60.0, "RGB3"),
    ])
}

/// Mode list of a 4K UVC webcam as reported through V4L2.
pub fn uvc_4k_probe_report() -> ProbeReport {
    let mut brightness = std::collections::BTreeMap::new();
    brightness.insert(
        "brightness".to_string(),
        ControlRange {
            min: -64.0,
            max: 64.0,
            default: 0.0,
        },
    );
    let with_controls = |mut mode: RawMode| {
        mode.controls = brightness.clone();
        mode
    };

    let mut report = ProbeReport::new(vec![
        with_controls(RawMode::new(3840, 2160, 30.0, "MJPG")),
        with_controls(RawMode::new(1920, 1080, 60.0, "MJPG")),
        with_controls(RawMode::new(1920, 1080, 30.0, "MJPG")),
        with_controls(RawMode::new(1280, 720, 60.0, "MJPG")),
        with_controls(RawMode::new(1920, 1080, 5.0, "YUYV")),
        with_controls(RawMode::new(640, 480, 30.0, "YUYV")),
        with_controls(RawMode::new(3840, 2160, 15.0, "BA81")),
    ]);
    report
        .limits
        .insert(crate::types::size_key(3840, 2160), 25.0);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_payload_size_and_sequence() {
        let payload = synthetic_payload(42, 640, 4096);
        assert_eq!(payload.len(), 4096);
        assert_eq!(u64::from_le_bytes(payload[..8].try_into().unwrap()), 42);
        assert_eq!(synthetic_payload(1, 640, 0).len(), 8);
    }

    #[test]
    fn test_payloads_differ_between_frames() {
        let a = synthetic_payload(1, 320, 1024);
        let b = synthetic_payload(2, 320, 1024);
        assert_ne!(a[100], b[100]);
    }

    #[test]
    fn test_uvc_profile_canonicalizes() {
        let caps = uvc_4k_probe_report().into_capabilities(Utc::now()).unwrap();
        // BA81 is dropped
        assert_eq!(caps.modes.len(), 6);
        assert_eq!(caps.default_record_mode.width, 3840);
        assert_eq!(caps.default_preview_mode.width, 1280);
        assert_eq!(caps.effective_fps(&caps.default_record_mode), 25.0);
        assert!(caps.modes.iter().all(|m| m.controls.contains_key("brightness")));
    }
}
