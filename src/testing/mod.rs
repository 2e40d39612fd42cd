//! Testing utilities for crabrig
//!
//! Synthetic payloads and probe reports for running the registry offline.

pub mod synthetic_data;

pub use synthetic_data::{reference_probe_report, synthetic_payload, uvc_4k_probe_report};
