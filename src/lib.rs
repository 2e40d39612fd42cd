//! crabrig: device lifecycle core for supervised capture modules
//!
//! This crate discovers capture devices, probes and caches what they can do,
//! drives each one through a small lifecycle state machine and moves frames
//! through bounded buffers, all behind a line-delimited JSON protocol that a
//! parent process speaks over stdin/stdout.
//!
//! # Features
//! - Hotplug-aware discovery with debounced loss reporting
//! - Capability probing with backoff and an on-disk JSON cache
//! - Nearest-mode clamping with explicit downgrade warnings
//! - Bounded frame buffers with drop accounting
//! - Pluggable backends (scriptable mock, V4L2 behind the `v4l2` feature)
//!
//! # Usage
//! ```rust,no_run
//! use crabrig::backend::{BackendSet, MockBackend};
//! use crabrig::cache::CapabilityCache;
//! use crabrig::registry::{DeviceRegistry, RegistrySettings};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), crabrig::TransitionFailure> {
//! let backends = BackendSet::new().with(Arc::new(MockBackend::with_reference_devices(1)));
//! let cache = Arc::new(CapabilityCache::in_memory());
//! let (registry, _events) = DeviceRegistry::spawn(RegistrySettings::default(), backends, cache);
//! registry.discover_now().await?;
//! for device in registry.devices().await? {
//!     println!("{} is {}", device.identity.stable_id, device.lifecycle);
//! }
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```
pub mod backend;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod errors;
pub mod invariant_ppt;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod selection;
pub mod timing;
pub mod types;

// Testing utilities - synthetic payloads and probe reports
pub mod testing;

// Re-exports for convenience
pub use buffer::{AdmissionPolicy, FrameBuffer};
pub use config::RigConfig;
pub use errors::{BackendError, RigError, TransitionFailure};
pub use registry::{DeviceRegistry, RegistryEvent, RegistrySettings};
pub use types::{
    BackendKind, DeviceCapabilities, DeviceIdentity, DeviceSnapshot, FrameRecord, Lifecycle,
    ModeKey, PixelFormat, SelectedConfig,
};

/// Initialize logging. Output goes to stderr; stdout carries the protocol.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("crabrig=info");
    let _ = env_logger::Builder::from_env(env)
        .target(env_logger::Target::Stderr)
        .try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        backends: compiled_backends(),
    }
}

/// Backends built into this binary.
pub fn compiled_backends() -> Vec<BackendKind> {
    let mut kinds = vec![BackendKind::Mock];
    if cfg!(all(target_os = "linux", feature = "v4l2")) {
        kinds.extend([BackendKind::Usb, BackendKind::Csi]);
    }
    kinds
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub backends: Vec<BackendKind>,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "crabrig");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
        assert!(info.backends.contains(&BackendKind::Mock));
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
