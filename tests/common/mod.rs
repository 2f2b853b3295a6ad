//! Shared helpers for the scenario tests.
#![allow(dead_code)]

use blockline::config::{DirectMode, DiskConfig};

pub const MIB: usize = 1 << 20;

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Disk descriptor for a test file, with buffered I/O so the suite runs on
/// any filesystem, and an explicit device id to keep statistics and queues
/// of concurrent tests apart.
pub fn disk(path: std::path::PathBuf, size: u64, device: u32) -> DiskConfig {
    let mut cfg = DiskConfig::new(path, size).direct(DirectMode::Off);
    cfg.device_id = Some(device);
    cfg
}
