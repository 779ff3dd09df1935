//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod scripted;
pub mod socket_guard;

use std::path::Path;
use std::time::Duration;

use mediafetch_core::EngineConfig;

/// Engine configuration with short timings for tests.
pub fn fast_config(output_dir: &Path) -> EngineConfig {
    EngineConfig {
        workers: 4,
        global_ceiling: 8,
        per_origin_ceiling: 2,
        permit_timeout: Duration::from_secs(5),
        attempt_timeout: Duration::from_secs(5),
        resolution_deadline: Duration::from_secs(30),
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(100),
        retry_jitter: Duration::ZERO,
        backoff_min: Duration::from_millis(10),
        backoff_max: Duration::from_secs(1),
        output_dir: output_dir.to_path_buf(),
        ..EngineConfig::default()
    }
}
