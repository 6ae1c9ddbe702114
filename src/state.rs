//! # Application State Management
//!
//! Shared state that every HTTP request handler and the voice engine can reach.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many handlers and tasks share ownership of the same data
//! - **Memory safety**: The data is freed when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Why needed**: Status and metrics endpoints read while the engine writes
//!
//! ## What lives here:
//! - **config**: the loaded configuration (partially updatable at runtime)
//! - **engine**: handle to the running voice engine task
//! - **metrics**: counters updated by capture, session and playback code
//! - **bridge**: the browser audio bridge that pages attach to

use crate::bridge::BridgeBackend;
use crate::config::AppConfig;
use crate::lifecycle::EngineHandle;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Counters describing what the voice core has done since startup.
///
/// ## Why these metrics matter:
/// - **send_failures** vs **frames_sent**: how often capture outran the network
/// - **microphone_overruns**: blocks the page delivered faster than capture consumed them
/// - **decode_failures**: malformed payloads from the remote side
/// - **interruptions**: how often the tutor was cut off by the learner
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineMetrics {
    pub sessions_started: u64,
    pub fatal_errors: u64,
    pub microphone_overruns: u64,
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub payloads_received: u64,
    pub units_scheduled: u64,
    pub units_ended: u64,
    pub decode_failures: u64,
    pub interruptions: u64,
}

/// Cloneable, thread-safe handle to the engine metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder {
    inner: Arc<RwLock<EngineMetrics>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update under the write lock.
    ///
    /// ## Usage:
    /// ```rust
    /// metrics.update(|m| m.frames_sent += 1);
    /// ```
    pub fn update(&self, f: impl FnOnce(&mut EngineMetrics)) {
        let mut metrics = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut metrics);
    }

    /// Copy of the current counters, so no lock is held while serializing.
    pub fn snapshot(&self) -> EngineMetrics {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// The main application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (partially updatable at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Handle to the voice engine's control task
    pub engine: EngineHandle,

    /// Counters shared with the engine
    pub metrics: MetricsRecorder,

    /// Browser bridge acting as microphone, speaker and render surface
    pub bridge: BridgeBackend,

    /// When the server started (never changes)
    pub start_time: Instant,
}

impl AppState {
    /// The config lock is the same one the engine reads at session start,
    /// so runtime updates apply to the next session.
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        engine: EngineHandle,
        metrics: MetricsRecorder,
        bridge: BridgeBackend,
    ) -> Self {
        Self {
            config,
            engine,
            metrics,
            bridge,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recorder_shared_between_clones() {
        let metrics = MetricsRecorder::new();
        let writer = metrics.clone();
        writer.update(|m| m.frames_sent += 3);
        writer.update(|m| m.send_failures += 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 3);
        assert_eq!(snapshot.send_failures, 1);
    }
}
