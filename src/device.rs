//! # Host Audio Devices
//!
//! Abstractions over the host audio hardware the voice core needs:
//! - **Microphone stream**: permission-gated capture producing raw sample blocks
//! - **Input context**: the capture-rate processing context with its analysis tap
//! - **Output context**: the playback-rate context that owns the output clock and
//!   plays scheduled units at exact timeline positions
//!
//! The core never talks to a sound card directly; an `AudioBackend` supplies
//! these pieces. The browser bridge (`crate::bridge`) is the production backend.

use crate::audio::analysis::{AnalysisTap, TapSource};
use crate::audio::frame::PcmBuffer;
use crate::audio::visualizer::RenderSurface;
use crate::error::VoiceResult;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier of one scheduled playback unit.
pub type UnitId = u64;

/// Shared count of live capture tracks.
///
/// The producer side checks `is_live` before delivering samples, so stopping
/// the tracks also stops sample delivery.
#[derive(Debug, Clone, Default)]
pub struct TrackSet {
    active: Arc<AtomicUsize>,
}

impl TrackSet {
    pub fn new(tracks: usize) -> Self {
        Self { active: Arc::new(AtomicUsize::new(tracks)) }
    }

    pub fn active_tracks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.active_tracks() > 0
    }

    /// Stop every track. Safe to call repeatedly.
    pub fn stop_all(&self) {
        let previous = self.active.swap(0, Ordering::SeqCst);
        if previous > 0 {
            debug!("Stopped {} capture track(s)", previous);
        }
    }
}

/// A granted microphone stream.
///
/// `samples` yields blocks of mono float samples of arbitrary length at the
/// requested rate; the capture pipeline re-frames them.
#[derive(Debug)]
pub struct MicrophoneStream {
    pub samples: mpsc::Receiver<Vec<f32>>,
    pub tracks: TrackSet,
    pub sample_rate: u32,
}

/// Capture-rate processing context.
#[derive(Debug, Clone)]
pub struct InputContext {
    sample_rate: u32,
    tap: AnalysisTap,
    closed: Arc<AtomicBool>,
}

impl InputContext {
    pub fn new(sample_rate: u32, fft_size: usize) -> Self {
        Self {
            sample_rate,
            tap: AnalysisTap::new(TapSource::Input, fft_size),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn analysis_tap(&self) -> AnalysisTap {
        self.tap.clone()
    }

    /// Close the context and detach its tap. Safe to call repeatedly.
    pub fn close(&self) -> VoiceResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.tap.close();
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Notification that a unit finished playing on its own.
///
/// Handed to the output context with each unit; firing it posts the unit id
/// back to the scheduler's queue.
#[derive(Debug)]
pub struct EndedSignal {
    unit: UnitId,
    tx: mpsc::UnboundedSender<UnitId>,
}

impl EndedSignal {
    pub fn new(unit: UnitId, tx: mpsc::UnboundedSender<UnitId>) -> Self {
        Self { unit, tx }
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn fire(self) {
        // The scheduler may already be gone during teardown
        let _ = self.tx.send(self.unit);
    }
}

/// Playback-rate context owning the output clock.
pub trait OutputContext: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Current position of the output clock in seconds.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `start_at` on the output clock. A start time
    /// already in the past plays immediately. `ended` fires when playback
    /// finishes naturally; it is not fired for units stopped via `stop_unit`.
    fn start_unit(
        &self,
        unit: UnitId,
        buffer: Arc<PcmBuffer>,
        start_at: f64,
        ended: EndedSignal,
    ) -> VoiceResult<()>;

    /// Stop a unit immediately. Stopping an unknown or finished unit is a no-op.
    fn stop_unit(&self, unit: UnitId);

    fn analysis_tap(&self) -> AnalysisTap;

    /// Close the context, stopping anything still playing. Safe to call repeatedly.
    fn close(&self) -> VoiceResult<()>;

    fn is_closed(&self) -> bool;
}

/// Source of microphones, audio contexts and render surfaces.
pub trait AudioBackend: Send + Sync {
    /// Ask for microphone access. Fails with `PermissionDenied` or `DeviceUnavailable`.
    fn request_microphone(&self, sample_rate: u32) -> BoxFuture<'_, VoiceResult<MicrophoneStream>>;

    fn open_input_context(&self, sample_rate: u32, fft_size: usize) -> VoiceResult<InputContext>;

    fn open_output_context(
        &self,
        sample_rate: u32,
        channels: u16,
        fft_size: usize,
    ) -> VoiceResult<Arc<dyn OutputContext>>;

    /// Drawing surface for the visualizer of one audio path, if the UI has one.
    fn render_surface(&self, source: TapSource) -> Option<Box<dyn RenderSurface>>;
}
