//! # Capture Pipeline
//!
//! Moves microphone audio to the remote session while the session is live:
//!
//! ```text
//! mic blocks ──▶ input tap (visualizer)
//!            └─▶ Framer ──AudioFrame──▶ encode ──EncodedChunk──▶ session.send
//! ```
//!
//! ## Framing:
//! The microphone delivers blocks of arbitrary length. `Framer` accumulates
//! them and emits fixed-size frames in capture order; a partial frame left
//! over when capture stops is discarded.
//!
//! ## Failure handling:
//! A failed send is counted and logged, then capture carries on with the next
//! frame. A single dropped frame never ends the session. A microphone stream
//! that ends while the session is live is reported to the caller, which treats
//! it as a lost device.

use crate::audio::analysis::AnalysisTap;
use crate::audio::frame::{AudioFrame, EncodedChunk};
use crate::session::adapter::SessionAdapter;
use crate::state::MetricsRecorder;
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Accumulates microphone samples into fixed-size frames.
///
/// ## Memory Management:
/// Holds at most one frame's worth of samples between calls; everything
/// complete is drained into frames immediately.
pub struct Framer {
    pending: VecDeque<f32>,
    frame_size: usize,
    sample_rate: u32,
}

impl Framer {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            pending: VecDeque::with_capacity(frame_size * 2),
            frame_size: frame_size.max(1),
            sample_rate,
        }
    }

    /// Add a block of samples and return every frame it completes.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend(samples.iter().copied());

        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_size);
        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(AudioFrame::new(frame, self.sample_rate));
        }
        frames
    }

    /// Samples waiting for the next frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Why capture stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    /// The session stopped capture
    Stopped,
    /// The microphone went away while the session was still live
    MicrophoneLost,
}

/// Forward microphone audio to `session` until `live` turns false, its sender
/// is dropped, or the microphone stream ends.
pub async fn run_capture(
    mut samples: mpsc::Receiver<Vec<f32>>,
    mut framer: Framer,
    tap: AnalysisTap,
    session: SessionAdapter,
    metrics: MetricsRecorder,
    mut live: watch::Receiver<bool>,
) -> CaptureEnd {
    debug!("Capture started");
    let mut end = CaptureEnd::Stopped;
    loop {
        if !*live.borrow() {
            break;
        }
        tokio::select! {
            block = samples.recv() => {
                let Some(block) = block else {
                    if *live.borrow() {
                        warn!("Microphone stream ended while live");
                        end = CaptureEnd::MicrophoneLost;
                    }
                    break;
                };
                tap.push(&block);

                for frame in framer.push(&block) {
                    // Re-check between frames so a stop takes effect mid-block
                    if !*live.borrow() {
                        break;
                    }
                    metrics.update(|m| m.frames_captured += 1);
                    match session.send(EncodedChunk::encode(frame)).await {
                        Ok(()) => metrics.update(|m| m.frames_sent += 1),
                        Err(e) => {
                            metrics.update(|m| m.send_failures += 1);
                            warn!("Dropped capture frame: {}", e);
                        }
                    }
                }
            }
            changed = live.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    framer.clear();
    debug!(?end, "Capture stopped");
    end
}
