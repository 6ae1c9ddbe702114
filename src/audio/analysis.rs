//! # Analysis Tap
//!
//! A passive side-branch on an audio path that keeps the most recent window
//! of samples and turns it into frequency-domain magnitudes on demand.
//! Capture and playback push samples into their tap without waiting on
//! anything; the visualizer reads from it once per display refresh.
//!
//! ## Magnitude scaling:
//! 1. Blackman window over the last `fft_size` samples
//! 2. Forward FFT, magnitude normalized by `fft_size`
//! 3. Exponential smoothing across reads (time constant 0.8)
//! 4. Converted to decibels and mapped from [-100 dB, -30 dB] onto 0..=255

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

/// Which audio path a tap (or a render surface) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapSource {
    Input,
    Output,
}

impl TapSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TapSource::Input => "input",
            TapSource::Output => "output",
        }
    }
}

struct TapState {
    window: VecDeque<f32>,
    smoothed: Vec<f32>,
    coefficients: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    closed: bool,
}

/// Shared handle to one analysis tap. Cloning shares the same window.
#[derive(Clone)]
pub struct AnalysisTap {
    source: TapSource,
    state: Arc<Mutex<TapState>>,
}

impl fmt::Debug for AnalysisTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisTap")
            .field("source", &self.source)
            .field("fft_size", &self.fft_size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AnalysisTap {
    /// Create a tap analysing `fft_size` samples (a power of two).
    pub fn new(source: TapSource, fft_size: usize) -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
        Self {
            source,
            state: Arc::new(Mutex::new(TapState {
                window: VecDeque::from(vec![0.0; fft_size]),
                smoothed: vec![0.0; fft_size / 2],
                coefficients: blackman_window(fft_size),
                fft,
                fft_size,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn source(&self) -> TapSource {
        self.source
    }

    pub fn fft_size(&self) -> usize {
        self.lock().fft_size
    }

    /// Feed samples into the tap. Ignored once the tap is closed.
    pub fn push(&self, samples: &[f32]) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let fft_size = state.fft_size;
        // Only the newest fft_size samples can ever matter
        let tail = &samples[samples.len().saturating_sub(fft_size)..];
        for &sample in tail {
            state.window.pop_front();
            state.window.push_back(sample);
        }
    }

    /// Byte-scaled magnitudes for the current window, or `None` when the tap
    /// has been closed (its audio path is gone).
    pub fn frequency_data(&self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }

        let fft_size = state.fft_size;
        let mut buffer: Vec<Complex<f32>> = state
            .window
            .iter()
            .zip(state.coefficients.iter())
            .map(|(&sample, &w)| Complex::new(sample * w, 0.0))
            .collect();
        state.fft.process(&mut buffer);

        let TapState { smoothed, .. } = &mut *state;
        let bytes = smoothed
            .iter_mut()
            .zip(buffer.iter())
            .map(|(previous, bin)| {
                let magnitude = bin.norm() / fft_size as f32;
                *previous = SMOOTHING * *previous + (1.0 - SMOOTHING) * magnitude;
                to_byte(*previous)
            })
            .collect();
        Some(bytes)
    }

    /// Detach the tap; later reads return `None` and pushes are dropped.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.window.iter_mut().for_each(|s| *s = 0.0);
        state.smoothed.iter_mut().for_each(|s| *s = 0.0);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    let (a0, a1, a2) = (0.42f32, 0.5f32, 0.08f32);
    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}
