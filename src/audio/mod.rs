//! # Audio Module
//!
//! Everything that touches sample data inside the voice core.
//!
//! ## Key Components:
//! - **Frame**: captured frames, wire chunks, decoded buffers and the PCM16/base64 codec
//! - **Capture**: fixed-size framing and forwarding of microphone audio
//! - **Scheduler**: gapless placement of tutor audio on the output timeline
//! - **Analysis**: FFT taps on the input and output paths
//! - **Visualizer**: bar graphs drawn from the taps at display rate
//!
//! ## Audio Formats:
//! - **Capture**: 16 kHz mono, 16-bit PCM little-endian on the wire
//! - **Playback**: 24 kHz mono, 16-bit PCM little-endian on the wire

pub mod analysis;
pub mod capture;
pub mod frame;
pub mod scheduler;
pub mod visualizer;
