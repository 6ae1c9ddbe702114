//! # Remote Session
//!
//! - **adapter**: the session contract the engine codes against
//! - **gemini**: the Gemini Live WebSocket implementation

pub mod adapter;
pub mod gemini;
