//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nesting levels)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, GEMINI_API_KEY / API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_SESSION__VOICE_NAME, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## The credential:
//! `session.api_key` is an opaque string. The only check ever made on it is
//! that it is not empty; the voice engine refuses to start without it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub visualizer: VisualizerConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote session settings.
///
/// ## Fields:
/// - `api_key`: Opaque credential appended to the endpoint URL
/// - `endpoint`: WebSocket URL of the bidirectional generate-content service
/// - `model`: Model name sent in the setup message (without the `models/` prefix)
/// - `voice_name`: Prebuilt voice the model answers with
/// - `system_instruction`: Persona text for the tutor
/// - `enable_search`: Whether the search tool is offered to the model at open time
/// - `outbound_queue_frames`: Capacity of the outbound frame queue; a full queue drops frames
/// - `open_timeout_ms`: How long to wait for the session to report ready
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub enable_search: bool,
    pub outbound_queue_frames: usize,
    pub open_timeout_ms: u64,
}

/// Audio format settings shared by capture and playback.
///
/// ## Fixed formats:
/// - Capture: mono float samples at `input_sample_rate`, framed `frame_size` at a time
/// - Playback: mono PCM16 payloads at `output_sample_rate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub frame_size: usize,
    pub fft_size: usize,
}

/// Render surface size and sampling rate of the frequency visualizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizerConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
}

pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_TUTOR_INSTRUCTION: &str = "You are a friendly, patient language tutor. \
Speak slowly and clearly, correct mistakes gently, and keep your answers short so the \
learner gets plenty of speaking practice.";

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// The server starts without any configuration file; only the credential has
/// to be supplied before a voice session can be started.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            session: SessionConfig {
                api_key: String::new(),
                endpoint: DEFAULT_ENDPOINT.to_string(),
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice_name: "Orus".to_string(),
                system_instruction: DEFAULT_TUTOR_INSTRUCTION.to_string(),
                enable_search: true,
                outbound_queue_frames: 64,
                open_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                output_channels: 1,
                frame_size: 256,
                fft_size: 256,
            },
            visualizer: VisualizerConfig {
                width: 400,
                height: 100,
                refresh_hz: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSION__VOICE_NAME=Kore`: Override the tutor's voice
    /// - `GEMINI_API_KEY=...` or `API_KEY=...`: Provide the credential
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = env::var("GEMINI_API_KEY").ok().or_else(|| env::var("API_KEY").ok()) {
            settings = settings.set_override("session.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// The credential is deliberately not checked here: the server runs (and
    /// reports the missing key) without one. See `require_credential`.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Session endpoint cannot be empty"));
        }

        if self.session.outbound_queue_frames == 0 {
            return Err(anyhow::anyhow!("Outbound queue must hold at least one frame"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.output_channels == 0 {
            return Err(anyhow::anyhow!("Output channel count must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if !self.audio.fft_size.is_power_of_two() || self.audio.fft_size < 32 {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two of at least 32, got {}",
                self.audio.fft_size
            ));
        }

        if self.visualizer.width == 0 || self.visualizer.height == 0 {
            return Err(anyhow::anyhow!("Visualizer surface cannot be empty"));
        }

        if self.visualizer.refresh_hz == 0 {
            return Err(anyhow::anyhow!("Visualizer refresh rate must be greater than 0"));
        }

        Ok(())
    }

    /// Whether a usable credential is configured.
    pub fn has_credential(&self) -> bool {
        !self.session.api_key.trim().is_empty()
    }

    /// Fail with `MissingCredential` unless a credential is configured.
    pub fn require_credential(&self) -> crate::error::VoiceResult<&str> {
        if self.has_credential() {
            Ok(self.session.api_key.trim())
        } else {
            Err(crate::error::VoiceError::MissingCredential)
        }
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only fields present in the JSON change. The credential and the audio
    /// formats cannot be changed at runtime; they are fixed for the process.
    /// For example, `{"session": {"voice_name": "Kore"}}` changes only the voice.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(session) = partial_config.get("session") {
            if let Some(model) = session.get("model").and_then(|v| v.as_str()) {
                updated.session.model = model.to_string();
            }
            if let Some(voice) = session.get("voice_name").and_then(|v| v.as_str()) {
                updated.session.voice_name = voice.to_string();
            }
            if let Some(instruction) = session.get("system_instruction").and_then(|v| v.as_str()) {
                updated.session.system_instruction = instruction.to_string();
            }
            if let Some(search) = session.get("enable_search").and_then(|v| v.as_bool()) {
                updated.session.enable_search = search;
            }
            if let Some(timeout) = session.get("open_timeout_ms").and_then(|v| v.as_u64()) {
                updated.session.open_timeout_ms = timeout;
            }
        }

        if let Some(visualizer) = partial_config.get("visualizer") {
            if let Some(width) = visualizer.get("width").and_then(|v| v.as_u64()) {
                updated.visualizer.width = width as u32;
            }
            if let Some(height) = visualizer.get("height").and_then(|v| v.as_u64()) {
                updated.visualizer.height = height as u32;
            }
            if let Some(refresh) = visualizer.get("refresh_hz").and_then(|v| v.as_u64()) {
                updated.visualizer.refresh_hz = refresh as u32;
            }
        }

        // Only commit once the whole update is known to be valid
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
