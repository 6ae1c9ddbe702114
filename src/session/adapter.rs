//! # Session Adapter
//!
//! The contract between the voice core and the remote model session.
//!
//! ## Pieces:
//! - **SessionConnector**: opens a session, asynchronously
//! - **SessionLink**: the open connection (send frames, close)
//! - **SessionEvent**: everything the remote side tells us, delivered in order
//!   on the event channel handed to `open`
//! - **SessionAdapter**: wrapper the rest of the engine uses; makes `close`
//!   idempotent and infallible from the caller's point of view
//!
//! ## Event ordering:
//! `Opened` is delivered before any `Message`; messages arrive in exactly the
//! order the remote side emitted them; nothing is batched or reordered here.

use crate::audio::frame::{EncodedChunk, InboundAudioPayload};
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Everything needed to open one session.
#[derive(Clone)]
pub struct SessionSettings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub enable_search: bool,
    pub input_sample_rate: u32,
    pub outbound_queue_frames: usize,
    pub open_timeout: Duration,
}

impl SessionSettings {
    /// Build settings from the current configuration. Fails with
    /// `MissingCredential` when no API key is configured.
    pub fn from_config(config: &AppConfig) -> VoiceResult<Self> {
        let api_key = config.require_credential()?.to_string();
        Ok(Self {
            endpoint: config.session.endpoint.clone(),
            api_key,
            model: config.session.model.clone(),
            voice_name: config.session.voice_name.clone(),
            system_instruction: config.session.system_instruction.clone(),
            enable_search: config.session.enable_search,
            input_sample_rate: config.audio.input_sample_rate,
            outbound_queue_frames: config.session.outbound_queue_frames,
            open_timeout: Duration::from_millis(config.session.open_timeout_ms),
        })
    }
}

// Never print the credential
impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("voice_name", &self.voice_name)
            .field("enable_search", &self.enable_search)
            .field("input_sample_rate", &self.input_sample_rate)
            .field("outbound_queue_frames", &self.outbound_queue_frames)
            .field("open_timeout", &self.open_timeout)
            .finish()
    }
}

/// Content of one inbound server message.
///
/// A single message may carry audio, an interruption marker, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMessage {
    /// Audio payloads, in the order the message lists them
    pub audio: Vec<InboundAudioPayload>,
    pub interrupted: bool,
    pub turn_complete: bool,
    /// Transcription of what the learner said
    pub input_transcript: Option<String>,
    /// Transcription of what the tutor said
    pub output_transcript: Option<String>,
}

impl ServerMessage {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
            && !self.interrupted
            && !self.turn_complete
            && self.input_transcript.is_none()
            && self.output_transcript.is_none()
    }
}

/// Inbound notifications from the remote session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Session is ready; capture may start
    Opened,
    Message(ServerMessage),
    /// Remote side closed the session
    Closed { reason: Option<String> },
    /// Fatal transport or protocol error
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// An open session.
pub trait SessionLink: Send + Sync {
    /// Queue one chunk for delivery. Resolves with `SendFailure` if the chunk
    /// could not be queued; never waits on the network.
    fn send(&self, chunk: EncodedChunk) -> BoxFuture<'_, VoiceResult<()>>;

    fn close(&self) -> BoxFuture<'_, VoiceResult<()>>;
}

/// Opens sessions against a remote endpoint.
pub trait SessionConnector: Send + Sync {
    /// Open a session. Resolves once the session is ready (after `Opened` has
    /// been posted to `events`) or with `SessionOpenFailure`.
    fn open(
        &self,
        settings: SessionSettings,
        events: EventSender,
    ) -> BoxFuture<'_, VoiceResult<Arc<dyn SessionLink>>>;
}

/// The engine's handle on an open session.
#[derive(Clone)]
pub struct SessionAdapter {
    link: Arc<dyn SessionLink>,
    closed: Arc<AtomicBool>,
}

impl SessionAdapter {
    pub fn new(link: Arc<dyn SessionLink>) -> Self {
        Self {
            link,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hand a chunk to the session. Fails with `SendFailure` once closed.
    pub async fn send(&self, chunk: EncodedChunk) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::SendFailure("session is closed".to_string()));
        }
        self.link.send(chunk).await
    }

    /// Close the session. Only the first call reaches the link; errors are
    /// logged and swallowed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.link.close().await {
            Ok(()) => debug!("Session closed"),
            Err(e) => warn!("Error while closing session: {}", e),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
