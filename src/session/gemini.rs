//! # Gemini Live Session
//!
//! `SessionConnector` for the Gemini Live bidirectional streaming endpoint.
//!
//! ## Connection flow:
//! 1. Connect the WebSocket at `{endpoint}?key={api_key}`
//! 2. Send the `setup` message (model, voice, system instruction, tools)
//! 3. Wait for `setupComplete`; only then is the session open
//! 4. Split the socket: a writer task drains a bounded outbound queue, a
//!    reader task turns server frames into `SessionEvent`s
//!
//! ## Message format (JSON over text or binary frames):
//! ```json
//! // client → server, one per captured frame
//! {"realtimeInput": {"audio": {"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}}}
//!
//! // server → client
//! {"serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "<base64>"}}]}}}
//! {"serverContent": {"interrupted": true}}
//! {"serverContent": {"turnComplete": true}}
//! ```

use crate::audio::frame::{EncodedChunk, InboundAudioPayload};
use crate::error::{VoiceError, VoiceResult};
use crate::session::adapter::{
    EventSender, ServerMessage, SessionConnector, SessionEvent, SessionLink, SessionSettings,
};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// How long the writer may take to flush and close once a close is queued.
const WRITER_CLOSE_GRACE: Duration = Duration::from_secs(2);

// ---- Outbound wire types ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: Empty,
}

#[derive(Debug, Default, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
struct RealtimeInput<'a> {
    audio: Blob<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: &'a str,
    data: &'a str,
}

// ---- Inbound wire types ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// What one server frame means to the session.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    SetupComplete,
    Content(ServerMessage),
    GoAway(Option<String>),
    /// Tool calls, usage metadata and anything else the voice core ignores
    Ignored,
}

fn setup_message(settings: &SessionSettings) -> SetupMessage {
    let model = if settings.model.starts_with("models/") {
        settings.model.clone()
    } else {
        format!("models/{}", settings.model)
    };
    let tools = if settings.enable_search {
        vec![Tool { google_search: Empty {} }]
    } else {
        Vec::new()
    };

    SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: settings.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart { text: settings.system_instruction.clone() }],
            },
            tools,
            input_audio_transcription: Empty {},
            output_audio_transcription: Empty {},
        },
    }
}

fn realtime_input(chunk: &EncodedChunk) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RealtimeInputMessage {
        realtime_input: RealtimeInput {
            audio: Blob {
                mime_type: &chunk.mime_type,
                data: &chunk.data,
            },
        },
    })
}

/// Interpret one server frame.
pub(crate) fn parse_server_frame(text: &str) -> Result<Inbound, serde_json::Error> {
    let frame: ServerFrame = serde_json::from_str(text)?;

    if frame.setup_complete.is_some() {
        return Ok(Inbound::SetupComplete);
    }
    if let Some(go_away) = frame.go_away {
        return Ok(Inbound::GoAway(go_away.time_left));
    }
    let Some(content) = frame.server_content else {
        return Ok(Inbound::Ignored);
    };

    let audio = content
        .model_turn
        .map(|turn| turn.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.inline_data)
        .filter(|data| data.mime_type.starts_with("audio/"))
        .map(|data| InboundAudioPayload {
            mime_type: data.mime_type,
            data: data.data,
        })
        .collect();

    let message = ServerMessage {
        audio,
        interrupted: content.interrupted,
        turn_complete: content.turn_complete,
        input_transcript: content.input_transcription.and_then(|t| t.text),
        output_transcript: content.output_transcription.and_then(|t| t.text),
    };

    if message.is_empty() {
        Ok(Inbound::Ignored)
    } else {
        Ok(Inbound::Content(message))
    }
}

/// Text payload of a data frame; `None` for control frames.
fn frame_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

/// Connects to Gemini Live.
#[derive(Debug, Default, Clone)]
pub struct GeminiConnector;

impl GeminiConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SessionConnector for GeminiConnector {
    fn open(
        &self,
        settings: SessionSettings,
        events: EventSender,
    ) -> BoxFuture<'_, VoiceResult<Arc<dyn SessionLink>>> {
        Box::pin(async move {
            let link = open_session(settings, events).await?;
            Ok(link as Arc<dyn SessionLink>)
        })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect, send `setup` and wait for `setupComplete`.
async fn handshake(
    url: &str,
    setup: String,
) -> VoiceResult<(SplitSink<WsStream, Message>, SplitStream<WsStream>)> {
    let (socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| VoiceError::SessionOpenFailure(format!("connect failed: {}", e)))?;
    let (mut write, mut read) = socket.split();

    write
        .send(Message::Text(setup))
        .await
        .map_err(|e| VoiceError::SessionOpenFailure(format!("setup not sent: {}", e)))?;

    while let Some(message) = read.next().await {
        let message =
            message.map_err(|e| VoiceError::SessionOpenFailure(format!("socket error: {}", e)))?;
        if let Message::Close(frame) = &message {
            let reason = frame.as_ref().map(|f| f.reason.to_string()).unwrap_or_default();
            return Err(VoiceError::SessionOpenFailure(format!(
                "closed during setup: {}",
                reason
            )));
        }
        if let Some(text) = frame_text(&message) {
            if let Ok(Inbound::SetupComplete) = parse_server_frame(text) {
                return Ok((write, read));
            }
        }
    }
    Err(VoiceError::SessionOpenFailure("closed during setup".to_string()))
}

async fn open_session(
    settings: SessionSettings,
    events: EventSender,
) -> VoiceResult<Arc<GeminiLink>> {
    let url = format!("{}?key={}", settings.endpoint, settings.api_key);
    let setup = serde_json::to_string(&setup_message(&settings))
        .map_err(|e| VoiceError::SessionOpenFailure(format!("could not encode setup: {}", e)))?;

    info!(model = %settings.model, voice = %settings.voice_name, "Opening live session");

    let (mut write, mut read) = tokio::time::timeout(settings.open_timeout, handshake(&url, setup))
        .await
        .map_err(|_| {
            VoiceError::SessionOpenFailure(format!(
                "no setup confirmation within {} ms",
                settings.open_timeout.as_millis()
            ))
        })??;

    // Writer: the only owner of the sink
    let (outbound, mut outbound_rx) = mpsc::channel::<Message>(settings.outbound_queue_frames.max(1));
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                debug!("Session writer stopped: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    });

    // Opened must precede every message the reader forwards
    let _ = events.send(SessionEvent::Opened);

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    let _ = reader_events.send(SessionEvent::Closed { reason });
                    return;
                }
                Ok(message) => {
                    let Some(text) = frame_text(&message) else { continue };
                    match parse_server_frame(text) {
                        Ok(Inbound::Content(content)) => {
                            let _ = reader_events.send(SessionEvent::Message(content));
                        }
                        Ok(Inbound::GoAway(time_left)) => {
                            warn!(?time_left, "Server announced session end");
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Skipping unparseable server frame: {}", e),
                    }
                }
                Err(e) => {
                    let _ = reader_events.send(SessionEvent::Error(e.to_string()));
                    return;
                }
            }
        }
        let _ = reader_events.send(SessionEvent::Closed { reason: None });
    });

    info!("Live session opened");
    Ok(Arc::new(GeminiLink {
        outbound,
        closed: AtomicBool::new(false),
        reader: Mutex::new(Some(reader)),
        writer: Mutex::new(Some(writer)),
    }))
}

/// An open Gemini Live socket.
pub struct GeminiLink {
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

fn take_task(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

impl SessionLink for GeminiLink {
    fn send(&self, chunk: EncodedChunk) -> BoxFuture<'_, VoiceResult<()>> {
        let result = if self.closed.load(Ordering::SeqCst) {
            Err(VoiceError::SendFailure("session is closed".to_string()))
        } else {
            realtime_input(&chunk)
                .map_err(|e| VoiceError::SendFailure(format!("could not encode frame: {}", e)))
                .and_then(|json| {
                    self.outbound.try_send(Message::Text(json)).map_err(|e| match e {
                        mpsc::error::TrySendError::Full(_) => {
                            VoiceError::SendFailure("outbound queue is full".to_string())
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            VoiceError::SendFailure("connection is gone".to_string())
                        }
                    })
                })
        };
        Box::pin(async move { result })
    }

    fn close(&self) -> BoxFuture<'_, VoiceResult<()>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            // We initiated the close; no Closed event should follow
            if let Some(reader) = take_task(&self.reader) {
                reader.abort();
            }
            let writer = take_task(&self.writer);

            // Never wait on the queue: a stalled socket keeps it full
            match self.outbound.try_send(Message::Close(None)) {
                Ok(()) => {
                    if let Some(mut writer) = writer {
                        tokio::spawn(async move {
                            if tokio::time::timeout(WRITER_CLOSE_GRACE, &mut writer).await.is_err() {
                                warn!("Session writer did not finish closing, dropping the connection");
                                writer.abort();
                            }
                        });
                    }
                    Ok(())
                }
                Err(e) => {
                    if let Some(writer) = writer {
                        writer.abort();
                    }
                    Err(match e {
                        mpsc::error::TrySendError::Full(_) => VoiceError::CloseError(
                            "outbound queue is full, connection dropped without a close frame".to_string(),
                        ),
                        mpsc::error::TrySendError::Closed(_) => {
                            VoiceError::CloseError("connection already gone".to_string())
                        }
                    })
                }
            }
        })
    }
}
