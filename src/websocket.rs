//! # Browser Page WebSocket
//!
//! Attaches a browser page to the audio bridge. Clients connect to `/ws/audio`;
//! the page then serves as microphone, speaker and visualizer canvas for the
//! voice engine.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the page connects and becomes the attached page
//! 2. **Status**: the server sends the current engine status right away
//! 3. **Microphone**: on a `microphone` request the page prompts the user and
//!    answers with `permission`; if granted it streams binary PCM16 frames
//! 4. **Playback**: the page plays `play` messages at their `start_time`
//!    and cancels them on `stop`
//! 5. **Control**: the page may send `start`/`stop` instead of using the HTTP API
//!
//! ## Message Format:
//! - **Client → Server**: binary PCM16 little-endian microphone audio, or JSON
//!   `{"type": "permission" | "ping" | "start" | "stop", ...}`
//! - **Server → Client**: JSON messages tagged by `type` (see `BridgeMessage`)

use crate::bridge::{BridgeBackend, BridgeMessage};
use crate::lifecycle::EngineHandle;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often we ping the page.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A page silent for this long is considered gone.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages sent by the page.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Answer to a microphone prompt
    Permission { granted: bool },
    /// Application-level heartbeat; answered with `pong`
    Ping { timestamp: u64 },
    /// Start a voice session
    Start,
    /// Stop the voice session
    Stop,
}

/// Pre-serialized text frame for the page.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// WebSocket actor for one attached page.
///
/// ## Actor Model:
/// Each connection is an independent actor. Bridge messages produced by the
/// engine's tasks reach it through its address, so nothing outside the actor
/// touches the socket.
pub struct BridgeSocket {
    bridge: BridgeBackend,
    engine: EngineHandle,
    page_id: Option<Uuid>,
    last_heartbeat: Instant,
}

impl BridgeSocket {
    pub fn new(bridge: BridgeBackend, engine: EngineHandle) -> Self {
        Self {
            bridge,
            engine,
            page_id: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &BridgeMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Could not serialize bridge message: {}", e),
        }
    }

    /// Send error message to the page.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send_message(
            ctx,
            &BridgeMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
        warn!("WebSocket error {}: {}", code, message);
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::Permission { granted } => {
                info!(granted, "Microphone permission answered");
                self.bridge.permission_response(granted);
            }
            ClientMessage::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send_message(ctx, &BridgeMessage::Pong { timestamp });
            }
            ClientMessage::Start => {
                let engine = self.engine.clone();
                let addr = ctx.address();
                tokio::spawn(async move {
                    if let Err(e) = engine.start().await {
                        let message = BridgeMessage::Error {
                            code: e.code().to_string(),
                            message: e.user_message(),
                        };
                        if let Ok(json) = serde_json::to_string(&message) {
                            addr.do_send(SendText(json));
                        }
                    }
                });
            }
            ClientMessage::Stop => {
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.stop().await {
                        warn!("Stop requested by page failed: {}", e);
                    }
                });
            }
        }
    }
}

/// Implement Actor trait for WebSocket handling.
impl Actor for BridgeSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Attach to the bridge and start relaying its messages.
    fn started(&mut self, ctx: &mut Self::Context) {
        let (page_id, mut outbound) = self.bridge.attach();
        self.page_id = Some(page_id);

        let addr = ctx.address();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                match serde_json::to_string(&message) {
                    Ok(json) => addr.do_send(SendText(json)),
                    Err(e) => error!("Could not serialize bridge message: {}", e),
                }
            }
            debug!(%page_id, "Bridge relay finished");
        });

        let status = self.engine.status();
        self.send_message(
            ctx,
            &BridgeMessage::Status {
                state: status.state,
                error: status.error,
            },
        );

        // Start heartbeat timer
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Detach from the bridge; this ends any microphone stream from this page.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket connection stopped");
        if let Some(page_id) = self.page_id.take() {
            self.bridge.detach(page_id);
        }
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for BridgeSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(data)) => {
                if data.len() % 2 != 0 {
                    self.send_error(ctx, "audio_error", "Audio data length must be even for 16-bit samples");
                } else {
                    self.bridge.push_microphone(&data);
                }
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for BridgeSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a `BridgeSocket` actor.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let socket = BridgeSocket::new(app_state.bridge.clone(), app_state.engine.clone());
    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"permission","granted":true}"#).unwrap(),
            ClientMessage::Permission { granted: true }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping","timestamp":42}"#).unwrap(),
            ClientMessage::Ping { timestamp: 42 }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"stop"}"#).unwrap(),
            ClientMessage::Stop
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"config"}"#).is_err());
    }

    #[test]
    fn test_error_message_creation() {
        let error_msg = BridgeMessage::Error {
            code: "test_error".to_string(),
            message: "Test error message".to_string(),
        };

        let json = serde_json::to_string(&error_msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("test_error"));
        assert!(json.contains("Test error message"));
    }

    #[test]
    fn test_play_message_shape() {
        let json = serde_json::to_value(BridgeMessage::Play {
            unit_id: 3,
            start_time: 1.5,
            starts_in: 0.25,
            sample_rate: 24_000,
            channels: 1,
            data: "AAA=".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "play");
        assert_eq!(json["unit_id"], 3);
        assert_eq!(json["start_time"], 1.5);
        assert_eq!(json["starts_in"], 0.25);
    }
}
