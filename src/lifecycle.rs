//! # Lifecycle Controller
//!
//! Owns a voice session from the start request to the last released device.
//!
//! ## State machine:
//! ```text
//! Idle ──start──▶ Connecting ──opened──▶ Live ──stop──▶ Closing ──▶ Idle
//!                     │  └──────stop──────────────────────▶ Closing
//!                     └──fatal──▶ Errored ──▶ Idle    Live ──fatal──▶ Errored
//! ```
//!
//! ## Acquire-before-open:
//! Microphone permission, the input context and the output context are all
//! acquired before the remote session is opened, so a refused permission can
//! never leave a session open on the remote side.
//!
//! ## Teardown order (safe to repeat, safe with partial state):
//! 1. stop frame production (capture and visualizers)
//! 2. stop all playback (scheduler shutdown)
//! 3. close the remote session
//! 4. stop microphone tracks, close both audio contexts
//!
//! ## Concurrency model:
//! One task owns all of this state. Start and stop requests arrive as
//! commands on one queue, session events on another and device faults from
//! session tasks on a third; a single `select!` loop consumes them, so every
//! transition is processed to completion before the next one starts.

use crate::audio::analysis::TapSource;
use crate::audio::capture::{run_capture, CaptureEnd, Framer};
use crate::audio::scheduler::{spawn_scheduler, PlaybackFormat, SchedulerHandle};
use crate::audio::visualizer::run_visualizer;
use crate::config::AppConfig;
use crate::device::{AudioBackend, InputContext, OutputContext, TrackSet};
use crate::error::{VoiceError, VoiceResult};
use crate::session::adapter::{
    ServerMessage, SessionAdapter, SessionConnector, SessionEvent, SessionSettings,
};
use crate::state::MetricsRecorder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_TRANSITIONS: usize = 20;
const MAX_TRANSCRIPT_LINES: usize = 50;
const TASK_STOP_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle states of the voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Connecting,
    Live,
    Closing,
    Errored,
}

impl LifecycleState {
    /// Convert to string representation (used in logs and API responses).
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Live => "live",
            LifecycleState::Closing => "closing",
            LifecycleState::Errored => "errored",
        }
    }
}

/// One state change, as recorded and broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    Learner,
    Tutor,
}

/// A line of the running conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptLine {
    pub role: TranscriptRole,
    pub text: String,
    /// Set once the turn this line belongs to has finished
    pub complete: bool,
}

/// Everything the engine publishes besides its status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Transition(Transition),
    Transcript(TranscriptLine),
}

/// Snapshot of the engine, published on every change.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: LifecycleState,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    /// User-visible message of the last fatal error
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
    pub transitions: Vec<Transition>,
    pub transcripts: Vec<TranscriptLine>,
}

impl EngineStatus {
    fn idle() -> Self {
        Self {
            state: LifecycleState::Idle,
            session_id: None,
            started_at: None,
            error: None,
            error_code: None,
            transitions: Vec::new(),
            transcripts: Vec::new(),
        }
    }
}

enum EngineCommand {
    Start(oneshot::Sender<VoiceResult<EngineStatus>>),
    Stop(oneshot::Sender<EngineStatus>),
}

/// Cloneable handle for talking to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    status: watch::Receiver<EngineStatus>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Request a new session.
    ///
    /// Rejected with `MissingCredential` or `InvalidState` before any
    /// transition happens. Device and session failures do not produce an
    /// error here: they end the attempt in `Idle` with the error in the
    /// returned status.
    pub async fn start(&self) -> VoiceResult<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Start(tx))
            .await
            .map_err(|_| VoiceError::Internal("engine task has stopped".to_string()))?;
        rx.await
            .map_err(|_| VoiceError::Internal("engine dropped the start request".to_string()))?
    }

    /// Stop the session, whatever state it is in. Returns the final status.
    pub async fn stop(&self) -> VoiceResult<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Stop(tx))
            .await
            .map_err(|_| VoiceError::Internal("engine task has stopped".to_string()))?;
        rx.await
            .map_err(|_| VoiceError::Internal("engine dropped the stop request".to_string()))
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Resources of one session attempt. Every field is optional so teardown
/// works on whatever was acquired before a failure.
#[derive(Default)]
struct SessionResources {
    tracks: Option<TrackSet>,
    microphone: Option<mpsc::Receiver<Vec<f32>>>,
    input: Option<InputContext>,
    output: Option<Arc<dyn OutputContext>>,
    scheduler: Option<(SchedulerHandle, JoinHandle<()>)>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    session: Option<SessionAdapter>,
    live: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// A device failure reported by a task of the given session.
type DeviceFault = (Uuid, VoiceError);

struct Engine {
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn SessionConnector>,
    config: Arc<RwLock<AppConfig>>,
    metrics: MetricsRecorder,
    commands: mpsc::Receiver<EngineCommand>,
    faults_tx: mpsc::UnboundedSender<DeviceFault>,
    faults: mpsc::UnboundedReceiver<DeviceFault>,
    status_tx: watch::Sender<EngineStatus>,
    events_tx: broadcast::Sender<EngineEvent>,

    state: LifecycleState,
    session_config: AppConfig,
    session_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<VoiceError>,
    history: VecDeque<Transition>,
    transcripts: VecDeque<TranscriptLine>,
    resources: SessionResources,
}

/// Start the engine task.
pub fn spawn_engine(
    config: Arc<RwLock<AppConfig>>,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn SessionConnector>,
    metrics: MetricsRecorder,
) -> (EngineHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(EngineStatus::idle());
    let (events_tx, _) = broadcast::channel(64);
    let (faults_tx, faults) = mpsc::unbounded_channel();
    let session_config = config.read().unwrap_or_else(|e| e.into_inner()).clone();

    let engine = Engine {
        backend,
        connector,
        config,
        metrics,
        commands: commands_rx,
        faults_tx,
        faults,
        status_tx,
        events_tx: events_tx.clone(),
        state: LifecycleState::Idle,
        session_config,
        session_id: None,
        started_at: None,
        last_error: None,
        history: VecDeque::new(),
        transcripts: VecDeque::new(),
        resources: SessionResources::default(),
    };

    let join = tokio::spawn(engine.run());
    let handle = EngineHandle {
        commands: commands_tx,
        status: status_rx,
        events: events_tx,
    };
    (handle, join)
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>) -> Option<SessionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Acquire devices and contexts, then open the session. Everything acquired
/// is recorded in `resources` as soon as it exists, so a failure or
/// cancellation part-way leaves nothing untracked.
async fn acquire(
    resources: &mut SessionResources,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn SessionConnector>,
    config: AppConfig,
    settings: SessionSettings,
    metrics: MetricsRecorder,
) -> VoiceResult<()> {
    let audio = &config.audio;

    let microphone = backend.request_microphone(audio.input_sample_rate).await?;
    resources.tracks = Some(microphone.tracks.clone());
    resources.microphone = Some(microphone.samples);
    debug!("Microphone granted");

    resources.input = Some(backend.open_input_context(audio.input_sample_rate, audio.fft_size)?);
    let output =
        backend.open_output_context(audio.output_sample_rate, audio.output_channels, audio.fft_size)?;
    resources.output = Some(output.clone());
    debug!("Audio contexts opened");

    let format = PlaybackFormat {
        sample_rate: audio.output_sample_rate,
        channels: audio.output_channels,
    };
    resources.scheduler = Some(spawn_scheduler(output, format, metrics));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    resources.events = Some(events_rx);
    let link = connector.open(settings, events_tx).await?;
    resources.session = Some(SessionAdapter::new(link));
    Ok(())
}

impl Engine {
    async fn run(mut self) {
        info!("Voice engine ready");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(EngineCommand::Start(reply)) => {
                            let result = self.start().await.map(|_| self.status());
                            let _ = reply.send(result);
                        }
                        Some(EngineCommand::Stop(reply)) => {
                            self.stop().await;
                            let _ = reply.send(self.status());
                        }
                        None => break,
                    }
                }
                event = next_event(&mut self.resources.events) => {
                    match event {
                        Some(event) => self.handle_session_event(event).await,
                        None => {
                            // Every sender is gone without a close notice
                            self.resources.events = None;
                            self.handle_session_event(SessionEvent::Closed { reason: None }).await;
                        }
                    }
                }
                Some((session_id, err)) = self.faults.recv() => {
                    if self.state == LifecycleState::Live && self.session_id == Some(session_id) {
                        self.fail(err).await;
                    } else {
                        debug!(%session_id, "Ignoring device fault from a finished session");
                    }
                }
            }
        }

        if self.state != LifecycleState::Idle {
            self.teardown().await;
            self.transition(LifecycleState::Idle, Some("engine shutting down".to_string()));
        }
        info!("Voice engine stopped");
    }

    async fn start(&mut self) -> VoiceResult<()> {
        if self.state != LifecycleState::Idle {
            return Err(VoiceError::InvalidState(format!(
                "cannot start while {}",
                self.state.as_str()
            )));
        }

        let config = self.config.read().unwrap_or_else(|e| e.into_inner()).clone();
        let settings = SessionSettings::from_config(&config)?;

        self.session_id = Some(Uuid::new_v4());
        self.started_at = Some(Utc::now());
        self.last_error = None;
        self.transcripts.clear();
        self.session_config = config.clone();
        self.metrics.update(|m| m.sessions_started += 1);
        self.transition(LifecycleState::Connecting, Some("start requested".to_string()));

        let mut resources = SessionResources::default();
        let mut stop_replies = Vec::new();
        let outcome = {
            let acquiring = acquire(
                &mut resources,
                self.backend.clone(),
                self.connector.clone(),
                config,
                settings,
                self.metrics.clone(),
            );
            tokio::pin!(acquiring);

            // Stay responsive while waiting on permission prompts and the network
            loop {
                tokio::select! {
                    result = &mut acquiring => break Some(result),
                    command = self.commands.recv() => match command {
                        Some(EngineCommand::Stop(reply)) => {
                            stop_replies.push(reply);
                            break None;
                        }
                        Some(EngineCommand::Start(reply)) => {
                            let _ = reply.send(Err(VoiceError::InvalidState(
                                "cannot start while connecting".to_string(),
                            )));
                        }
                        None => break None,
                    }
                }
            }
        };
        self.resources = resources;

        match outcome {
            Some(Ok(())) => {
                info!(session_id = ?self.session_id, "Session opened, waiting for ready signal");
            }
            Some(Err(e)) => self.fail(e).await,
            None => {
                self.transition(LifecycleState::Closing, Some("stop requested".to_string()));
                self.teardown().await;
                self.transition(LifecycleState::Idle, None);
                for reply in stop_replies {
                    let _ = reply.send(self.status());
                }
            }
        }
        Ok(())
    }

    async fn stop(&mut self) {
        match self.state {
            LifecycleState::Idle => {
                // Nothing is running; still safe to release leftovers
                self.teardown().await;
            }
            _ => {
                self.transition(LifecycleState::Closing, Some("stop requested".to_string()));
                self.teardown().await;
                self.transition(LifecycleState::Idle, None);
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened => {
                if self.state == LifecycleState::Connecting {
                    self.go_live();
                } else {
                    debug!(state = self.state.as_str(), "Ignoring late open notice");
                }
            }
            SessionEvent::Message(message) => {
                if self.state == LifecycleState::Live {
                    self.handle_message(message);
                }
            }
            SessionEvent::Closed { reason } => {
                if matches!(self.state, LifecycleState::Connecting | LifecycleState::Live) {
                    let reason = reason.unwrap_or_else(|| "remote side closed the session".to_string());
                    self.fail(VoiceError::SessionClosedUnexpectedly(reason)).await;
                }
            }
            SessionEvent::Error(message) => {
                if matches!(self.state, LifecycleState::Connecting | LifecycleState::Live) {
                    self.fail(VoiceError::SessionClosedUnexpectedly(message)).await;
                }
            }
        }
    }

    /// Connecting → Live: start capture and the visualizers.
    fn go_live(&mut self) {
        let (Some(session), Some(input), Some(output)) = (
            self.resources.session.clone(),
            self.resources.input.clone(),
            self.resources.output.clone(),
        ) else {
            warn!("Open notice arrived before the session was ready");
            return;
        };

        let (live_tx, live_rx) = watch::channel(true);
        let config = &self.session_config;

        if let (Some(microphone), Some(session_id)) = (self.resources.microphone.take(), self.session_id) {
            let framer = Framer::new(config.audio.frame_size, config.audio.input_sample_rate);
            let capture = run_capture(
                microphone,
                framer,
                input.analysis_tap(),
                session,
                self.metrics.clone(),
                live_rx.clone(),
            );
            let faults = self.faults_tx.clone();
            self.resources.tasks.push(tokio::spawn(async move {
                if capture.await == CaptureEnd::MicrophoneLost {
                    let err = VoiceError::DeviceUnavailable("the microphone stream ended".to_string());
                    let _ = faults.send((session_id, err));
                }
            }));
        }

        for (source, tap) in [
            (TapSource::Input, input.analysis_tap()),
            (TapSource::Output, output.analysis_tap()),
        ] {
            if let Some(surface) = self.backend.render_surface(source) {
                self.resources.tasks.push(tokio::spawn(run_visualizer(
                    tap,
                    surface,
                    config.visualizer.refresh_hz,
                    live_rx.clone(),
                )));
            }
        }

        self.resources.live = Some(live_tx);
        self.transition(LifecycleState::Live, Some("session ready".to_string()));
    }

    /// Interruption is applied before the audio carried by the same message.
    fn handle_message(&mut self, message: ServerMessage) {
        if let Some((scheduler, _)) = &self.resources.scheduler {
            if message.interrupted {
                if let Err(e) = scheduler.interrupt() {
                    warn!("Could not interrupt playback: {}", e);
                }
            }
            for payload in message.audio {
                if let Err(e) = scheduler.enqueue(payload) {
                    warn!("Could not queue playback: {}", e);
                }
            }
        }

        if let Some(text) = message.input_transcript {
            self.append_transcript(TranscriptRole::Learner, &text);
        }
        if let Some(text) = message.output_transcript {
            self.append_transcript(TranscriptRole::Tutor, &text);
        }
        if message.turn_complete {
            debug!("Tutor turn complete");
            self.transcripts.iter_mut().for_each(|line| line.complete = true);
            self.publish();
        }
    }

    fn append_transcript(&mut self, role: TranscriptRole, text: &str) {
        // Streaming transcription arrives in fragments of the same line
        let continues_line = matches!(
            self.transcripts.back(),
            Some(line) if line.role == role && !line.complete
        );
        if continues_line {
            if let Some(line) = self.transcripts.back_mut() {
                line.text.push_str(text);
            }
        } else {
            self.transcripts.push_back(TranscriptLine {
                role,
                text: text.to_string(),
                complete: false,
            });
            if self.transcripts.len() > MAX_TRANSCRIPT_LINES {
                self.transcripts.pop_front();
            }
        }
        if let Some(line) = self.transcripts.back() {
            let _ = self.events_tx.send(EngineEvent::Transcript(line.clone()));
        }
        self.publish();
    }

    /// Fatal error: surface it, tear everything down, return to Idle.
    async fn fail(&mut self, err: VoiceError) {
        error!(code = err.code(), "Voice session failed: {}", err);
        if err.is_fatal() {
            self.metrics.update(|m| m.fatal_errors += 1);
        }
        let reason = err.to_string();
        self.last_error = Some(err);
        self.transition(LifecycleState::Errored, Some(reason));
        self.teardown().await;
        self.transition(LifecycleState::Idle, None);
    }

    /// Release everything this session acquired. Never fails; every step
    /// runs even if an earlier one reported an error.
    async fn teardown(&mut self) {
        let resources = std::mem::take(&mut self.resources);

        // 1. Stop frame production
        if let Some(live) = &resources.live {
            let _ = live.send(false);
        }
        for mut task in resources.tasks {
            if tokio::time::timeout(TASK_STOP_GRACE, &mut task).await.is_err() {
                warn!("Session task did not stop in time, aborting it");
                task.abort();
            }
        }

        // 2. Stop all playback
        if let Some((scheduler, join)) = resources.scheduler {
            scheduler.shutdown().await;
            let _ = join.await;
        }

        // 3. Close the remote session
        drop(resources.events);
        if let Some(session) = resources.session {
            session.close().await;
        }

        // 4. Release the microphone and both contexts
        if let Some(tracks) = resources.tracks {
            tracks.stop_all();
        }
        drop(resources.microphone);
        if let Some(input) = resources.input {
            if let Err(e) = input.close() {
                warn!("Error closing input context: {}", e);
            }
        }
        if let Some(output) = resources.output {
            if let Err(e) = output.close() {
                warn!("Error closing output context: {}", e);
            }
        }
        debug!("Session resources released");
    }

    fn transition(&mut self, to: LifecycleState, reason: Option<String>) {
        let from = self.state;
        self.state = to;
        info!(from = from.as_str(), to = to.as_str(), reason = ?reason, "Lifecycle transition");

        let transition = Transition {
            from,
            to,
            at: Utc::now(),
            reason,
        };
        self.history.push_back(transition.clone());
        if self.history.len() > MAX_TRANSITIONS {
            self.history.pop_front();
        }
        // No subscribers is fine
        let _ = self.events_tx.send(EngineEvent::Transition(transition));
        self.publish();
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            session_id: self.session_id,
            started_at: self.started_at,
            error: self.last_error.as_ref().map(|e| e.user_message()),
            error_code: self.last_error.as_ref().map(|e| e.code()),
            transitions: self.history.iter().cloned().collect(),
            transcripts: self.transcripts.iter().cloned().collect(),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::InboundAudioPayload;
    use crate::audio::scheduler::tests::{payload, FakeOutput};
    use crate::audio::visualizer::tests::RecordingSurface;
    use crate::audio::visualizer::RenderSurface;
    use crate::bridge::{BridgeBackend, BridgeMessage};
    use crate::device::MicrophoneStream;
    use crate::session::adapter::tests::FakeLink;
    use crate::session::adapter::{EventSender, SessionLink};
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        deny_permission: bool,
        mic_tx: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
        tracks: Mutex<Vec<TrackSet>>,
        inputs: Mutex<Vec<InputContext>>,
        outputs: Mutex<Vec<Arc<FakeOutput>>>,
        surfaces: Mutex<Vec<RecordingSurface>>,
    }

    impl FakeBackend {
        fn all_released(&self) -> bool {
            self.tracks.lock().unwrap().iter().all(|t| t.active_tracks() == 0)
                && self.inputs.lock().unwrap().iter().all(|c| c.is_closed())
                && self.outputs.lock().unwrap().iter().all(|c| c.is_closed())
        }

        fn output(&self) -> Arc<FakeOutput> {
            self.outputs.lock().unwrap()[0].clone()
        }
    }

    impl AudioBackend for FakeBackend {
        fn request_microphone(&self, sample_rate: u32) -> BoxFuture<'_, VoiceResult<MicrophoneStream>> {
            Box::pin(async move {
                if self.deny_permission {
                    return Err(VoiceError::PermissionDenied("user declined".into()));
                }
                let (tx, rx) = mpsc::channel(16);
                let tracks = TrackSet::new(1);
                *self.mic_tx.lock().unwrap() = Some(tx);
                self.tracks.lock().unwrap().push(tracks.clone());
                Ok(MicrophoneStream { samples: rx, tracks, sample_rate })
            })
        }

        fn open_input_context(&self, sample_rate: u32, fft_size: usize) -> VoiceResult<InputContext> {
            let context = InputContext::new(sample_rate, fft_size);
            self.inputs.lock().unwrap().push(context.clone());
            Ok(context)
        }

        fn open_output_context(
            &self,
            _sample_rate: u32,
            _channels: u16,
            _fft_size: usize,
        ) -> VoiceResult<Arc<dyn OutputContext>> {
            let output = FakeOutput::new();
            self.outputs.lock().unwrap().push(output.clone());
            Ok(output as Arc<dyn OutputContext>)
        }

        fn render_surface(&self, _source: TapSource) -> Option<Box<dyn RenderSurface>> {
            let surface = RecordingSurface::default();
            self.surfaces.lock().unwrap().push(surface.clone());
            Some(Box::new(surface))
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        fail: bool,
        hang: bool,
        opened: AtomicUsize,
        links: Mutex<Vec<Arc<FakeLink>>>,
        events: Mutex<Option<EventSender>>,
    }

    impl FakeConnector {
        fn emit(&self, event: SessionEvent) {
            let events = self.events.lock().unwrap();
            events.as_ref().unwrap().send(event).unwrap();
        }

        fn link(&self) -> Arc<FakeLink> {
            self.links.lock().unwrap()[0].clone()
        }
    }

    impl SessionConnector for FakeConnector {
        fn open(
            &self,
            _settings: SessionSettings,
            events: EventSender,
        ) -> BoxFuture<'_, VoiceResult<Arc<dyn SessionLink>>> {
            Box::pin(async move {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                if self.fail {
                    return Err(VoiceError::SessionOpenFailure("401 unauthorized".into()));
                }
                self.opened.fetch_add(1, Ordering::SeqCst);
                events.send(SessionEvent::Opened).unwrap();
                *self.events.lock().unwrap() = Some(events);
                let link = FakeLink::new();
                self.links.lock().unwrap().push(link.clone());
                Ok(link as Arc<dyn SessionLink>)
            })
        }
    }

    struct Harness {
        handle: EngineHandle,
        backend: Arc<FakeBackend>,
        connector: Arc<FakeConnector>,
        metrics: MetricsRecorder,
    }

    fn harness(backend: FakeBackend, connector: FakeConnector, api_key: &str) -> Harness {
        let mut config = AppConfig::default();
        config.session.api_key = api_key.to_string();
        config.audio.frame_size = 4;
        let backend = Arc::new(backend);
        let connector = Arc::new(connector);
        let metrics = MetricsRecorder::new();
        let (handle, _join) = spawn_engine(
            Arc::new(RwLock::new(config)),
            backend.clone(),
            connector.clone(),
            metrics.clone(),
        );
        Harness { handle, backend, connector, metrics }
    }

    async fn wait_for_state(handle: &EngineHandle, state: LifecycleState) {
        let mut status = handle.subscribe_status();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.state == state))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn drain_transitions(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<(LifecycleState, LifecycleState)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Transition(t) = event {
                out.push((t.from, t.to));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_permission_denied_never_opens_session() {
        let h = harness(
            FakeBackend { deny_permission: true, ..Default::default() },
            FakeConnector::default(),
            "key",
        );
        let mut events = h.handle.subscribe_events();

        let status = h.handle.start().await.unwrap();
        assert_eq!(status.state, LifecycleState::Idle);
        assert_eq!(status.error_code, Some("permission_denied"));
        assert!(status.error.is_some());

        use LifecycleState::*;
        assert_eq!(
            drain_transitions(&mut events),
            vec![(Idle, Connecting), (Connecting, Errored), (Errored, Idle)]
        );
        assert_eq!(h.connector.opened.load(Ordering::SeqCst), 0);
        // Nothing was acquired after the refusal
        assert!(h.backend.inputs.lock().unwrap().is_empty());
        assert!(h.backend.outputs.lock().unwrap().is_empty());
        assert_eq!(h.metrics.snapshot().fatal_errors, 1);
    }

    #[tokio::test]
    async fn test_missing_credential_is_rejected_before_any_transition() {
        let h = harness(FakeBackend::default(), FakeConnector::default(), "   ");
        let mut events = h.handle.subscribe_events();
        assert!(matches!(h.handle.start().await, Err(VoiceError::MissingCredential)));
        assert!(drain_transitions(&mut events).is_empty());
        assert!(h.backend.tracks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_goes_live_and_streams_microphone() {
        let h = harness(FakeBackend::default(), FakeConnector::default(), "key");
        h.handle.start().await.unwrap();
        wait_for_state(&h.handle, LifecycleState::Live).await;

        let mic = h.backend.mic_tx.lock().unwrap().clone().unwrap();
        mic.send(vec![0.1; 8]).await.unwrap();
        let link = h.connector.link();
        eventually(|| link.sent().len() == 2).await;
        assert_eq!(h.metrics.snapshot().frames_sent, 2);

        assert!(matches!(h.handle.start().await, Err(VoiceError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_stop_from_live_releases_everything() {
        let h = harness(FakeBackend::default(), FakeConnector::default(), "key");
        h.handle.start().await.unwrap();
        wait_for_state(&h.handle, LifecycleState::Live).await;
        let mut events = h.handle.subscribe_events();

        let status = h.handle.stop().await.unwrap();
        assert_eq!(status.state, LifecycleState::Idle);
        assert!(status.error.is_none());
        assert!(h.backend.all_released());
        assert_eq!(h.connector.link().close_calls(), 1);
        assert!(h.backend.surfaces.lock().unwrap().iter().all(|s| *s.cleared.lock().unwrap()));

        use LifecycleState::*;
        assert_eq!(drain_transitions(&mut events), vec![(Live, Closing), (Closing, Idle)]);

        // Stopping again is harmless
        let again = h.handle.stop().await.unwrap();
        assert_eq!(again.state, Idle);
        assert_eq!(h.connector.link().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let h = harness(
            FakeBackend::default(),
            FakeConnector { hang: true, ..Default::default() },
            "key",
        );
        let starter = h.handle.clone();
        let start = tokio::spawn(async move { starter.start().await });
        wait_for_state(&h.handle, LifecycleState::Connecting).await;
        // Wait until the open attempt is in flight
        eventually(|| !h.backend.outputs.lock().unwrap().is_empty()).await;

        let status = h.handle.stop().await.unwrap();
        assert_eq!(status.state, LifecycleState::Idle);
        assert!(h.backend.all_released());
        assert_eq!(h.backend.tracks.lock().unwrap().len(), 1);
        assert_eq!(start.await.unwrap().unwrap().state, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_stop_during_microphone_prompt_turns_page_microphone_off() {
        let mut config = AppConfig::default();
        config.session.api_key = "key".into();
        let metrics = MetricsRecorder::new();
        let bridge = BridgeBackend::new(400, 100, metrics.clone());
        let (_page_id, mut page) = bridge.attach();
        let connector = Arc::new(FakeConnector::default());
        let (handle, _join) = spawn_engine(
            Arc::new(RwLock::new(config)),
            Arc::new(bridge.clone()),
            connector.clone(),
            metrics,
        );

        let starter = handle.clone();
        let start = tokio::spawn(async move { starter.start().await });
        let prompt = tokio::time::timeout(Duration::from_secs(1), page.recv())
            .await
            .expect("no microphone prompt")
            .unwrap();
        assert!(matches!(prompt, BridgeMessage::Microphone { .. }));

        let status = handle.stop().await.unwrap();
        assert_eq!(status.state, LifecycleState::Idle);
        assert_eq!(start.await.unwrap().unwrap().state, LifecycleState::Idle);
        assert_eq!(page.try_recv().unwrap(), BridgeMessage::MicrophoneOff);

        // Answering the withdrawn prompt opens nothing
        bridge.permission_response(true);
        assert!(page.try_recv().is_err());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lost_microphone_while_live_fails_session() {
        let h = harness(FakeBackend::default(), FakeConnector::default(), "key");
        h.handle.start().await.unwrap();
        wait_for_state(&h.handle, LifecycleState::Live).await;
        let mut events = h.handle.subscribe_events();

        // The only sender goes away, as when the page detaches
        h.backend.mic_tx.lock().unwrap().take();
        wait_for_state(&h.handle, LifecycleState::Idle).await;

        let status = h.handle.status();
        assert_eq!(status.error_code, Some("device_unavailable"));
        assert!(status.error.is_some());
        assert!(h.backend.all_released());
        assert_eq!(h.connector.link().close_calls(), 1);
        use LifecycleState::*;
        assert_eq!(drain_transitions(&mut events), vec![(Live, Errored), (Errored, Idle)]);
    }

    #[tokio::test]
    async fn test_open_failure_tears_down() {
        let h = harness(
            FakeBackend::default(),
            FakeConnector { fail: true, ..Default::default() },
            "key",
        );
        let status = h.handle.start().await.unwrap();
        assert_eq!(status.state, LifecycleState::Idle);
        assert_eq!(status.error_code, Some("session_open_failure"));
        assert!(h.backend.all_released());
    }

    #[tokio::test]
    async fn test_unexpected_close_while_live() {
        let h = harness(FakeBackend::default(), FakeConnector::default(), "key");
        h.handle.start().await.unwrap();
        wait_for_state(&h.handle, LifecycleState::Live).await;
        let mut events = h.handle.subscribe_events();

        h.connector.emit(SessionEvent::Closed { reason: Some("network lost".into()) });
        wait_for_state(&h.handle, LifecycleState::Idle).await;

        let status = h.handle.status();
        assert_eq!(status.error.as_deref(), Some("Disconnected from the tutor."));
        assert!(h.backend.all_released());
        use LifecycleState::*;
        assert_eq!(drain_transitions(&mut events), vec![(Live, Errored), (Errored, Idle)]);

        // Stopping after the error path still ends cleanly
        assert_eq!(h.handle.stop().await.unwrap().state, Idle);
    }

    #[tokio::test]
    async fn test_interruption_discards_audio_and_restarts_at_clock() {
        let h = harness(FakeBackend::default(), FakeConnector::default(), "key");
        h.handle.start().await.unwrap();
        wait_for_state(&h.handle, LifecycleState::Live).await;
        let output = h.backend.output();

        h.connector.emit(SessionEvent::Message(ServerMessage {
            audio: vec![payload(1.0)],
            ..Default::default()
        }));
        eventually(|| output.started.lock().unwrap().len() == 1).await;
        let first = output.started.lock().unwrap()[0].0;

        output.set_clock(0.3);
        h.connector.emit(SessionEvent::Message(ServerMessage {
            audio: vec![payload(0.4)],
            interrupted: true,
            ..Default::default()
        }));
        eventually(|| output.started.lock().unwrap().len() == 2).await;

        assert_eq!(*output.stopped.lock().unwrap(), vec![first]);
        // Rewound cursor is 0, so the live clock bounds the restart
        let (_, start, _) = output.started.lock().unwrap()[1];
        assert!((start - 0.3).abs() < 1e-9);
        assert_eq!(h.metrics.snapshot().interruptions, 1);
    }

    #[tokio::test]
    async fn test_bad_payload_is_skipped() {
        let h = harness(FakeBackend::default(), FakeConnector::default(), "key");
        h.handle.start().await.unwrap();
        wait_for_state(&h.handle, LifecycleState::Live).await;
        let output = h.backend.output();

        h.connector.emit(SessionEvent::Message(ServerMessage {
            audio: vec![
                payload(0.5),
                InboundAudioPayload { mime_type: "audio/pcm;rate=24000".into(), data: "@@".into() },
                payload(0.5),
            ],
            ..Default::default()
        }));
        eventually(|| output.started.lock().unwrap().len() == 2).await;
        assert_eq!(output.starts(), vec![0.0, 0.5]);
        assert_eq!(h.handle.status().state, LifecycleState::Live);
    }

    #[tokio::test]
    async fn test_transcripts_accumulate() {
        let h = harness(FakeBackend::default(), FakeConnector::default(), "key");
        h.handle.start().await.unwrap();
        wait_for_state(&h.handle, LifecycleState::Live).await;

        for text in ["Hola, ", "¿qué tal?"] {
            h.connector.emit(SessionEvent::Message(ServerMessage {
                output_transcript: Some(text.into()),
                ..Default::default()
            }));
        }
        h.connector.emit(SessionEvent::Message(ServerMessage {
            turn_complete: true,
            ..Default::default()
        }));
        h.connector.emit(SessionEvent::Message(ServerMessage {
            input_transcript: Some("Bien".into()),
            ..Default::default()
        }));

        let handle = h.handle.clone();
        eventually(move || handle.status().transcripts.len() == 2).await;
        let lines = h.handle.status().transcripts;
        assert_eq!(lines[0].text, "Hola, ¿qué tal?");
        assert_eq!(lines[0].role, TranscriptRole::Tutor);
        assert!(lines[0].complete);
        assert_eq!(lines[1].role, TranscriptRole::Learner);
    }
}
