//! # Browser Audio Bridge
//!
//! An `AudioBackend` whose hardware lives in a connected browser page.
//! The page attaches over the `/ws/audio` WebSocket and then acts as:
//! - **Microphone**: it asks the user for permission when we request it, then
//!   streams PCM16 frames as binary WebSocket messages
//! - **Speaker**: it receives `play`/`stop` messages; each `play` says how many
//!   seconds from now the unit starts, plus its position on the output clock
//! - **Render surfaces**: it draws the `bars`/`clear` messages of both visualizers
//!
//! ## Output clock:
//! The output clock is server-side wall time since the output context was
//! opened. Units are played out on that clock by timer tasks, which also feed
//! the output analysis tap and fire the unit's ended signal.
//!
//! Only one page is attached at a time; a new page replaces the old one.

use crate::audio::analysis::{AnalysisTap, TapSource};
use crate::audio::frame::{pcm16_le_to_float, PcmBuffer};
use crate::audio::visualizer::{Bar, RenderSurface};
use crate::device::{AudioBackend, EndedSignal, InputContext, MicrophoneStream, OutputContext, TrackSet, UnitId};
use crate::error::{VoiceError, VoiceResult};
use crate::lifecycle::{EngineEvent, EngineHandle, LifecycleState, TranscriptRole};
use crate::state::MetricsRecorder;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long the user has to answer the microphone prompt.
const PERMISSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Microphone blocks buffered between the page and the capture task.
const MICROPHONE_QUEUE: usize = 64;

/// Slice of a playing unit pushed into the output tap at a time.
const TAP_SLICE: Duration = Duration::from_millis(20);

/// Messages sent from the server to the attached page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Ask the user for microphone access and start streaming at `sample_rate`
    Microphone { sample_rate: u32 },
    /// Stop streaming microphone audio
    MicrophoneOff,
    /// Play base64 PCM16 audio at `start_time` seconds on the output clock,
    /// which is `starts_in` seconds after the message was sent
    Play {
        unit_id: UnitId,
        start_time: f64,
        starts_in: f64,
        sample_rate: u32,
        channels: u16,
        data: String,
    },
    Stop { unit_id: UnitId },
    Bars { source: TapSource, bars: Vec<Bar> },
    Clear { source: TapSource },
    Status {
        state: LifecycleState,
        error: Option<String>,
    },
    Transcript { role: TranscriptRole, text: String },
    Pong { timestamp: u64 },
    Error { code: String, message: String },
}

struct Page {
    id: Uuid,
    tx: mpsc::UnboundedSender<BridgeMessage>,
}

struct Microphone {
    tx: mpsc::Sender<Vec<f32>>,
    tracks: TrackSet,
}

struct BridgeInner {
    page: Mutex<Option<Page>>,
    permission: Mutex<Option<oneshot::Sender<bool>>>,
    microphone: Mutex<Option<Microphone>>,
    metrics: MetricsRecorder,
    surface_width: u32,
    surface_height: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared handle to the bridge.
#[derive(Clone)]
pub struct BridgeBackend {
    inner: Arc<BridgeInner>,
}

impl BridgeBackend {
    pub fn new(surface_width: u32, surface_height: u32, metrics: MetricsRecorder) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                page: Mutex::new(None),
                permission: Mutex::new(None),
                microphone: Mutex::new(None),
                metrics,
                surface_width,
                surface_height,
            }),
        }
    }

    /// Attach a page, replacing any page attached before.
    pub fn attach(&self) -> (Uuid, mpsc::UnboundedReceiver<BridgeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        if lock(&self.inner.page).replace(Page { id, tx }).is_some() {
            info!(page_id = %id, "Browser page replaced the previously attached page");
        } else {
            info!(page_id = %id, "Browser page attached");
        }
        (id, rx)
    }

    /// Detach a page. A stale id (already replaced) is ignored.
    pub fn detach(&self, id: Uuid) {
        let mut page = lock(&self.inner.page);
        if page.as_ref().map(|p| p.id) != Some(id) {
            return;
        }
        *page = None;
        drop(page);

        // A pending prompt can no longer be answered
        lock(&self.inner.permission).take();
        // Ends the microphone stream seen by capture
        lock(&self.inner.microphone).take();
        info!(page_id = %id, "Browser page detached");
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.inner.page).is_some()
    }

    /// Send to the attached page. Returns false when no page is attached.
    pub fn send(&self, message: BridgeMessage) -> bool {
        match lock(&self.inner.page).as_ref() {
            Some(page) => page.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// The page's answer to a microphone prompt.
    pub fn permission_response(&self, granted: bool) {
        match lock(&self.inner.permission).take() {
            Some(reply) => {
                let _ = reply.send(granted);
            }
            None => debug!(granted, "Permission answer without a pending prompt"),
        }
    }

    /// Microphone audio from the page as little-endian PCM16 bytes.
    ///
    /// Ignored while no track is live. A full queue drops the block rather
    /// than blocking the page connection, and counts it as an overrun.
    pub fn push_microphone(&self, bytes: &[u8]) {
        let microphone = lock(&self.inner.microphone);
        let Some(microphone) = microphone.as_ref() else { return };
        if !microphone.tracks.is_live() {
            return;
        }
        match microphone.tx.try_send(pcm16_le_to_float(bytes)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(block)) => {
                self.inner.metrics.update(|m| m.microphone_overruns += 1);
                warn!(samples = block.len(), "Capture is behind, dropped a microphone block");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Microphone block arrived after capture ended");
            }
        }
    }

    /// Forward engine status changes and transcript lines to the attached page.
    pub fn spawn_status_forwarder(&self, engine: &EngineHandle) -> JoinHandle<()> {
        let bridge = self.clone();
        let mut status = engine.subscribe_status();
        let mut events = engine.subscribe_events();

        tokio::spawn(async move {
            let mut last_sent: Option<(LifecycleState, Option<String>)> = None;
            loop {
                tokio::select! {
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = {
                            let status = status.borrow_and_update();
                            (status.state, status.error.clone())
                        };
                        // Transcript updates also republish the status; skip those
                        if last_sent.as_ref() != Some(&current) {
                            let (state, error) = current.clone();
                            bridge.send(BridgeMessage::Status { state, error });
                            last_sent = Some(current);
                        }
                    }
                    event = events.recv() => match event {
                        Ok(EngineEvent::Transcript(line)) => {
                            bridge.send(BridgeMessage::Transcript { role: line.role, text: line.text });
                        }
                        Ok(EngineEvent::Transition(_)) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Status forwarder lagged behind engine events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

/// An outstanding microphone prompt. Unless disarmed, dropping it withdraws
/// the prompt and tells the page to keep its microphone off, so a request
/// that times out or is cancelled never leaves the page capturing.
struct PendingPrompt {
    bridge: BridgeBackend,
    armed: bool,
}

impl PendingPrompt {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingPrompt {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        lock(&self.bridge.inner.permission).take();
        if self.bridge.send(BridgeMessage::MicrophoneOff) {
            debug!("Microphone prompt withdrawn");
        }
    }
}

impl AudioBackend for BridgeBackend {
    fn request_microphone(&self, sample_rate: u32) -> BoxFuture<'_, VoiceResult<MicrophoneStream>> {
        Box::pin(async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            *lock(&self.inner.permission) = Some(reply_tx);

            if !self.send(BridgeMessage::Microphone { sample_rate }) {
                lock(&self.inner.permission).take();
                return Err(VoiceError::DeviceUnavailable("no browser page is attached".to_string()));
            }
            let prompt = PendingPrompt { bridge: self.clone(), armed: true };

            let granted = match tokio::time::timeout(PERMISSION_TIMEOUT, reply_rx).await {
                Ok(Ok(granted)) => granted,
                Ok(Err(_)) => {
                    return Err(VoiceError::DeviceUnavailable(
                        "browser page went away during the microphone prompt".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(VoiceError::PermissionDenied(
                        "no answer to the microphone prompt".to_string(),
                    ));
                }
            };

            if !granted {
                return Err(VoiceError::PermissionDenied(
                    "microphone access was refused".to_string(),
                ));
            }

            let (tx, rx) = mpsc::channel(MICROPHONE_QUEUE);
            let tracks = TrackSet::new(1);
            *lock(&self.inner.microphone) = Some(Microphone { tx, tracks: tracks.clone() });
            prompt.disarm();
            Ok(MicrophoneStream { samples: rx, tracks, sample_rate })
        })
    }

    fn open_input_context(&self, sample_rate: u32, fft_size: usize) -> VoiceResult<InputContext> {
        Ok(InputContext::new(sample_rate, fft_size))
    }

    fn open_output_context(
        &self,
        sample_rate: u32,
        channels: u16,
        fft_size: usize,
    ) -> VoiceResult<Arc<dyn OutputContext>> {
        if !self.is_attached() {
            return Err(VoiceError::DeviceUnavailable("no browser page is attached".to_string()));
        }
        Ok(Arc::new(BridgeOutput::new(self.clone(), sample_rate, channels, fft_size)))
    }

    fn render_surface(&self, source: TapSource) -> Option<Box<dyn RenderSurface>> {
        if !self.is_attached() {
            return None;
        }
        Some(Box::new(PageSurface {
            bridge: self.clone(),
            source,
            width: self.inner.surface_width,
            height: self.inner.surface_height,
        }))
    }
}

/// Output context played by the attached page.
pub struct BridgeOutput {
    bridge: BridgeBackend,
    sample_rate: u32,
    channels: u16,
    origin: Instant,
    tap: AnalysisTap,
    units: Arc<Mutex<HashMap<UnitId, JoinHandle<()>>>>,
    closed: AtomicBool,
}

impl BridgeOutput {
    fn new(bridge: BridgeBackend, sample_rate: u32, channels: u16, fft_size: usize) -> Self {
        Self {
            bridge,
            sample_rate,
            channels,
            origin: Instant::now(),
            tap: AnalysisTap::new(TapSource::Output, fft_size),
            units: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        }
    }
}

impl OutputContext for BridgeOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start_unit(
        &self,
        unit: UnitId,
        buffer: Arc<PcmBuffer>,
        start_at: f64,
        ended: EndedSignal,
    ) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::DeviceUnavailable("output context is closed".to_string()));
        }

        let delay = Duration::from_secs_f64((start_at - self.current_time()).max(0.0));
        self.bridge.send(BridgeMessage::Play {
            unit_id: unit,
            start_time: start_at,
            starts_in: delay.as_secs_f64(),
            sample_rate: buffer.sample_rate(),
            channels: buffer.channels(),
            data: base64::engine::general_purpose::STANDARD.encode(buffer.to_pcm16_le()),
        });

        let tap = self.tap.clone();
        let units = self.units.clone();

        // Hold the map while spawning so the task cannot remove itself first
        let mut active = lock(self.units.as_ref());
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let slice_len =
                ((buffer.sample_rate() as f64 * TAP_SLICE.as_secs_f64()) as usize).max(1)
                    * buffer.channels().max(1) as usize;
            for slice in buffer.samples().chunks(slice_len) {
                tap.push(slice);
                let frames = slice.len() / buffer.channels().max(1) as usize;
                tokio::time::sleep(Duration::from_secs_f64(
                    frames as f64 / buffer.sample_rate() as f64,
                ))
                .await;
            }

            lock(units.as_ref()).remove(&unit);
            ended.fire();
        });
        active.insert(unit, task);
        Ok(())
    }

    fn stop_unit(&self, unit: UnitId) {
        if let Some(task) = lock(self.units.as_ref()).remove(&unit) {
            task.abort();
            self.bridge.send(BridgeMessage::Stop { unit_id: unit });
        }
    }

    fn analysis_tap(&self) -> AnalysisTap {
        self.tap.clone()
    }

    fn close(&self) -> VoiceResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let units: Vec<_> = lock(self.units.as_ref()).drain().collect();
        for (unit, task) in units {
            task.abort();
            self.bridge.send(BridgeMessage::Stop { unit_id: unit });
        }
        self.tap.close();
        if !self.bridge.send(BridgeMessage::MicrophoneOff) {
            warn!("Output context closed with no page attached");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Visualizer surface drawn by the page.
struct PageSurface {
    bridge: BridgeBackend,
    source: TapSource,
    width: u32,
    height: u32,
}

impl RenderSurface for PageSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn draw_bars(&mut self, bars: &[Bar]) {
        self.bridge.send(BridgeMessage::Bars {
            source: self.source,
            bars: bars.to_vec(),
        });
    }

    fn clear(&mut self) {
        self.bridge.send(BridgeMessage::Clear { source: self.source });
    }
}
