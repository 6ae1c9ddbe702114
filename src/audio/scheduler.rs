//! # Playback Scheduler
//!
//! Places decoded audio on the shared output timeline so consecutive units
//! play back-to-back with no gap and no overlap, and discards everything still
//! scheduled when the remote side signals an interruption.
//!
//! ## Timeline rules:
//! - `start = max(cursor, output_clock_now)`
//! - after scheduling, `cursor = start + duration`
//! - on interruption: stop every active unit, clear the active set, `cursor = 0`
//!
//! ## Concurrency model:
//! All timeline state is owned by one task that consumes a single command
//! queue. Decoding runs off that task, but results are committed in enqueue
//! order using sequence numbers, so a payload whose decode finishes late is
//! never placed before one enqueued earlier. Each interruption starts a new
//! epoch; decodes still in flight from an older epoch are dropped when they
//! arrive, so pre-interruption audio is never heard.

use crate::audio::frame::{decode_payload, InboundAudioPayload, PcmBuffer};
use crate::device::{EndedSignal, OutputContext, UnitId};
use crate::error::{VoiceError, VoiceResult};
use crate::state::MetricsRecorder;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A decoded buffer placed on the output timeline.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub buffer: Arc<PcmBuffer>,
    pub start_time: f64,
}

impl PlaybackUnit {
    pub fn duration(&self) -> f64 {
        self.buffer.duration()
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
}

/// Timeline state: the cursor and the set of units not yet finished.
///
/// Every method runs to completion without suspending, so each cursor
/// read-modify-write is atomic with respect to the rest of the engine.
pub struct PlaybackScheduler {
    output: Arc<dyn OutputContext>,
    ended_tx: mpsc::UnboundedSender<UnitId>,
    cursor: f64,
    active: HashMap<UnitId, PlaybackUnit>,
    next_unit: UnitId,
}

impl PlaybackScheduler {
    /// `ended_tx` receives the id of every unit that finishes on its own.
    pub fn new(output: Arc<dyn OutputContext>, ended_tx: mpsc::UnboundedSender<UnitId>) -> Self {
        Self {
            output,
            ended_tx,
            cursor: 0.0,
            active: HashMap::new(),
            next_unit: 1,
        }
    }

    /// Chain a decoded buffer after everything already scheduled.
    ///
    /// If the output refuses the unit (e.g. it was closed), the cursor and
    /// active set are left untouched.
    pub fn schedule(&mut self, buffer: PcmBuffer) -> VoiceResult<PlaybackUnit> {
        let start_time = self.cursor.max(self.output.current_time());
        let unit = PlaybackUnit {
            id: self.next_unit,
            buffer: Arc::new(buffer),
            start_time,
        };

        self.output.start_unit(
            unit.id,
            unit.buffer.clone(),
            start_time,
            EndedSignal::new(unit.id, self.ended_tx.clone()),
        )?;

        self.next_unit += 1;
        self.cursor = unit.end_time();
        debug!(
            unit_id = unit.id,
            start = unit.start_time,
            duration = unit.duration(),
            cursor = self.cursor,
            "Scheduled playback unit"
        );
        self.active.insert(unit.id, unit.clone());
        Ok(unit)
    }

    /// A unit finished naturally. Returns false for units no longer tracked
    /// (already removed by an interruption).
    pub fn on_ended(&mut self, unit: UnitId) -> bool {
        self.active.remove(&unit).is_some()
    }

    /// Stop all active units, clear the set and rewind the cursor to 0.
    /// Returns the number of units that were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.keys() {
            // Best-effort: the unit may already have finished
            self.output.stop_unit(*id);
        }
        self.active.clear();
        self.cursor = 0.0;
        stopped
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_units(&self) -> Vec<PlaybackUnit> {
        let mut units: Vec<_> = self.active.values().cloned().collect();
        units.sort_by_key(|u| u.id);
        units
    }
}

/// Point-in-time view of the scheduler task.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub cursor: f64,
    pub active_units: usize,
    pub pending_decodes: usize,
    pub epoch: u64,
}

enum SchedulerCommand {
    Enqueue(InboundAudioPayload),
    Decoded {
        epoch: u64,
        seq: u64,
        result: VoiceResult<PcmBuffer>,
    },
    Interrupt,
    Reset,
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable sender side of the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    fn send(&self, command: SchedulerCommand) -> VoiceResult<()> {
        self.tx
            .send(command)
            .map_err(|_| VoiceError::Internal("playback scheduler has stopped".to_string()))
    }

    /// Queue an inbound payload for decoding and scheduling.
    pub fn enqueue(&self, payload: InboundAudioPayload) -> VoiceResult<()> {
        self.send(SchedulerCommand::Enqueue(payload))
    }

    /// Discard all scheduled and in-flight audio (server interruption).
    pub fn interrupt(&self) -> VoiceResult<()> {
        self.send(SchedulerCommand::Interrupt)
    }

    /// Same effect as `interrupt`, without counting an interruption (teardown).
    pub fn reset(&self) -> VoiceResult<()> {
        self.send(SchedulerCommand::Reset)
    }

    pub async fn snapshot(&self) -> VoiceResult<SchedulerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::Snapshot(tx))?;
        rx.await
            .map_err(|_| VoiceError::Internal("playback scheduler dropped snapshot".to_string()))
    }

    /// Stop everything and end the task. Resolves once the task has finished
    /// its cleanup; resolves immediately if the task is already gone.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(SchedulerCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Output format the scheduler decodes into.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

struct SchedulerTask {
    scheduler: PlaybackScheduler,
    format: PlaybackFormat,
    metrics: MetricsRecorder,
    // Weak so the task ends once every handle is dropped
    commands_tx: mpsc::WeakUnboundedSender<SchedulerCommand>,
    epoch: u64,
    next_seq: u64,
    next_commit: u64,
    pending: BTreeMap<u64, VoiceResult<PcmBuffer>>,
}

impl SchedulerTask {
    fn enqueue(&mut self, payload: InboundAudioPayload) {
        self.metrics.update(|m| m.payloads_received += 1);
        let seq = self.next_seq;
        self.next_seq += 1;
        let epoch = self.epoch;
        let format = self.format;
        let Some(tx) = self.commands_tx.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                decode_payload(&payload, format.sample_rate, format.channels)
            })
            .await
            .unwrap_or_else(|e| Err(VoiceError::DecodePayloadFailure(format!("decoder task failed: {}", e))));
            // The scheduler may have shut down meanwhile
            let _ = tx.send(SchedulerCommand::Decoded { epoch, seq, result });
        });
    }

    fn decoded(&mut self, epoch: u64, seq: u64, result: VoiceResult<PcmBuffer>) {
        if epoch != self.epoch {
            debug!(seq, epoch, "Dropping decode from before an interruption");
            return;
        }
        self.pending.insert(seq, result);

        // Commit strictly in enqueue order
        while let Some(result) = self.pending.remove(&self.next_commit) {
            self.next_commit += 1;
            match result.and_then(|buffer| self.scheduler.schedule(buffer)) {
                Ok(_) => self.metrics.update(|m| m.units_scheduled += 1),
                Err(VoiceError::DecodePayloadFailure(msg)) => {
                    warn!(seq = self.next_commit - 1, "Skipping undecodable payload: {}", msg);
                    self.metrics.update(|m| m.decode_failures += 1);
                }
                Err(e) => warn!("Could not schedule playback unit: {}", e),
            }
        }
    }

    /// Rewind everything: new epoch, forget in-flight decodes, stop audio.
    fn clear(&mut self) -> usize {
        self.epoch += 1;
        self.pending.clear();
        self.next_commit = self.next_seq;
        self.scheduler.interrupt()
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            cursor: self.scheduler.cursor(),
            active_units: self.scheduler.active_count(),
            pending_decodes: (self.next_seq - self.next_commit) as usize,
            epoch: self.epoch,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        mut ended: mpsc::UnboundedReceiver<UnitId>,
    ) {
        loop {
            tokio::select! {
                Some(unit) = ended.recv() => {
                    if self.scheduler.on_ended(unit) {
                        self.metrics.update(|m| m.units_ended += 1);
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        SchedulerCommand::Enqueue(payload) => self.enqueue(payload),
                        SchedulerCommand::Decoded { epoch, seq, result } => {
                            self.decoded(epoch, seq, result)
                        }
                        SchedulerCommand::Interrupt => {
                            let stopped = self.clear();
                            self.metrics.update(|m| m.interruptions += 1);
                            info!(stopped, "Playback interrupted, timeline reset");
                        }
                        SchedulerCommand::Reset => {
                            let stopped = self.clear();
                            debug!(stopped, "Playback timeline reset");
                        }
                        SchedulerCommand::Snapshot(reply) => {
                            let _ = reply.send(self.snapshot());
                        }
                        SchedulerCommand::Shutdown(reply) => {
                            self.clear();
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
            }
        }
        debug!("Playback scheduler stopped");
    }
}

/// Start the scheduler task for one output context.
pub fn spawn_scheduler(
    output: Arc<dyn OutputContext>,
    format: PlaybackFormat,
    metrics: MetricsRecorder,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (ended_tx, ended_rx) = mpsc::unbounded_channel();

    let task = SchedulerTask {
        scheduler: PlaybackScheduler::new(output, ended_tx),
        format,
        metrics,
        commands_tx: commands_tx.downgrade(),
        epoch: 0,
        next_seq: 0,
        next_commit: 0,
        pending: BTreeMap::new(),
    };

    let join = tokio::spawn(task.run(commands_rx, ended_rx));
    (SchedulerHandle { tx: commands_tx }, join)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::analysis::{AnalysisTap, TapSource};
    use crate::audio::frame::pcm_mime_type;
    use base64::Engine as _;
    use std::sync::Mutex;

    /// Output context with a hand-driven clock that records every call.
    pub(crate) struct FakeOutput {
        pub clock: Mutex<f64>,
        pub started: Mutex<Vec<(UnitId, f64, f64)>>,
        pub stopped: Mutex<Vec<UnitId>>,
        pub signals: Mutex<Vec<EndedSignal>>,
        pub closed: Mutex<bool>,
        tap: AnalysisTap,
    }

    impl FakeOutput {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                clock: Mutex::new(0.0),
                started: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
                signals: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
                tap: AnalysisTap::new(TapSource::Output, 64),
            })
        }

        pub fn set_clock(&self, seconds: f64) {
            *self.clock.lock().unwrap() = seconds;
        }

        pub fn starts(&self) -> Vec<f64> {
            self.started.lock().unwrap().iter().map(|(_, start, _)| *start).collect()
        }

        /// Fire the ended signal of one started unit, as if it played out.
        pub fn finish(&self, unit: UnitId) {
            let mut signals = self.signals.lock().unwrap();
            if let Some(pos) = signals.iter().position(|s| s.unit() == unit) {
                signals.remove(pos).fire();
            }
        }
    }

    impl OutputContext for FakeOutput {
        fn sample_rate(&self) -> u32 {
            24_000
        }

        fn channels(&self) -> u16 {
            1
        }

        fn current_time(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn start_unit(
            &self,
            unit: UnitId,
            buffer: Arc<PcmBuffer>,
            start_at: f64,
            ended: EndedSignal,
        ) -> VoiceResult<()> {
            if *self.closed.lock().unwrap() {
                return Err(VoiceError::DeviceUnavailable("output closed".into()));
            }
            self.started.lock().unwrap().push((unit, start_at, buffer.duration()));
            self.signals.lock().unwrap().push(ended);
            Ok(())
        }

        fn stop_unit(&self, unit: UnitId) {
            self.stopped.lock().unwrap().push(unit);
        }

        fn analysis_tap(&self) -> AnalysisTap {
            self.tap.clone()
        }

        fn close(&self) -> VoiceResult<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    fn buffer(seconds: f64) -> PcmBuffer {
        PcmBuffer::new(vec![0.0; (seconds * 24_000.0).round() as usize], 24_000, 1)
    }

    pub(crate) fn payload(seconds: f64) -> InboundAudioPayload {
        let bytes = vec![0u8; (seconds * 24_000.0).round() as usize * 2];
        InboundAudioPayload {
            mime_type: pcm_mime_type(24_000),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    fn scheduler(output: &Arc<FakeOutput>) -> (PlaybackScheduler, mpsc::UnboundedReceiver<UnitId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PlaybackScheduler::new(output.clone(), tx), rx)
    }

    const EPS: f64 = 1e-9;

    #[test]
    fn test_burst_is_chained_without_gaps() {
        let output = FakeOutput::new();
        let (mut scheduler, _ended) = scheduler(&output);
        let durations = [0.3, 0.05, 1.2, 0.5, 0.01];
        for d in durations {
            scheduler.schedule(buffer(d)).unwrap();
        }

        let starts = output.starts();
        for i in 0..durations.len() - 1 {
            let end = starts[i] + durations[i];
            assert!(starts[i + 1] >= end - EPS, "overlap at {}", i);
            assert!(starts[i + 1] - end < EPS, "gap at {}", i);
        }
    }

    #[test]
    fn test_late_arrival_starts_at_clock() {
        let output = FakeOutput::new();
        let (mut scheduler, _ended) = scheduler(&output);
        scheduler.schedule(buffer(0.5)).unwrap();
        // Timeline ran dry: the next unit cannot start in the past
        output.set_clock(2.0);
        let unit = scheduler.schedule(buffer(0.25)).unwrap();
        assert!((unit.start_time - 2.0).abs() < EPS);
        assert!((scheduler.cursor() - 2.25).abs() < EPS);
    }

    #[test]
    fn test_scenario_second_payload_waits_for_first() {
        let output = FakeOutput::new();
        let (mut scheduler, _ended) = scheduler(&output);

        output.set_clock(0.0);
        let a = scheduler.schedule(buffer(1.0)).unwrap();
        assert!((a.start_time - 0.0).abs() < EPS);
        assert!((scheduler.cursor() - 1.0).abs() < EPS);

        output.set_clock(0.2);
        let b = scheduler.schedule(buffer(0.5)).unwrap();
        assert!((b.start_time - 1.0).abs() < EPS);
        assert!((scheduler.cursor() - 1.5).abs() < EPS);
    }

    #[test]
    fn test_interruption_rewinds_cursor_then_clamps_to_clock() {
        let output = FakeOutput::new();
        let (mut scheduler, _ended) = scheduler(&output);

        let a = scheduler.schedule(buffer(1.0)).unwrap();
        output.set_clock(0.3);
        assert_eq!(scheduler.interrupt(), 1);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.cursor(), 0.0);
        assert_eq!(*output.stopped.lock().unwrap(), vec![a.id]);

        // Relative to the rewound cursor, bounded below by the live clock;
        // never chained after the discarded unit
        let c = scheduler.schedule(buffer(0.4)).unwrap();
        assert!((c.start_time - 0.3).abs() < EPS);
        assert!(c.start_time < a.end_time());
        assert!((scheduler.cursor() - 0.7).abs() < EPS);
    }

    #[test]
    fn test_interrupt_with_clock_at_zero_starts_from_zero() {
        let output = FakeOutput::new();
        let (mut scheduler, _ended) = scheduler(&output);
        scheduler.schedule(buffer(1.0)).unwrap();
        scheduler.interrupt();
        let c = scheduler.schedule(buffer(0.4)).unwrap();
        assert_eq!(c.start_time, 0.0);
    }

    #[test]
    fn test_ended_removes_from_active_set() {
        let output = FakeOutput::new();
        let (mut scheduler, _ended) = scheduler(&output);
        let a = scheduler.schedule(buffer(0.1)).unwrap();
        let b = scheduler.schedule(buffer(0.1)).unwrap();
        assert!(scheduler.on_ended(a.id));
        assert!(!scheduler.on_ended(a.id));
        assert_eq!(scheduler.active_units().iter().map(|u| u.id).collect::<Vec<_>>(), vec![b.id]);
        // Natural end does not move the cursor
        assert!((scheduler.cursor() - 0.2).abs() < EPS);
    }

    #[test]
    fn test_refused_unit_leaves_timeline_untouched() {
        let output = FakeOutput::new();
        let (mut scheduler, _ended) = scheduler(&output);
        scheduler.schedule(buffer(0.5)).unwrap();
        output.close().unwrap();
        assert!(scheduler.schedule(buffer(0.5)).is_err());
        assert!((scheduler.cursor() - 0.5).abs() < EPS);
        assert_eq!(scheduler.active_count(), 1);
    }

    async fn settle(handle: &SchedulerHandle, expected_pending: usize) -> SchedulerSnapshot {
        for _ in 0..200 {
            let snapshot = handle.snapshot().await.unwrap();
            if snapshot.pending_decodes == expected_pending {
                return snapshot;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        panic!("scheduler did not settle");
    }

    fn format() -> PlaybackFormat {
        PlaybackFormat { sample_rate: 24_000, channels: 1 }
    }

    #[tokio::test]
    async fn test_task_schedules_in_enqueue_order() {
        let output = FakeOutput::new();
        let metrics = MetricsRecorder::new();
        let (handle, _join) = spawn_scheduler(output.clone(), format(), metrics.clone());

        // A large payload decodes slower than the small ones behind it
        handle.enqueue(payload(3.0)).unwrap();
        handle.enqueue(payload(0.1)).unwrap();
        handle.enqueue(payload(0.2)).unwrap();
        let snapshot = settle(&handle, 0).await;

        let started = output.started.lock().unwrap().clone();
        let durations: Vec<f64> = started.iter().map(|(_, _, d)| (d * 10.0).round() / 10.0).collect();
        assert_eq!(durations, vec![3.0, 0.1, 0.2]);
        assert!((started[1].1 - 3.0).abs() < EPS);
        assert!((started[2].1 - 3.1).abs() < EPS);
        assert!((snapshot.cursor - 3.3).abs() < EPS);
        assert_eq!(metrics.snapshot().units_scheduled, 3);
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_disturb_neighbours() {
        let output = FakeOutput::new();
        let metrics = MetricsRecorder::new();
        let (handle, _join) = spawn_scheduler(output.clone(), format(), metrics.clone());

        handle.enqueue(payload(0.5)).unwrap();
        handle
            .enqueue(InboundAudioPayload {
                mime_type: pcm_mime_type(24_000),
                data: "not base64!".to_string(),
            })
            .unwrap();
        handle.enqueue(payload(0.25)).unwrap();
        let snapshot = settle(&handle, 0).await;

        assert_eq!(output.starts().len(), 2);
        assert!((output.starts()[1] - 0.5).abs() < EPS);
        assert!((snapshot.cursor - 0.75).abs() < EPS);
        assert_eq!(metrics.snapshot().decode_failures, 1);
    }

    #[tokio::test]
    async fn test_interrupt_drops_in_flight_decodes() {
        let output = FakeOutput::new();
        let metrics = MetricsRecorder::new();
        let (handle, _join) = spawn_scheduler(output.clone(), format(), metrics.clone());

        handle.enqueue(payload(1.0)).unwrap();
        settle(&handle, 0).await;

        // Queued back-to-back: the interruption is processed before either
        // decode can complete, so the second payload must never play
        handle.enqueue(payload(2.0)).unwrap();
        handle.interrupt().unwrap();
        let after = handle.snapshot().await.unwrap();
        assert_eq!(after.cursor, 0.0);
        assert_eq!(after.active_units, 0);
        assert_eq!(after.pending_decodes, 0);

        handle.enqueue(payload(0.4)).unwrap();
        let snapshot = settle(&handle, 0).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let durations: Vec<f64> = output
            .started
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, d)| (d * 10.0).round() / 10.0)
            .collect();
        assert_eq!(durations, vec![1.0, 0.4]);
        assert_eq!(output.starts()[1], 0.0);
        assert!((snapshot.cursor - 0.4).abs() < EPS);
        assert_eq!(metrics.snapshot().interruptions, 1);
    }

    #[tokio::test]
    async fn test_ended_signal_reaches_task() {
        let output = FakeOutput::new();
        let metrics = MetricsRecorder::new();
        let (handle, _join) = spawn_scheduler(output.clone(), format(), metrics.clone());

        handle.enqueue(payload(0.1)).unwrap();
        let before = settle(&handle, 0).await;
        assert_eq!(before.active_units, 1);

        let id = output.started.lock().unwrap()[0].0;
        output.finish(id);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(handle.snapshot().await.unwrap().active_units, 0);
        assert_eq!(metrics.snapshot().units_ended, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let output = FakeOutput::new();
        let (handle, join) = spawn_scheduler(output.clone(), format(), MetricsRecorder::new());
        handle.enqueue(payload(0.5)).unwrap();
        settle(&handle, 0).await;

        handle.shutdown().await;
        join.await.unwrap();
        assert_eq!(output.stopped.lock().unwrap().len(), 1);
        assert!(handle.enqueue(payload(0.1)).is_err());
        // A second shutdown on a finished task returns immediately
        handle.shutdown().await;
    }
}
