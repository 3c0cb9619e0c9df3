//! ═══════════════════════════════════════════════════════════════════════════════
//! TRAIN — Spike-Train Stimulation Engine
//! ═══════════════════════════════════════════════════════════════════════════════
//!
//! One *train* ramps target temperature from a start value toward an end
//! value in fixed steps, one *spike* per step: command the device (target,
//! duration, trigger), dwell, optionally force a brief return to baseline,
//! then wait the inter-spike interval. Every wait is abortable.
//!
//! Abort sources, polled continuously:
//! - the stop code: a digit sequence matched as a trailing window over the
//!   most recent input digits; a match ends the current train only;
//! - yoke playback: a planned offset for this train auto-aborts once the
//!   train's elapsed time reaches it, reproducing a recorded session's
//!   timing at polling resolution;
//! - engine disable/shutdown.
//!
//! Timing is driven by elapsed wall time, not device acknowledgments: the
//! thermode protocol sends none, so a dropped command only increments the
//! driver's error count and the train keeps its schedule.
//! ═══════════════════════════════════════════════════════════════════════════════

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::driver::ThermodeDriver;
use crate::error::{PainlabError, Result};
use crate::recorder::EventSink;
use crate::yoke::{PlaybackQueue, YokeStore};

/// Tolerance on the ramp's end-temperature check. The loop stops once the
/// next step would exceed the end temperature by more than this.
const END_TEMP_EPSILON: f32 = 1e-3;

/// Floor for the forced baseline pulse, milliseconds
const MIN_BASELINE_PULSE_MS: u32 = 50;

/// Ramp and timing parameters for spike trains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainParams {
    /// Baseline temperature between spikes, °C
    pub baseline_c: f32,
    /// First spike's target temperature, °C
    pub start_temp_c: f32,
    /// Ramp end temperature, °C (inclusive up to the epsilon tolerance)
    pub end_temp_c: f32,
    /// Per-spike temperature increment, °C
    pub step_c: f32,
    /// Hard cap on spikes per train
    pub max_spikes: u32,
    /// Surface the train starts on (0 = all; held fixed for the whole train)
    pub start_surface: u8,
    /// Dwell at target per spike, ms
    pub spike_duration_ms: u32,
    /// Inter-spike interval, ms
    pub isi_ms: u32,
    /// Forced return-to-baseline pulse, ms (floored at 50 when used)
    pub baseline_pulse_ms: u32,
    /// Force a baseline pulse between spikes
    pub force_baseline_between_spikes: bool,
    /// Gap between trains, ms
    pub inter_train_gap_ms: u64,
    /// Stop after this many trains; 0 = run until disabled
    pub max_trains: u32,
    /// Abort-poll resolution, ms
    pub poll_interval_ms: u64,
    /// Stop code digits
    pub stop_code: String,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            baseline_c: 32.0,
            start_temp_c: 39.0,
            end_temp_c: 49.0,
            step_c: 1.0,
            max_spikes: 10,
            start_surface: 0,
            spike_duration_ms: 2000,
            isi_ms: 2000,
            baseline_pulse_ms: 300,
            force_baseline_between_spikes: true,
            inter_train_gap_ms: 20_000,
            max_trains: 0,
            poll_interval_ms: 5,
            stop_code: "258".to_string(),
        }
    }
}

/// How the engine treats yoke state for a run
pub enum TrainMode {
    /// Run freely; nothing recorded, nothing planned
    Free,
    /// Run freely and append per-train outcomes to the active yoke round
    Record,
    /// Deterministically reproduce planned aborts from a donor queue
    Playback(PlaybackQueue),
}

/// Trailing-window matcher for the stop code. Only digits participate;
/// typing `1258` against code `258` matches on the final `8`.
pub struct StopCodeMatcher {
    code: String,
    window: String,
    matched: bool,
}

impl StopCodeMatcher {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            window: String::new(),
            matched: false,
        }
    }

    /// Feed one input character. Returns true on the keystroke that
    /// completes the code. Further input after a match is ignored until
    /// [`reset`](Self::reset).
    pub fn push(&mut self, c: char) -> bool {
        if self.matched || self.code.is_empty() || !c.is_ascii_digit() {
            return false;
        }
        self.window.push(c);
        if self.window.len() > self.code.len() {
            let cut = self.window.len() - self.code.len();
            self.window.drain(..cut);
        }
        if self.window == self.code {
            self.matched = true;
        }
        self.matched
    }

    pub fn matched(&self) -> bool {
        self.matched
    }

    /// Clear state at the start of a new train
    pub fn reset(&mut self) {
        self.window.clear();
        self.matched = false;
    }
}

/// Per-train completion callback `(train_index, aborted)`. At most one.
pub type TrainFinishedHook = Arc<dyn Fn(u32, bool) + Send + Sync>;

struct RunCtx {
    params: TrainParams,
    driver: Arc<ThermodeDriver>,
    sink: Arc<dyn EventSink>,
    yoke: Arc<Mutex<YokeStore>>,
    digits: Receiver<char>,
    disabled: Arc<AtomicBool>,
    on_finished: Option<TrainFinishedHook>,
}

/// Drives repeated spike trains on a dedicated thread. One train is in
/// flight at any time; `start`/`stop` bound a block's stimulation window.
pub struct SpikeTrainEngine {
    params: TrainParams,
    driver: Arc<ThermodeDriver>,
    sink: Arc<dyn EventSink>,
    yoke: Arc<Mutex<YokeStore>>,
    digit_tx: Sender<char>,
    digit_rx: Receiver<char>,
    disabled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    on_finished: Option<TrainFinishedHook>,
}

impl SpikeTrainEngine {
    pub fn new(
        params: TrainParams,
        driver: Arc<ThermodeDriver>,
        sink: Arc<dyn EventSink>,
        yoke: Arc<Mutex<YokeStore>>,
    ) -> Self {
        let (digit_tx, digit_rx) = unbounded();
        Self {
            params,
            driver,
            sink,
            yoke,
            digit_tx,
            digit_rx,
            disabled: Arc::new(AtomicBool::new(false)),
            worker: None,
            on_finished: None,
        }
    }

    /// Handle for feeding typed input (stop-code digits) into the engine
    pub fn input_handle(&self) -> Sender<char> {
        self.digit_tx.clone()
    }

    /// Register the train-finished callback (0 or 1 active)
    pub fn set_train_finished_hook(&mut self, hook: TrainFinishedHook) {
        self.on_finished = Some(hook);
    }

    /// Override the stop code for subsequent trains
    pub fn set_stop_code(&mut self, code: &str) {
        self.params.stop_code = code.to_string();
        info!(code, "stop code set");
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Start the train loop on its own thread.
    pub fn start(&mut self, mode: TrainMode) -> Result<()> {
        if self.is_running() {
            return Err(PainlabError::Internal(
                "spike train already running".to_string(),
            ));
        }
        self.worker = None;
        self.disabled.store(false, Ordering::SeqCst);

        let ctx = RunCtx {
            params: self.params.clone(),
            driver: Arc::clone(&self.driver),
            sink: Arc::clone(&self.sink),
            yoke: Arc::clone(&self.yoke),
            digits: self.digit_rx.clone(),
            disabled: Arc::clone(&self.disabled),
            on_finished: self.on_finished.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("spike-train".into())
            .spawn(move || run_loop(ctx, mode))
            .map_err(|e| PainlabError::Internal(e.to_string()))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Disable the engine and wait for the current train to wind down.
    /// A train in flight aborts at its next poll point.
    pub fn stop(&mut self) {
        self.disabled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("spike train worker panicked");
            }
        }
    }
}

impl Drop for SpikeTrainEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(ctx: RunCtx, mode: TrainMode) {
    let params = &ctx.params;
    let mut matcher = StopCodeMatcher::new(&params.stop_code);
    let recording = matches!(mode, TrainMode::Record);
    let mut playback = match mode {
        TrainMode::Playback(queue) => Some(queue),
        _ => None,
    };

    let mut train_index: u32 = 0;
    loop {
        if ctx.disabled.load(Ordering::SeqCst) {
            break;
        }
        if params.max_trains > 0 && train_index >= params.max_trains {
            break;
        }

        // Fresh train: clear the matcher and any stale keystrokes
        matcher.reset();
        while ctx.digits.try_recv().is_ok() {}

        let train_start = Instant::now();
        ctx.sink.train_start(train_index);
        // One planned offset per train; None past the queue's end
        let planned_abort_sec = playback.as_mut().and_then(|q| q.take_next());
        if let Some(sec) = planned_abort_sec {
            debug!(train_index, planned_abort_sec = sec, "yoked train");
        }

        if let Err(e) = ctx.driver.set_base_temperature(params.baseline_c) {
            warn!(error = %e, "base temperature command dropped");
        }

        let mut aborted = false;
        let mut sent: u32 = 0;
        let mut temp = params.start_temp_c;

        while !aborted
            && sent < params.max_spikes
            && temp <= params.end_temp_c + END_TEMP_EPSILON
        {
            if planned_elapsed(planned_abort_sec, train_start) {
                info!(
                    train_index,
                    planned_abort_sec, "yoke playback auto-abort before spike"
                );
                aborted = true;
                break;
            }

            let surface = params.start_surface;
            debug!(train_index, spike = sent, temp_c = temp, "spike");
            ctx.sink
                .spike_start(train_index, sent, surface, temp, params.spike_duration_ms);

            send_spike(&ctx, temp, surface, params.spike_duration_ms);
            aborted = wait_abortable(
                &ctx,
                &mut matcher,
                train_start,
                planned_abort_sec,
                Duration::from_millis(params.spike_duration_ms as u64),
            );

            if !aborted && params.force_baseline_between_spikes {
                let pulse_ms = params.baseline_pulse_ms.max(MIN_BASELINE_PULSE_MS);
                send_spike(&ctx, params.baseline_c, surface, pulse_ms);
                aborted = wait_abortable(
                    &ctx,
                    &mut matcher,
                    train_start,
                    planned_abort_sec,
                    Duration::from_millis(params.baseline_pulse_ms as u64),
                );
            }

            ctx.sink.spike_end(train_index, sent, surface);

            if !aborted {
                aborted = wait_abortable(
                    &ctx,
                    &mut matcher,
                    train_start,
                    planned_abort_sec,
                    Duration::from_millis(params.isi_ms as u64),
                );
            }

            sent += 1;
            temp += params.step_c;
        }

        info!(train_index, aborted, spikes = sent, "train complete");
        ctx.sink.train_end(train_index, aborted);

        // Shutdown cuts a train without a subject abort; the partial train
        // is not a yoke outcome
        let shutdown = ctx.disabled.load(Ordering::SeqCst);
        if recording && !shutdown {
            let offset = if aborted {
                Some(train_start.elapsed().as_secs_f64())
            } else {
                None
            };
            ctx.yoke.lock().push_outcome(offset);
        }

        if let Some(ref hook) = ctx.on_finished {
            hook(train_index, aborted);
        }

        train_index += 1;

        // Inter-train gap, interruptible only by disable
        let gap_end = Instant::now() + Duration::from_millis(params.inter_train_gap_ms);
        while Instant::now() < gap_end {
            if ctx.disabled.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(params.poll_interval_ms.max(1)));
        }
    }

    info!(trains = train_index, "spike train loop done");
}

fn send_spike(ctx: &RunCtx, temp_c: f32, surface: u8, duration_ms: u32) {
    // Command failures only count toward driver telemetry; the schedule
    // runs on wall time regardless
    if let Err(e) = ctx.driver.set_target_temperature(temp_c, surface) {
        warn!(error = %e, "target command dropped");
        return;
    }
    if let Err(e) = ctx.driver.set_duration(duration_ms, surface) {
        warn!(error = %e, "duration command dropped");
        return;
    }
    if let Err(e) = ctx.driver.trigger() {
        warn!(error = %e, "trigger dropped");
    }
}

fn planned_elapsed(planned_abort_sec: Option<f64>, train_start: Instant) -> bool {
    match planned_abort_sec {
        Some(sec) => train_start.elapsed().as_secs_f64() >= sec,
        None => false,
    }
}

/// Wait out `duration`, polling every abort source. Returns true if the
/// train must abort.
fn wait_abortable(
    ctx: &RunCtx,
    matcher: &mut StopCodeMatcher,
    train_start: Instant,
    planned_abort_sec: Option<f64>,
    duration: Duration,
) -> bool {
    let end = Instant::now() + duration;
    loop {
        if ctx.disabled.load(Ordering::SeqCst) {
            return true;
        }
        while let Ok(c) = ctx.digits.try_recv() {
            if matcher.push(c) {
                info!(code = %ctx.params.stop_code, "stop code received; ending train");
                ctx.sink
                    .button(&format!("STOP_CODE_{}", ctx.params.stop_code), true);
                return true;
            }
        }
        if planned_elapsed(planned_abort_sec, train_start) {
            return true;
        }
        if Instant::now() >= end {
            return false;
        }
        std::thread::sleep(Duration::from_millis(ctx.params.poll_interval_ms.max(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryTransport;
    use crate::recorder::NullSink;
    use parking_lot::Mutex as PlMutex;

    /// Sink that collects (kind, v2) rows; v2 carries the aborted flag
    /// for TRAIN_END rows
    struct CollectingSink {
        events: PlMutex<Vec<(String, String)>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: PlMutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<String> {
            self.events.lock().iter().map(|(k, _)| k.clone()).collect()
        }

        fn rows(&self) -> Vec<(String, String)> {
            self.events.lock().clone()
        }
    }

    impl EventSink for CollectingSink {
        fn event(&self, kind: &str, _k: &str, _v1: &str, v2: &str, _notes: &str) {
            self.events.lock().push((kind.to_string(), v2.to_string()));
        }
    }

    fn fast_params() -> TrainParams {
        TrainParams {
            spike_duration_ms: 12,
            isi_ms: 10,
            baseline_pulse_ms: 10,
            inter_train_gap_ms: 5,
            poll_interval_ms: 1,
            max_trains: 1,
            ..TrainParams::default()
        }
    }

    fn engine_with(
        params: TrainParams,
        sink: Arc<dyn EventSink>,
    ) -> (SpikeTrainEngine, MemoryTransport, Arc<Mutex<YokeStore>>) {
        let transport = MemoryTransport::new();
        let driver = Arc::new(
            ThermodeDriver::open_with(Box::new(transport.clone()), None).expect("open"),
        );
        let yoke = Arc::new(Mutex::new(YokeStore::new(
            std::env::temp_dir().as_path(),
            "S001",
            "A",
            "Maze1",
        )));
        let engine = SpikeTrainEngine::new(params, driver, sink, Arc::clone(&yoke));
        (engine, transport, yoke)
    }

    fn run_to_completion(engine: &mut SpikeTrainEngine, mode: TrainMode, budget: Duration) {
        engine.start(mode).unwrap();
        let deadline = Instant::now() + budget;
        while engine.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!engine.is_running(), "engine should finish within budget");
        engine.stop();
    }

    #[test]
    fn test_stop_code_trailing_window() {
        let mut m = StopCodeMatcher::new("258");
        assert!(!m.push('1'));
        assert!(!m.push('2'));
        assert!(!m.push('5'));
        assert!(m.push('8')); // `258` is the trailing window of `1258`
        // No retrigger on further digits within the same train
        assert!(!m.push('2'));
        assert!(!m.push('5'));
        assert!(!m.push('8'));
        assert!(m.matched());

        m.reset();
        assert!(!m.matched());
        assert!(!m.push('8'));
    }

    #[test]
    fn test_stop_code_ignores_non_digits() {
        let mut m = StopCodeMatcher::new("42");
        assert!(!m.push('4'));
        assert!(!m.push('x'));
        assert!(m.push('2')); // non-digit did not break the window
    }

    #[test]
    fn test_empty_stop_code_never_matches() {
        let mut m = StopCodeMatcher::new("");
        assert!(!m.push('1'));
        assert!(!m.matched());
    }

    #[test]
    fn test_ramp_produces_exactly_ten_spikes_39_to_48() {
        // start 39, end 49, step 1, max 10: the cap stops the ramp at 48 °C
        let sink = CollectingSink::new();
        let (mut engine, transport, _) = engine_with(fast_params(), sink.clone());
        run_to_completion(&mut engine, TrainMode::Free, Duration::from_secs(10));

        let rows = sink.rows();
        let spike_count = rows.iter().filter(|(k, _)| k == "SPIKE_START").count();
        assert_eq!(spike_count, 10);

        // Wire traffic: target temps ramp 39.0 → 48.0 (C0390 … C0480)
        let sent = transport.sent_ascii();
        let targets: Vec<&String> = sent
            .iter()
            .filter(|s| s.starts_with('C') && !s.ends_with("320"))
            .collect();
        assert_eq!(targets.len(), 10);
        assert_eq!(targets[0], "C0390");
        assert_eq!(targets[9], "C0480");
    }

    #[test]
    fn test_eleven_max_spikes_reaches_49_inclusive() {
        let sink = CollectingSink::new();
        let params = TrainParams {
            max_spikes: 11,
            force_baseline_between_spikes: false,
            ..fast_params()
        };
        let (mut engine, transport, _) = engine_with(params, sink.clone());
        run_to_completion(&mut engine, TrainMode::Free, Duration::from_secs(10));

        let rows = sink.rows();
        let spike_count = rows.iter().filter(|(k, _)| k == "SPIKE_START").count();
        assert_eq!(spike_count, 11);

        let sent = transport.sent_ascii();
        assert!(sent.contains(&"C0490".to_string()));
        // The epsilon boundary stops the ramp; 50 °C is never commanded
        assert!(!sent.contains(&"C0500".to_string()));
    }

    #[test]
    fn test_record_mode_captures_no_abort_sentinels() {
        let sink = CollectingSink::new();
        let params = TrainParams {
            max_trains: 2,
            max_spikes: 2,
            ..fast_params()
        };
        let (mut engine, _transport, yoke) = engine_with(params, sink.clone());
        yoke.lock().begin_round(0);

        let finished: Arc<PlMutex<Vec<(u32, bool)>>> = Arc::new(PlMutex::new(Vec::new()));
        let finished_log = Arc::clone(&finished);
        engine.set_train_finished_hook(Arc::new(move |idx, aborted| {
            finished_log.lock().push((idx, aborted));
        }));

        run_to_completion(&mut engine, TrainMode::Record, Duration::from_secs(10));

        assert_eq!(*finished.lock(), vec![(0, false), (1, false)]);
        assert_eq!(yoke.lock().pending(), &[None, None]);
        assert_eq!(
            sink.kinds()
                .iter()
                .filter(|k| *k == "TRAIN_END")
                .count(),
            2
        );
    }

    #[test]
    fn test_stop_code_aborts_current_train_only() {
        let sink = CollectingSink::new();
        // Long ramp so the stop code lands mid-train; targets stay within
        // the protocol's 0..=60 °C window
        let params = TrainParams {
            max_trains: 2,
            max_spikes: 20,
            spike_duration_ms: 40,
            end_temp_c: 59.0,
            ..fast_params()
        };
        let (mut engine, _transport, yoke) = engine_with(params, sink.clone());
        yoke.lock().begin_round(0);
        let input = engine.input_handle();

        engine.start(TrainMode::Record).unwrap();
        std::thread::sleep(Duration::from_millis(15));
        for c in "1258".chars() {
            input.send(c).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(15);
        while engine.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.stop();

        let rows = sink.rows();
        let ends: Vec<&(String, String)> = rows.iter().filter(|(k, _)| k == "TRAIN_END").collect();
        assert_eq!(ends.len(), 2);
        assert_eq!(ends[0].1, "aborted=1"); // stop code ended train 0
        assert_eq!(ends[1].1, "aborted=0"); // train 1 ran clean

        let pending = yoke.lock().pending().to_vec();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].is_some());
        assert!(pending[0].unwrap() > 0.0);
        assert!(pending[1].is_none());
    }

    #[test]
    fn test_yoke_playback_reproduces_abort_timing() {
        let sink = CollectingSink::new();
        let params = TrainParams {
            max_trains: 3,
            max_spikes: 3,
            spike_duration_ms: 60,
            isi_ms: 20,
            force_baseline_between_spikes: false,
            ..fast_params()
        };
        let (mut engine, _transport, _) = engine_with(params, sink.clone());

        // Trains 0 and 2 abort early; train 1 runs unaborted
        let queue = PlaybackQueue::new(vec![Some(0.03), None, Some(0.02)]);
        run_to_completion(&mut engine, TrainMode::Playback(queue), Duration::from_secs(15));

        let rows = sink.rows();
        let ends: Vec<&(String, String)> = rows.iter().filter(|(k, _)| k == "TRAIN_END").collect();
        assert_eq!(ends.len(), 3);
        assert_eq!(ends[0].1, "aborted=1");
        assert_eq!(ends[1].1, "aborted=0");
        assert_eq!(ends[2].1, "aborted=1");

        // An aborted train ends after the planned offset but long before a
        // full 3-spike run (~240 ms)
        let spike_count = rows.iter().filter(|(k, _)| k == "SPIKE_START").count();
        assert!(spike_count >= 3 + 1, "train 1 runs all spikes, 0 and 2 cut short");
    }

    #[test]
    fn test_exhausted_queue_runs_remaining_trains_unbounded() {
        let sink = CollectingSink::new();
        let params = TrainParams {
            max_trains: 5,
            max_spikes: 1,
            force_baseline_between_spikes: false,
            ..fast_params()
        };
        let (mut engine, _transport, _) = engine_with(params, sink.clone());

        // 3 recorded offsets for a 5-train round
        let queue = PlaybackQueue::new(vec![Some(0.001), Some(0.001), None]);
        run_to_completion(&mut engine, TrainMode::Playback(queue), Duration::from_secs(15));

        let rows = sink.rows();
        let ends: Vec<&(String, String)> = rows.iter().filter(|(k, _)| k == "TRAIN_END").collect();
        assert_eq!(ends.len(), 5);
        assert_eq!(ends[0].1, "aborted=1");
        assert_eq!(ends[1].1, "aborted=1");
        // Trains 2..4 run without any planned abort
        assert_eq!(ends[2].1, "aborted=0");
        assert_eq!(ends[3].1, "aborted=0");
        assert_eq!(ends[4].1, "aborted=0");
    }

    #[test]
    fn test_disable_stops_mid_train() {
        let sink = Arc::new(NullSink);
        let params = TrainParams {
            max_trains: 0,
            spike_duration_ms: 5000,
            ..fast_params()
        };
        let (mut engine, _transport, _) = engine_with(params, sink);
        engine.start(TrainMode::Free).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let stop_started = Instant::now();
        engine.stop();
        assert!(stop_started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_double_start_rejected() {
        let sink = Arc::new(NullSink);
        let params = TrainParams {
            spike_duration_ms: 2000,
            max_trains: 0,
            ..fast_params()
        };
        let (mut engine, _transport, _) = engine_with(params, sink);
        engine.start(TrainMode::Free).unwrap();
        assert!(engine.start(TrainMode::Free).is_err());
        engine.stop();
    }
}
