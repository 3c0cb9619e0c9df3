//! ═══════════════════════════════════════════════════════════════════════════════
//! SESSION — Block Scheduler
//! ═══════════════════════════════════════════════════════════════════════════════
//!
//! Runs the full experiment structure: `cycles` passes through the three
//! contexts A, B, C, each occupied for a fixed wall-clock block. A context's
//! condition decides what the thermode does there:
//!
//! - `Off`        — no stimulation;
//! - `Control`    — free-running trains whose abort outcomes are recorded
//!                  as a yoke round and saved at block end;
//! - `NoControl`  — trains replay a donor round's abort timing; the stop
//!                  code has no planned effect on the replayed schedule.
//!
//! A block's deadline is fixed when the block starts. Escapes trigger a
//! respawn countdown but never extend the deadline: time spent respawning
//! is time lost from the block.
//! ═══════════════════════════════════════════════════════════════════════════════

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::driver::ThermodeDriver;
use crate::error::Result;
use crate::recorder::EventSink;
use crate::train::{SpikeTrainEngine, TrainMode};
use crate::yoke::{YokeSelector, YokeStore};

/// The three maze contexts, visited in order within every cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextId {
    A,
    B,
    C,
}

impl ContextId {
    pub const ALL: [ContextId; 3] = [ContextId::A, ContextId::B, ContextId::C];

    pub fn name(&self) -> &'static str {
        match self {
            ContextId::A => "A",
            ContextId::B => "B",
            ContextId::C => "C",
        }
    }
}

/// Thermode condition assigned to a context for the whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    Off,
    Control,
    NoControl,
}

impl Condition {
    pub fn name(&self) -> &'static str {
        match self {
            Condition::Off => "Off",
            Condition::Control => "Control",
            Condition::NoControl => "NoControl",
        }
    }
}

/// One context → condition binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAssignment {
    pub context: ContextId,
    pub condition: Condition,
}

/// World the subject moves through. The scheduler only needs to know when
/// an escape happens and how to put the subject back.
pub trait Environment: Send {
    /// Called at block start, when the subject enters a context
    fn enter_context(&mut self, context: ContextId) {
        let _ = context;
    }

    /// True when an escape signal is pending. Edge-triggered: a pending
    /// signal is consumed by the call that observes it.
    fn poll_escape(&mut self) -> bool;

    /// Return the subject to a spawn point after an escape
    fn respawn(&mut self);
}

/// Operator-facing side of a session: instruction screens, countdowns,
/// rating prompts, breaks.
pub trait OperatorInterface: Send {
    fn instructions(&mut self, context: ContextId, condition: Condition);

    /// Show a labelled countdown for `seconds` seconds
    fn countdown(&mut self, label: &str, seconds: u32);

    /// Collect one rating value for a metric
    fn rating(&mut self, context: ContextId, cycle: u32, metric: &str) -> f32;

    fn break_screen(&mut self, completed_cycle: u32);
}

/// Number of candidate spawn points in the simulated world
const SIM_SPAWN_POINTS: u8 = 4;

/// Stand-in world for dry runs: escapes fire at random and respawns pick a
/// random spawn point.
pub struct SimWorld {
    escape_probability: f64,
    context: ContextId,
}

impl SimWorld {
    /// `escape_probability` is per escape poll
    pub fn new(escape_probability: f64) -> Self {
        Self {
            escape_probability,
            context: ContextId::A,
        }
    }
}

impl Environment for SimWorld {
    fn enter_context(&mut self, context: ContextId) {
        self.context = context;
    }

    fn poll_escape(&mut self) -> bool {
        rand::thread_rng().gen_bool(self.escape_probability)
    }

    fn respawn(&mut self) {
        // Lever/puzzle state resets with the spawn pick
        let spawn = rand::thread_rng().gen_range(0..SIM_SPAWN_POINTS);
        info!(context = self.context.name(), spawn, "sim respawn");
    }
}

/// Drives a full session: block loop, escape handling, yoke round
/// bookkeeping, ratings.
pub struct SessionScheduler {
    config: SessionConfig,
    driver: Arc<ThermodeDriver>,
    engine: SpikeTrainEngine,
    sink: Arc<dyn EventSink>,
    yoke: Arc<Mutex<YokeStore>>,
    environment: Box<dyn Environment>,
    operator: Box<dyn OperatorInterface>,
    round_index: u32,
}

impl SessionScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        driver: Arc<ThermodeDriver>,
        engine: SpikeTrainEngine,
        sink: Arc<dyn EventSink>,
        yoke: Arc<Mutex<YokeStore>>,
        environment: Box<dyn Environment>,
        operator: Box<dyn OperatorInterface>,
    ) -> Self {
        Self {
            config,
            driver,
            engine,
            sink,
            yoke,
            environment,
            operator,
            round_index: 0,
        }
    }

    /// Donor selector for NoControl blocks, per configuration
    fn yoke_selector(&self) -> YokeSelector {
        let y = &self.config.yoke;
        if y.use_durations && !y.durations_path.is_empty() {
            YokeSelector::Durations(y.durations_path.clone().into())
        } else {
            YokeSelector::Pattern(y.pattern.clone())
        }
    }

    /// Completed yoke rounds saved so far
    pub fn rounds_saved(&self) -> u32 {
        self.round_index
    }

    /// Run the whole session, then release the device.
    pub fn run(&mut self) -> Result<()> {
        let cycles = self.config.schedule.cycles;
        info!(
            subject = %self.config.subject_id,
            session = %self.config.session_id,
            cycles,
            "session start"
        );
        self.sink.event(
            "SESSION_START",
            "subject",
            &self.config.subject_id,
            &self.config.session_id,
            "",
        );
        // The bindings are fixed for the whole session; log them up front so
        // the event file is self-describing
        for context in ContextId::ALL {
            self.sink.assignment(context, self.config.condition_for(context));
        }

        for cycle in 0..cycles {
            for context in ContextId::ALL {
                self.run_block(cycle, context)?;
            }
            if cycle + 1 < cycles {
                self.operator.break_screen(cycle);
            }
        }

        self.sink.session_end();
        self.driver.close();
        info!("session end");
        Ok(())
    }

    /// One context block: fixed deadline, escape/respawn loop, per-condition
    /// train mode, ratings at the end.
    pub fn run_block(&mut self, cycle: u32, context: ContextId) -> Result<()> {
        let condition = self.config.condition_for(context);
        let schedule = self.config.schedule.clone();
        info!(
            cycle,
            context = context.name(),
            condition = condition.name(),
            "block start"
        );
        self.sink.event(
            "BLOCK_START",
            context.name(),
            condition.name(),
            &cycle.to_string(),
            "",
        );

        self.environment.enter_context(context);
        self.operator.instructions(context, condition);
        // Every block opens from a fresh spawn with puzzle state reset
        self.environment.respawn();
        self.sink.event("RESPAWN", context.name(), &cycle.to_string(), "", "");

        let mut recording_round = false;
        match condition {
            Condition::Off => {}
            Condition::Control => {
                self.yoke.lock().begin_round(self.round_index);
                self.engine.start(TrainMode::Record)?;
                recording_round = true;
            }
            Condition::NoControl => {
                let selector = self.yoke_selector();
                match self.yoke.lock().load(&selector) {
                    Ok(queue) => {
                        info!(trains = queue.len(), "yoked playback loaded");
                        self.engine.start(TrainMode::Playback(queue))?;
                    }
                    Err(e) => {
                        // Donor data is gone, not the session: the block
                        // runs, just without stimulation
                        warn!(error = %e, "no donor record; block runs unstimulated");
                        self.sink.event("YOKE_MISSING", context.name(), "", "", "");
                    }
                }
            }
        }

        // The deadline is set once; nothing below extends it
        let deadline = Instant::now() + Duration::from_secs_f64(schedule.block_seconds);
        let debounce = Duration::from_secs_f64(schedule.escape_debounce_sec);
        let poll = Duration::from_millis(schedule.poll_interval_ms.max(1));
        let mut last_escape: Option<Instant> = None;

        while Instant::now() < deadline {
            if self.environment.poll_escape() {
                let now = Instant::now();
                let debounced = last_escape.is_some_and(|t| now.duration_since(t) < debounce);
                if !debounced {
                    last_escape = Some(now);
                    self.sink
                        .event("ESCAPE", context.name(), &cycle.to_string(), "", "");
                    self.operator
                        .countdown("respawn", schedule.escape_countdown_sec);
                    self.environment.respawn();
                    self.sink.event("RESPAWN", context.name(), &cycle.to_string(), "", "");
                }
            }
            std::thread::sleep(poll);
        }

        self.operator.countdown("exit", schedule.exit_countdown_sec);
        self.engine.stop();

        if recording_round {
            let path = self.yoke.lock().end_round_and_save()?;
            info!(path = %path.display(), round = self.round_index, "yoke round saved");
            self.round_index += 1;
        }

        for metric in ["pain", "liking", "difficulty"] {
            let value = self.operator.rating(context, cycle, metric);
            self.sink.rating(context, cycle, metric, value);
        }

        self.sink.event(
            "BLOCK_END",
            context.name(),
            condition.name(),
            &cycle.to_string(),
            "",
        );
        Ok(())
    }
}
