//! ═══════════════════════════════════════════════════════════════════════════════
//! PAINLAB — Entry Point
//! ═══════════════════════════════════════════════════════════════════════════════
//! Console front-end for the session rig. One stdin reader feeds both the
//! engine's stop-code digits and the operator prompts; `e` + Enter signals
//! an escape during a block.
//! ═══════════════════════════════════════════════════════════════════════════════

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use painlab::config::SessionConfig;
use painlab::driver::{MemoryTransport, StatusHook, ThermodeDriver};
use painlab::recorder::{CsvRecorder, EventSink};
use painlab::session::{
    Condition, ContextId, Environment, OperatorInterface, SessionScheduler, SimWorld,
};
use painlab::telemetry;
use painlab::train::SpikeTrainEngine;
use painlab::yoke::YokeStore;

#[derive(Parser)]
#[command(name = "painlab")]
#[command(about = "Thermode session rig", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session
    Run {
        /// Session configuration file (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Use a loopback transport and a simulated world instead of the
        /// serial port
        #[arg(long)]
        dry_run: bool,
    },

    /// Write a default configuration file
    InitConfig {
        /// Destination path
        #[arg(default_value = "session.json")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { path } => {
            SessionConfig::default()
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "default configuration written");
            Ok(())
        }
        Commands::Run { config, dry_run } => run_session(config, dry_run),
    }
}

fn run_session(config_path: Option<PathBuf>, dry_run: bool) -> Result<()> {
    let config = match config_path {
        Some(path) => SessionConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            info!("no configuration file; running with defaults");
            SessionConfig::default()
        }
    };

    let recorder = CsvRecorder::create(
        &config.data_dir,
        &config.subject_id,
        &config.session_id,
        &config.context_id,
        config.flush_every_write,
    )?;
    info!(path = %recorder.path().display(), "event log");
    let sink: Arc<dyn EventSink> = Arc::new(recorder);

    let hook: Arc<dyn StatusHook> = Arc::new(ConnectionEvents {
        sink: Arc::clone(&sink),
    });
    let driver = if dry_run {
        Arc::new(ThermodeDriver::open_with(
            Box::new(MemoryTransport::new()),
            Some(hook),
        )?)
    } else {
        match ThermodeDriver::open(&config.serial, Some(hook)) {
            Ok(driver) => Arc::new(driver),
            Err(e) => {
                // The session still runs; stimulation is simply absent
                warn!(port = %config.serial.port, error = %e, "thermode unavailable");
                Arc::new(ThermodeDriver::closed())
            }
        }
    };

    let yoke = Arc::new(Mutex::new(YokeStore::new(
        &config.data_dir,
        &config.subject_id,
        &config.session_id,
        &config.context_id,
    )));

    let engine = SpikeTrainEngine::new(
        config.train.clone(),
        Arc::clone(&driver),
        Arc::clone(&sink),
        Arc::clone(&yoke),
    );

    // One stdin reader fans out to the engine (stop-code digits), the
    // console world (escape key) and the operator (rating lines)
    let digits = engine.input_handle();
    let (escape_tx, escape_rx) = unbounded::<char>();
    let (line_tx, line_rx) = unbounded::<String>();
    spawn_stdin_pump(digits, escape_tx, line_tx)?;

    let environment: Box<dyn Environment> = if dry_run {
        Box::new(SimWorld::new(0.002))
    } else {
        Box::new(ConsoleWorld { keys: escape_rx })
    };
    let operator = Box::new(ConsoleOperator { lines: line_rx });

    let mut scheduler = SessionScheduler::new(
        config, driver, engine, sink, yoke, environment, operator,
    );
    scheduler.run()?;
    info!(rounds = scheduler.rounds_saved(), "session complete");
    Ok(())
}

fn spawn_stdin_pump(
    digits: Sender<char>,
    escapes: Sender<char>,
    lines: Sender<String>,
) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin-pump".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                for c in line.chars() {
                    let _ = digits.send(c);
                    let _ = escapes.send(c);
                }
                if lines.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawning stdin pump")?;
    Ok(())
}

/// Mirrors driver connectivity changes into the event log
struct ConnectionEvents {
    sink: Arc<dyn EventSink>,
}

impl StatusHook for ConnectionEvents {
    fn opened(&self) {
        self.sink.event("CONNECTION", "open", "1", "", "");
    }

    fn closed(&self) {
        self.sink.event("CONNECTION", "open", "0", "", "");
    }

    fn write_error(&self, err: &std::io::Error) {
        self.sink
            .event("CONNECTION", "write_error", &err.to_string(), "", "");
    }
}

/// Console-driven world: `e` typed during a block signals an escape
struct ConsoleWorld {
    keys: Receiver<char>,
}

impl Environment for ConsoleWorld {
    fn poll_escape(&mut self) -> bool {
        let mut escaped = false;
        while let Ok(c) = self.keys.try_recv() {
            if c.eq_ignore_ascii_case(&'e') {
                escaped = true;
            }
        }
        escaped
    }

    fn respawn(&mut self) {
        println!("*** respawned ***");
    }
}

/// Blocking console prompts for instructions, countdowns and ratings
struct ConsoleOperator {
    lines: Receiver<String>,
}

impl ConsoleOperator {
    fn next_line(&self) -> Option<String> {
        self.lines.recv().ok()
    }
}

impl OperatorInterface for ConsoleOperator {
    fn instructions(&mut self, context: ContextId, condition: Condition) {
        println!(
            "=== entering context {} ({}) ===",
            context.name(),
            condition.name()
        );
    }

    fn countdown(&mut self, label: &str, seconds: u32) {
        for remaining in (1..=seconds).rev() {
            println!("{} in {}...", label, remaining);
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
    }

    fn rating(&mut self, context: ContextId, cycle: u32, metric: &str) -> f32 {
        loop {
            println!(
                "[{} / cycle {}] rate {} (0-10):",
                context.name(),
                cycle,
                metric
            );
            match self.next_line() {
                Some(line) => match line.trim().parse::<f32>() {
                    Ok(value) if (0.0..=10.0).contains(&value) => return value,
                    _ => println!("enter a number between 0 and 10"),
                },
                None => {
                    warn!("stdin closed; recording rating as 0");
                    return 0.0;
                }
            }
        }
    }

    fn break_screen(&mut self, completed_cycle: u32) {
        println!(
            "=== cycle {} complete — press Enter to continue ===",
            completed_cycle + 1
        );
        let _ = self.next_line();
    }
}
