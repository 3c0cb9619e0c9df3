//! ═══════════════════════════════════════════════════════════════════════════════
//! CONFIG — Session Settings
//! ═══════════════════════════════════════════════════════════════════════════════
//! Per-session configuration: subject identity, serial link, train timing,
//! block schedule, yoke playback source. JSON on disk; every struct carries
//! usable defaults so a missing file still yields a runnable dry session.
//! ═══════════════════════════════════════════════════════════════════════════════

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::session::{Condition, ContextAssignment, ContextId};
use crate::train::TrainParams;

/// Main session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Subject identifier (drives output and yoke filenames)
    pub subject_id: String,

    /// Session identifier
    pub session_id: String,

    /// Context/maze identifier
    pub context_id: String,

    /// Output directory for events and yoke records
    pub data_dir: PathBuf,

    /// Flush the event recorder after every write (safer, slower)
    pub flush_every_write: bool,

    /// Serial link settings
    pub serial: SerialSettings,

    /// Spike-train timing and ramp parameters
    pub train: TrainParams,

    /// Block/cycle schedule
    pub schedule: ScheduleSettings,

    /// Yoke playback source for NoControl blocks
    pub yoke: YokeSettings,
}

/// Serial port settings for the thermode link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port name, e.g. "COM5" or "/dev/ttyUSB0"
    pub port: String,

    /// Baud rate
    pub baud: u32,

    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Assert DTR after open
    pub dtr: bool,

    /// Assert RTS after open
    pub rts: bool,
}

/// Block/cycle schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    /// Wall-clock duration of one context block in seconds
    pub block_seconds: f64,

    /// Number of A,B,C cycles
    pub cycles: u32,

    /// Ignore escape signals arriving within this window of the previous one
    pub escape_debounce_sec: f64,

    /// Scheduler poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Countdown shown before an escape respawn, seconds
    pub escape_countdown_sec: u32,

    /// Countdown shown when a block's time is up, seconds
    pub exit_countdown_sec: u32,

    /// Context → thermode condition, fixed for the whole session
    pub assignments: Vec<ContextAssignment>,
}

/// Yoke playback source settings (NoControl blocks)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YokeSettings {
    /// Record filename pattern; `{subject}`, `{session}`, `{context}` tokens
    /// and `*` wildcards are expanded against the data directory
    pub pattern: String,

    /// Path to an alternate "durations" record (raw seconds per train)
    pub durations_path: String,

    /// Prefer the durations record over `pattern`
    pub use_durations: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subject_id: "S001".to_string(),
            session_id: "A".to_string(),
            context_id: "Maze1".to_string(),
            data_dir: PathBuf::from("."),
            flush_every_write: false,
            serial: SerialSettings::default(),
            train: TrainParams::default(),
            schedule: ScheduleSettings::default(),
            yoke: YokeSettings::default(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "COM5".to_string(),
            baud: 115_200,
            read_timeout_ms: 5000,
            dtr: true,
            rts: false,
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            block_seconds: 300.0,
            cycles: 4,
            escape_debounce_sec: 0.75,
            poll_interval_ms: 10,
            escape_countdown_sec: 3,
            exit_countdown_sec: 3,
            assignments: vec![
                ContextAssignment {
                    context: ContextId::A,
                    condition: Condition::Off,
                },
                ContextAssignment {
                    context: ContextId::B,
                    condition: Condition::Control,
                },
                ContextAssignment {
                    context: ContextId::C,
                    condition: Condition::NoControl,
                },
            ],
        }
    }
}

impl Default for YokeSettings {
    fn default() -> Self {
        Self {
            pattern: "{subject}_{session}_{context}_Y*_yoke.json".to_string(),
            durations_path: String::new(),
            use_durations: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Condition assigned to a context, `Off` when unassigned
    pub fn condition_for(&self, context: ContextId) -> Condition {
        self.schedule
            .assignments
            .iter()
            .find(|a| a.context == context)
            .map(|a| a.condition)
            .unwrap_or(Condition::Off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_runnable() {
        let config = SessionConfig::default();
        assert_eq!(config.schedule.cycles, 4);
        assert_eq!(config.train.stop_code, "258");
        assert_eq!(config.condition_for(ContextId::B), Condition::Control);
        assert_eq!(config.condition_for(ContextId::C), Condition::NoControl);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.subject_id, config.subject_id);
        assert_eq!(back.serial.baud, 115_200);
        assert_eq!(back.yoke.pattern, config.yoke.pattern);
    }

    #[test]
    fn test_load_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let mut config = SessionConfig::default();
        config.subject_id = "S042".to_string();
        config.save(&path).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.subject_id, "S042");
    }
}
