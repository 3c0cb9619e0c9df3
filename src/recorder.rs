//! ═══════════════════════════════════════════════════════════════════════════════
//! RECORDER — Structured Event Sink
//! ═══════════════════════════════════════════════════════════════════════════════
//! The core emits timestamped event records (train/spike boundaries, lever
//! and button state, escape/respawn, ratings) into an [`EventSink`] handle
//! created at session start and passed explicitly to every component that
//! records. Sink failures are best-effort: logged, never propagated into the
//! stimulation or scheduling path.
//! ═══════════════════════════════════════════════════════════════════════════════

use chrono::Utc;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::warn;

use crate::error::Result;
use crate::session::{Condition, ContextId};

/// Sink for timestamped session events. One active sink per session; pass
/// the handle explicitly, never through ambient state.
pub trait EventSink: Send + Sync {
    /// Emit one event row
    fn event(&self, kind: &str, k: &str, v1: &str, v2: &str, notes: &str);

    fn train_start(&self, train: u32) {
        self.event("TRAIN_START", "idx", &train.to_string(), "", "");
    }

    fn train_end(&self, train: u32, aborted: bool) {
        self.event(
            "TRAIN_END",
            "idx",
            &train.to_string(),
            if aborted { "aborted=1" } else { "aborted=0" },
            "",
        );
    }

    fn spike_start(&self, train: u32, spike: u32, surface: u8, temp_c: f32, duration_ms: u32) {
        self.event(
            "SPIKE_START",
            "t,s",
            &format!("{},{}", train, spike),
            &format!("surf={}", surface),
            &format!("temp={:.1},durMs={}", temp_c, duration_ms),
        );
    }

    fn spike_end(&self, train: u32, spike: u32, surface: u8) {
        self.event(
            "SPIKE_END",
            "t,s",
            &format!("{},{}", train, spike),
            &format!("surf={}", surface),
            "",
        );
    }

    fn button(&self, name: &str, pressed: bool) {
        self.event("BUTTON", name, if pressed { "1" } else { "0" }, "", "");
    }

    fn lever(&self, idx: u8, state: i8) {
        self.event("LEVER", "idx", &idx.to_string(), &state.to_string(), "");
    }

    fn rating(&self, context: ContextId, cycle: u32, metric: &str, value: f32) {
        self.event(
            "RATING",
            metric,
            &format!("{:.1}", value),
            context.name(),
            &format!("cycle={}", cycle),
        );
    }

    /// One row per context → condition binding, emitted before the first block
    fn assignment(&self, context: ContextId, condition: Condition) {
        self.event("ASSIGNMENT", context.name(), condition.name(), "", "");
    }

    fn session_end(&self) {
        self.event("SESSION_END", "", "", "", "");
    }
}

/// Discards everything. Stands in when recording is disabled.
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _kind: &str, _k: &str, _v1: &str, _v2: &str, _notes: &str) {}
}

/// Append-only CSV event recorder.
///
/// Columns: `stamp_utc,elapsed_sec,type,k,v1,v2,notes`
pub struct CsvRecorder {
    writer: Mutex<BufWriter<File>>,
    started: Instant,
    flush_every_write: bool,
    path: PathBuf,
}

impl CsvRecorder {
    /// Create `{subject}_{session}_{context}_{yyyymmdd_hhmmss}_events.csv`
    /// under `dir` and write the header row.
    pub fn create(
        dir: &Path,
        subject: &str,
        session: &str,
        context: &str,
        flush_every_write: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!(
            "{}_{}_{}_{}_events.csv",
            subject, session, context, stamp
        ));

        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "stamp_utc,elapsed_sec,type,k,v1,v2,notes")?;
        writer.flush()?;

        Ok(Self {
            writer: Mutex::new(writer),
            started: Instant::now(),
            flush_every_write,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered rows to disk
    pub fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!(error = %e, "event recorder flush failed");
        }
    }
}

impl EventSink for CsvRecorder {
    fn event(&self, kind: &str, k: &str, v1: &str, v2: &str, notes: &str) {
        let stamp = Utc::now().to_rfc3339();
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut writer = self.writer.lock();
        let row = writeln!(
            writer,
            "{},{:.6},{},{},{},{},{}",
            stamp, elapsed, kind, k, v1, v2, notes
        );
        if let Err(e) = row {
            warn!(error = %e, kind, "event write failed");
            return;
        }
        if self.flush_every_write {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "event flush failed");
            }
        }
    }
}

impl Drop for CsvRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!(error = %e, "final event flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let rec = CsvRecorder::create(dir.path(), "S001", "A", "Maze1", true).unwrap();

        rec.train_start(0);
        rec.spike_start(0, 0, 0, 39.0, 2000);
        rec.spike_end(0, 0, 0);
        rec.train_end(0, true);
        rec.lever(1, 1);
        rec.button("CONFIRM", true);
        rec.rating(ContextId::B, 0, "pain", 6.5);
        rec.flush();

        let contents = std::fs::read_to_string(rec.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 8);
        assert!(lines[0].starts_with("stamp_utc,"));
        assert!(lines[1].contains("TRAIN_START"));
        assert!(lines[2].contains("temp=39.0"));
        assert!(lines[4].contains("aborted=1"));
        assert!(lines[5].contains("LEVER"));
        assert!(lines[6].contains("BUTTON,CONFIRM,1"));
        assert!(lines[7].contains("RATING,pain,6.5,B"));
    }

    #[test]
    fn test_filename_carries_identity() {
        let dir = tempfile::tempdir().unwrap();
        let rec = CsvRecorder::create(dir.path(), "S042", "B", "Maze2", false).unwrap();
        let name = rec.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("S042_B_Maze2_"));
        assert!(name.ends_with("_events.csv"));
    }

    #[test]
    fn test_null_sink_is_silent() {
        let sink = NullSink;
        sink.event("X", "", "", "", "");
        sink.train_end(3, false);
    }
}
