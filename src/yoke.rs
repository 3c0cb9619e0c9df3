//! ═══════════════════════════════════════════════════════════════════════════════
//! YOKE — Abort-Timing Records for No-Control Playback
//! ═══════════════════════════════════════════════════════════════════════════════
//!
//! A control round records, per train, the offset-in-seconds at which the
//! subject aborted (or a no-abort sentinel). The saved record is replayed in
//! a later no-control round so a yoked subject experiences the same abort
//! timings without their own agency. Records are opaque blobs outside this
//! module: produced once, immutable after save, consumed in order.
//! ═══════════════════════════════════════════════════════════════════════════════

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::error::YokeError;

/// One control round's abort offsets. `None` = the train completed without
/// an abort. One slot per train, in train order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YokeRecord {
    #[serde(rename = "abortOffsetsSec")]
    pub abort_offsets_sec: Vec<Option<f64>>,
}

/// Alternate "durations" record shape: a flat list of raw seconds plus
/// free-text context/mode tags. Offsets `<= 0` mean no abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationsRecord {
    #[serde(default)]
    pub ctx: String,
    #[serde(default)]
    pub mode: String,
    pub durations: Vec<f64>,
}

/// How to resolve donor records for a playback round
#[derive(Debug, Clone)]
pub enum YokeSelector {
    /// One exact record file
    File(PathBuf),
    /// Filename pattern with `{subject}`/`{session}`/`{context}` tokens and
    /// `*` wildcards; matches load in ascending modification-time order
    Pattern(String),
    /// A durations-shaped record
    Durations(PathBuf),
}

/// Ordered queue of planned per-train abort offsets. Exhausting the queue is
/// the defined fallback, not a fault: trains past the end run unbounded.
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue {
    offsets: Vec<Option<f64>>,
    cursor: usize,
}

impl PlaybackQueue {
    pub fn new(offsets: Vec<Option<f64>>) -> Self {
        Self { offsets, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Planned abort offset for the next train, advancing the cursor.
    /// `None` both for recorded no-abort slots and past the end of the queue.
    pub fn take_next(&mut self) -> Option<f64> {
        let planned = self.offsets.get(self.cursor).copied().flatten();
        self.cursor += 1;
        planned
    }

    pub fn remaining(&self) -> usize {
        self.offsets.len().saturating_sub(self.cursor)
    }
}

/// Records control rounds and resolves donor records for playback rounds.
/// At most one round is active at a time.
pub struct YokeStore {
    dir: PathBuf,
    subject: String,
    session: String,
    context: String,
    recording: bool,
    round_index: u32,
    offsets: Vec<Option<f64>>,
}

impl YokeStore {
    pub fn new(dir: &Path, subject: &str, session: &str, context: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            subject: subject.to_string(),
            session: session.to_string(),
            context: context.to_string(),
            recording: false,
            round_index: 0,
            offsets: Vec::new(),
        }
    }

    pub fn recording(&self) -> bool {
        self.recording
    }

    /// Reset the in-memory sequence and start recording a new control round
    pub fn begin_round(&mut self, round_index: u32) {
        self.recording = true;
        self.round_index = round_index;
        self.offsets.clear();
        info!(round_index, "yoke round recording");
    }

    /// Append one train's outcome while recording. `None` = completed.
    pub fn push_outcome(&mut self, abort_offset_sec: Option<f64>) {
        if self.recording {
            self.offsets.push(abort_offset_sec);
        }
    }

    /// Offsets accumulated so far in the active round
    pub fn pending(&self) -> &[Option<f64>] {
        &self.offsets
    }

    /// Stop recording and write `{subject}_{session}_{context}_Y{nn}_yoke.json`.
    /// Returns the written path. A persistence failure is an error the caller
    /// must surface: losing the record breaks the paired no-control round.
    pub fn end_round_and_save(&mut self) -> Result<PathBuf, YokeError> {
        self.recording = false;

        std::fs::create_dir_all(&self.dir).map_err(|e| YokeError::Save(e.to_string()))?;
        let name = format!(
            "{}_{}_{}_Y{:02}_yoke.json",
            self.subject, self.session, self.context, self.round_index
        );
        let path = self.dir.join(name);

        let record = YokeRecord {
            abort_offsets_sec: std::mem::take(&mut self.offsets),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| YokeError::Save(e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| YokeError::Save(e.to_string()))?;

        info!(path = %path.display(), trains = record.abort_offsets_sec.len(), "yoke saved");
        Ok(path)
    }

    /// Resolve a selector into a playback queue. Multiple pattern matches
    /// are concatenated oldest-first. An empty result is reported, not fatal;
    /// the caller decides whether to run unyoked.
    pub fn load(&self, selector: &YokeSelector) -> Result<PlaybackQueue, YokeError> {
        let offsets = match selector {
            YokeSelector::File(path) => read_record(path)?,
            YokeSelector::Durations(path) => read_durations(path)?,
            YokeSelector::Pattern(template) => {
                let resolved = self.expand_tokens(template);
                let (dir, name_pattern) = split_pattern(&self.dir, &resolved);
                let mut matches = matching_files(&dir, &name_pattern)?;
                if matches.is_empty() {
                    return Err(YokeError::NoRecords(resolved));
                }
                matches.sort_by_key(|p| modified_time(p));

                let mut all = Vec::new();
                for path in &matches {
                    let mut offsets = read_record(path)?;
                    info!(path = %path.display(), trains = offsets.len(), "yoke loaded");
                    all.append(&mut offsets);
                }
                all
            }
        };

        if offsets.is_empty() {
            return Err(YokeError::NoRecords(format!("{:?}", selector)));
        }
        Ok(PlaybackQueue::new(offsets))
    }

    /// Expand `{subject}`/`{session}`/`{context}` template tokens
    pub fn expand_tokens(&self, template: &str) -> String {
        template
            .replace("{subject}", &self.subject)
            .replace("{session}", &self.session)
            .replace("{context}", &self.context)
    }
}

fn read_record(path: &Path) -> Result<Vec<Option<f64>>, YokeError> {
    let contents = std::fs::read_to_string(path).map_err(|e| YokeError::Malformed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let record: YokeRecord =
        serde_json::from_str(&contents).map_err(|e| YokeError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(record.abort_offsets_sec)
}

fn read_durations(path: &Path) -> Result<Vec<Option<f64>>, YokeError> {
    let contents = std::fs::read_to_string(path).map_err(|e| YokeError::Malformed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let record: DurationsRecord =
        serde_json::from_str(&contents).map_err(|e| YokeError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    // <= 0 is the no-abort sentinel in the durations shape
    Ok(record
        .durations
        .iter()
        .map(|&d| if d > 0.0 { Some(d) } else { None })
        .collect())
}

/// Split a resolved pattern into (directory, filename pattern), anchoring
/// relative patterns at the store directory.
fn split_pattern(store_dir: &Path, resolved: &str) -> (PathBuf, String) {
    let path = Path::new(resolved);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "*_yoke.json".to_string());
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            if path.is_absolute() {
                parent.to_path_buf()
            } else {
                store_dir.join(parent)
            }
        }
        _ => store_dir.to_path_buf(),
    };
    (dir, name)
}

fn matching_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, YokeError> {
    if !pattern.contains('*') {
        let path = dir.join(pattern);
        if path.exists() {
            return Ok(vec![path]);
        }
        return Ok(Vec::new());
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "yoke directory unreadable");
            return Ok(Vec::new());
        }
    };

    let mut matches = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if wildcard_match(pattern, &name) {
            matches.push(entry.path());
        }
    }
    Ok(matches)
}

fn modified_time(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Glob-lite matcher: literal characters plus `*` (any run, including empty)
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            // Backtrack: let the last star swallow one more character
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
