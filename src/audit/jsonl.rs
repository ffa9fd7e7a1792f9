//! Per-session JSONL timelines.
//!
//! One file per session under the configured directory, one event per
//! line. Appends are serialized per file by a mutex; the loader discards
//! malformed lines and returns events sorted by timestamp, which makes the
//! timeline the golden path for replaying a session in tests.

use crate::bus::{Event, EventBus};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Append-only JSONL writer keyed by session id.
pub struct JsonlWriter {
    dir: PathBuf,
    files: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

impl JsonlWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create audit dir: {}", dir.display()))?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    fn file_for(&self, session_id: &str) -> Result<Arc<Mutex<File>>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(session_id) {
            return Ok(Arc::clone(file));
        }
        let path = self.path_for(session_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open timeline: {}", path.display()))?;
        let file = Arc::new(Mutex::new(file));
        files.insert(session_id.to_string(), Arc::clone(&file));
        Ok(file)
    }

    /// Append one event as a JSON line.
    pub fn append(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let file = self.file_for(&event.session_id)?;
        let mut file = file.lock();
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Drop the cached handle for an ended session.
    pub fn close_session(&self, session_id: &str) {
        self.files.lock().remove(session_id);
    }
}

/// Load a session timeline: malformed lines are discarded with a log,
/// events are filtered by session (and optional types) and sorted by
/// `t_ms` ascending.
pub fn load_session_timeline(
    dir: &Path,
    session_id: &str,
    types: Option<&[String]>,
) -> Result<Vec<Event>> {
    let path = dir.join(format!("{session_id}.jsonl"));
    let file = File::open(&path)
        .with_context(|| format!("No timeline for session: {}", path.display()))?;

    let mut events = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    line = line_no + 1,
                    error = %e,
                    "Discarding malformed timeline line"
                );
                continue;
            }
        };
        if event.session_id != session_id {
            continue;
        }
        if let Some(types) = types {
            if !types.iter().any(|t| t == &event.event_type) {
                continue;
            }
        }
        events.push(event);
    }

    events.sort_by_key(|e| e.t_ms);
    Ok(events)
}

/// Load a timeline and optionally re-emit every event on the bus.
pub fn replay_session_timeline(
    dir: &Path,
    session_id: &str,
    bus: Option<&EventBus>,
) -> Result<Vec<Event>> {
    let events = load_session_timeline(dir, session_id, None)?;
    if let Some(bus) = bus {
        for event in &events {
            bus.emit(event.clone());
        }
    }
    Ok(events)
}
