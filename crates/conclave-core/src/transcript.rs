//! Append-only session transcripts.
//!
//! One directory per session: `request.json`, `stage1.json`,
//! `stage2.json`, `stage3.json`, `result.json`, and `events.ndjson`
//! (append-only). The transcript is sealed when the session reaches a
//! terminal event; writes after sealing are rejected.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use conclave_types::{CouncilError, LayerEvent, Result};

use crate::bus::EventSink;

/// Creates per-session transcript directories under a root.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    root: PathBuf,
}

impl TranscriptStore {
    /// Store rooted at `root` (created on demand).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a transcript for one session.
    pub fn open_session(&self, query_id: &str) -> Result<SessionTranscript> {
        let dir = self.root.join(query_id);
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "session transcript opened");
        Ok(SessionTranscript {
            dir,
            state: Mutex::new(TranscriptState { sealed: false }),
        })
    }
}

struct TranscriptState {
    sealed: bool,
}

/// One session's transcript directory.
pub struct SessionTranscript {
    dir: PathBuf,
    state: Mutex<TranscriptState>,
}

impl SessionTranscript {
    /// The session directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one named stage file (`request`, `stage1`, `stage2`,
    /// `stage3`, `result`).
    pub fn write_stage<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.ensure_open()?;
        let path = self.dir.join(format!("{name}.json"));
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, json)?;
        debug!(path = %path.display(), "stage written");
        Ok(())
    }

    /// Append one event to `events.ndjson`.
    pub fn append_event(&self, event: &LayerEvent) -> Result<()> {
        self.ensure_open()?;
        let path = self.dir.join("events.ndjson");
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Seal the transcript. Subsequent writes fail.
    pub fn seal(&self) {
        let mut state = self.state.lock().expect("transcript lock");
        state.sealed = true;
        debug!(dir = %self.dir.display(), "transcript sealed");
    }

    /// Whether the transcript has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.state.lock().expect("transcript lock").sealed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_sealed() {
            return Err(CouncilError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "transcript is sealed",
            )));
        }
        Ok(())
    }
}

impl EventSink for SessionTranscript {
    fn append(&self, event: &LayerEvent) {
        // A transcript write failure must not take the session down;
        // the in-memory event log still has the event.
        if let Err(e) = self.append_event(event) {
            tracing::warn!(error = %e, "event transcript append failed");
        }
    }
}
