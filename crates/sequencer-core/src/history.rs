//! Previously run sequences, most recent first.
//!
//! Stored as a YAML list of paths. The list never holds duplicates and never
//! grows past `max_entries`; re-running a sequence moves it to the front.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::io::{atomic_write, read_optional};
use crate::runner::{RunHistorySink, RunRecord};

#[derive(Debug, Clone)]
pub struct SequenceHistory {
    path: PathBuf,
    max_entries: usize,
}

impl SequenceHistory {
    /// Open the history file, creating an empty one when absent.
    pub fn open(path: impl Into<PathBuf>, max_entries: usize) -> Result<Self> {
        let history = Self {
            path: path.into(),
            max_entries,
        };
        if read_optional(&history.path)?.is_none() {
            history.save(&[])?;
        }
        Ok(history)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let Some(data) = read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn most_recent(&self) -> Result<Option<PathBuf>> {
        Ok(self.entries()?.into_iter().next())
    }

    /// Move `sequence` to the front, dropping older duplicates and anything
    /// past the cap.
    pub fn append(&self, sequence: &Path) -> Result<()> {
        let mut entries = self.entries()?;
        if entries.first().map(PathBuf::as_path) == Some(sequence) {
            return Ok(());
        }
        entries.retain(|p| p != sequence);
        entries.insert(0, sequence.to_path_buf());
        entries.truncate(self.max_entries);
        debug!(path = %self.path.display(), entries = entries.len(), "history updated");
        self.save(&entries)
    }

    /// Re-apply the cap, e.g. after `max_entries` was lowered.
    pub fn truncate(&self) -> Result<()> {
        let mut entries = self.entries()?;
        if entries.len() > self.max_entries {
            entries.truncate(self.max_entries);
            self.save(&entries)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.save(&[])
    }

    fn save(&self, entries: &[PathBuf]) -> Result<()> {
        let data = serde_yaml::to_string(entries)?;
        atomic_write(&self.path, data.as_bytes())
    }
}

impl RunHistorySink for SequenceHistory {
    fn record(&self, record: &RunRecord) -> Result<()> {
        match &record.sequence {
            Some(path) => self.append(path),
            None => Ok(()),
        }
    }
}
