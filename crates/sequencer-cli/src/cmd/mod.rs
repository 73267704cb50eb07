pub mod config;
pub mod history;
pub mod run;
pub mod validate;

use anyhow::Context;
use sequencer_core::config::SequencerConfig;
use sequencer_core::history::SequenceHistory;
use std::path::{Path, PathBuf};

/// Load the config from `explicit` when given, else `<root>/sequencer.yaml`.
pub fn load_config(root: &Path, explicit: Option<&Path>) -> anyhow::Result<SequencerConfig> {
    match explicit {
        Some(path) => SequencerConfig::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => SequencerConfig::load(root).context("failed to load config"),
    }
}

pub fn open_history(root: &Path, config: &SequencerConfig) -> anyhow::Result<SequenceHistory> {
    let path = config.history_path(root);
    SequenceHistory::open(&path, config.history.max_entries)
        .with_context(|| format!("failed to open history {}", path.display()))
}

/// Find a sequence file: as given, else under the configured sequence
/// directory. The result is absolute so history entries stay usable from
/// any working directory.
pub fn resolve_sequence_path(
    root: &Path,
    config: &SequencerConfig,
    file: &Path,
) -> anyhow::Result<PathBuf> {
    let candidates = [file.to_path_buf(), config.sequence_dir(root).join(file)];
    let found = candidates
        .iter()
        .find(|p| p.is_file())
        .with_context(|| format!("sequence file not found: {}", file.display()))?;
    std::fs::canonicalize(found)
        .with_context(|| format!("failed to resolve {}", found.display()))
}
