use crate::error::{Result, SequencerError};
use crate::executor::DEFAULT_STEP_TIMEOUT;
use crate::paths;
use crate::runner::{RunnerOptions, MAX_POLL_INTERVAL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// HistoryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Relative paths are taken from the root. Defaults to
    /// `.sequencer/history.yaml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize {
    10
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: default_max_entries(),
        }
    }
}

// ---------------------------------------------------------------------------
// SequencerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_timeout_sec")]
    pub default_timeout_sec: f64,
    #[serde(default)]
    pub strict_timeline: bool,
    /// Where bare sequence names are looked up. Relative to the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_dir: Option<PathBuf>,
    #[serde(default)]
    pub history: HistoryConfig,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_timeout_sec() -> f64 {
    60.0
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            default_timeout_sec: default_timeout_sec(),
            strict_timeline: false,
            sequence_dir: None,
            history: HistoryConfig::default(),
        }
    }
}

impl SequencerConfig {
    /// Load `sequencer.yaml` under `root`. A missing file yields defaults.
    pub fn load(root: &Path) -> Result<Self> {
        Self::load_from(&paths::config_path(root))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let Some(data) = crate::io::read_optional(path)? else {
            return Ok(Self::default());
        };
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&data)
            .map_err(|e| SequencerError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            strict_timeline: self.strict_timeline,
        }
    }

    /// Falls back to 60 s when the configured value is unusable.
    pub fn default_timeout(&self) -> Duration {
        let secs = self.default_timeout_sec;
        if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            DEFAULT_STEP_TIMEOUT
        }
    }

    pub fn history_path(&self, root: &Path) -> PathBuf {
        match &self.history.path {
            Some(p) => root.join(p),
            None => paths::history_path(root),
        }
    }

    pub fn sequence_dir(&self, root: &Path) -> PathBuf {
        match &self.sequence_dir {
            Some(p) => root.join(p),
            None => root.to_path_buf(),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let max_poll = MAX_POLL_INTERVAL.as_millis() as u64;

        if self.poll_interval_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "poll_interval_ms must be greater than 0".to_string(),
            });
        } else if self.poll_interval_ms > max_poll {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "poll_interval_ms={} exceeds {max_poll}; {max_poll} will be used",
                    self.poll_interval_ms
                ),
            });
        }

        if self.progress_interval_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "progress_interval_ms must be greater than 0".to_string(),
            });
        }

        if !(self.default_timeout_sec.is_finite() && self.default_timeout_sec > 0.0) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "default_timeout_sec={} must be a positive number",
                    self.default_timeout_sec
                ),
            });
        }

        if self.history.max_entries == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "history.max_entries=0 disables run history".to_string(),
            });
        }

        warnings
    }
}
