use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("no sequence loaded")]
    NoSequenceLoaded,

    #[error("a run is already in progress")]
    RunInProgress,

    #[error("malformed timeline at step '{step}': {reason}")]
    MalformedTimeline { step: String, reason: String },

    #[error("time reference unavailable: {0}")]
    TimeReferenceUnavailable(String),

    #[error("invalid sequence file {path}: {reason}")]
    InvalidSequence { path: String, reason: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("run task aborted: {0}")]
    RunAborted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SequencerError {
    /// Classification used on status events. Only the structural kinds map;
    /// I/O and parse errors have no run-level kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SequencerError::NoSequenceLoaded => Some(ErrorKind::NoSequenceLoaded),
            SequencerError::RunInProgress => Some(ErrorKind::RunInProgress),
            SequencerError::MalformedTimeline { .. } => Some(ErrorKind::MalformedTimeline),
            SequencerError::TimeReferenceUnavailable(_) => {
                Some(ErrorKind::TimeReferenceUnavailable)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SequencerError>;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Every failure a run can report, step-level and structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StepTimeout,
    StepReportedFailure,
    StepFault,
    MalformedTimeline,
    NoSequenceLoaded,
    RunInProgress,
    TimeReferenceUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StepTimeout => "step_timeout",
            ErrorKind::StepReportedFailure => "step_reported_failure",
            ErrorKind::StepFault => "step_fault",
            ErrorKind::MalformedTimeline => "malformed_timeline",
            ErrorKind::NoSequenceLoaded => "no_sequence_loaded",
            ErrorKind::RunInProgress => "run_in_progress",
            ErrorKind::TimeReferenceUnavailable => "time_reference_unavailable",
        }
    }

    pub fn is_step_level(self) -> bool {
        matches!(
            self,
            ErrorKind::StepTimeout | ErrorKind::StepReportedFailure | ErrorKind::StepFault
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
