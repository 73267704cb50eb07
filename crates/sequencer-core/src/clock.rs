//! Time reference adapter.
//!
//! The scheduler only ever calls [`TimeReference::now`]. Production rigs back
//! it with the hardware synchronization card; [`MonotonicClock`] is the
//! software stand-in used by the CLI and tests. It is built on
//! `tokio::time::Instant`, so paused-time tests advance it deterministically.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::SequencerError;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TimeReferenceError(pub String);

impl From<TimeReferenceError> for SequencerError {
    fn from(e: TimeReferenceError) -> Self {
        SequencerError::TimeReferenceUnavailable(e.0)
    }
}

/// A monotonic absolute timestamp source with sub-second precision.
pub trait TimeReference: Send + Sync {
    fn now(&self) -> Result<DateTime<Utc>, TimeReferenceError>;
}

pub type SharedClock = Arc<dyn TimeReference>;

// ---------------------------------------------------------------------------
// MonotonicClock
// ---------------------------------------------------------------------------

/// Wall-clock anchored, monotonic clock.
///
/// Reads the system wall clock once at construction and advances by the
/// monotonic elapsed time from then on, so readings never go backwards even
/// if the system clock is stepped.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    wall_anchor: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(wall_anchor: DateTime<Utc>) -> Self {
        Self {
            wall_anchor,
            started: tokio::time::Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeReference for MonotonicClock {
    fn now(&self) -> Result<DateTime<Utc>, TimeReferenceError> {
        let delta = chrono::Duration::from_std(self.started.elapsed())
            .map_err(|e| TimeReferenceError(format!("clock overflow: {e}")))?;
        Ok(self.wall_anchor + delta)
    }
}

/// `later - earlier`, saturating at zero.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
