use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::error::ErrorKind;
use crate::executor::StepOutcome;
use crate::types::{serialize_secs, serialize_secs_opt, RunOutcome, Section};

/// Capacity of the event channel. Slow subscribers lag; the runner never
/// blocks on them.
const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Warning,
    Error,
}

/// Everything the runner tells the outside world.
///
/// `index` and `total` count enabled steps across all three sections, so a
/// presentation layer can draw a single progress bar.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    SectionChanged {
        section: Section,
    },
    StepStarted {
        section: Section,
        name: String,
        index: usize,
        total: usize,
    },
    StepFinished {
        section: Section,
        name: String,
        index: usize,
        total: usize,
        outcome: StepOutcome,
    },
    ProgressTick {
        #[serde(rename = "elapsed_sec", serialize_with = "serialize_secs")]
        elapsed: Duration,
        #[serde(rename = "time_to_finish_sec", serialize_with = "serialize_secs_opt")]
        time_to_finish: Option<Duration>,
    },
    Status {
        level: StatusLevel,
        section: Option<Section>,
        step: Option<String>,
        kind: Option<ErrorKind>,
        message: String,
    },
    RunFinished {
        outcome: RunOutcome,
    },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Fire and forget. No subscribers is not an error.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn warning(
        &self,
        section: Option<Section>,
        step: Option<&str>,
        kind: Option<ErrorKind>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        warn!(section = ?section, step = ?step, "{message}");
        self.status(StatusLevel::Warning, section, step, kind, message);
    }

    pub fn error(
        &self,
        section: Option<Section>,
        step: Option<&str>,
        kind: Option<ErrorKind>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        error!(section = ?section, step = ?step, "{message}");
        self.status(StatusLevel::Error, section, step, kind, message);
    }

    fn status(
        &self,
        level: StatusLevel,
        section: Option<Section>,
        step: Option<&str>,
        kind: Option<ErrorKind>,
        message: String,
    ) {
        self.publish(RunEvent::Status {
            level,
            section,
            step: step.map(str::to_string),
            kind,
            message,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(RunEvent::SectionChanged {
            section: Section::Setup,
        });
    }

    #[tokio::test]
    async fn subscribers_receive_status_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.error(
            Some(Section::During),
            Some("b"),
            Some(ErrorKind::StepTimeout),
            "timeout",
        );
        match rx.recv().await.unwrap() {
            RunEvent::Status {
                level,
                section,
                step,
                kind,
                message,
            } => {
                assert_eq!(level, StatusLevel::Error);
                assert_eq!(section, Some(Section::During));
                assert_eq!(step.as_deref(), Some("b"));
                assert_eq!(kind, Some(ErrorKind::StepTimeout));
                assert_eq!(message, "timeout");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn events_serialize_internally_tagged() {
        let tick = RunEvent::ProgressTick {
            elapsed: Duration::from_millis(2500),
            time_to_finish: None,
        };
        let json = serde_json::to_value(&tick).unwrap();
        assert_eq!(json["type"], "progress_tick");
        assert_eq!(json["elapsed_sec"], 2.5);
        assert!(json["time_to_finish_sec"].is_null());

        let started = RunEvent::StepStarted {
            section: Section::Post,
            name: "d".into(),
            index: 4,
            total: 4,
        };
        let json = serde_json::to_value(&started).unwrap();
        assert_eq!(json["type"], "step_started");
        assert_eq!(json["section"], "post");
        assert_eq!(json["index"], 4);
    }
}
