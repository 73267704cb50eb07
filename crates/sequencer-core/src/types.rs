use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Setup,
    During,
    Post,
}

impl Section {
    pub fn all() -> &'static [Section] {
        &[Section::Setup, Section::During, Section::Post]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Section::Setup => "setup",
            Section::During => "during",
            Section::Post => "post",
        }
    }

    /// Case-insensitive match including the legacy `test`/`cleanup` names.
    pub fn parse_loose(s: &str) -> Option<Section> {
        match s.trim().to_ascii_lowercase().as_str() {
            "setup" => Some(Section::Setup),
            "during" | "test" => Some(Section::During),
            "post" | "cleanup" => Some(Section::Post),
            _ => None,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WaitType / WaitCondition
// ---------------------------------------------------------------------------

/// How the executor decides that a step is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitType {
    /// The unit must return a boolean; `false` is a failure.
    BooleanReturn,
    /// Any returned value is a success.
    AnyReturn,
    /// Start the unit, hold for `timeout_sec`, then succeed.
    HardWait,
    /// Start the unit and succeed immediately.
    NoWait,
}

impl WaitType {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitType::BooleanReturn => "boolean_return",
            WaitType::AnyReturn => "any_return",
            WaitType::HardWait => "hard_wait",
            WaitType::NoWait => "no_wait",
        }
    }

    pub fn parse_loose(s: &str) -> Option<WaitType> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "boolean_return" | "bool" | "boolean" => Some(WaitType::BooleanReturn),
            "any_return" | "any" => Some(WaitType::AnyReturn),
            "hard_wait" | "hold" => Some(WaitType::HardWait),
            "no_wait" | "none" => Some(WaitType::NoWait),
            _ => None,
        }
    }

    /// True for the kinds where the executor observes the unit's completion.
    pub fn observes_completion(self) -> bool {
        matches!(self, WaitType::BooleanReturn | WaitType::AnyReturn)
    }
}

impl fmt::Display for WaitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitCondition {
    #[serde(rename = "type")]
    pub kind: WaitType,
    pub timeout_sec: f64,
}

impl WaitCondition {
    pub fn new(kind: WaitType, timeout_sec: f64) -> Self {
        Self { kind, timeout_sec }
    }

    /// `timeout_sec` as a duration; `None` when zero, negative or not finite.
    /// Values past what a `Duration` holds saturate at `Duration::MAX`.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_sec.is_finite() && self.timeout_sec > 0.0 {
            Some(Duration::try_from_secs_f64(self.timeout_sec).unwrap_or(Duration::MAX))
        } else {
            None
        }
    }
}

impl Default for WaitCondition {
    fn default() -> Self {
        Self {
            kind: WaitType::BooleanReturn,
            timeout_sec: 60.0,
        }
    }
}

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunPhase
// ---------------------------------------------------------------------------

/// Top-level runner state.
///
/// Transitions: `Idle → RunningSetup → RunningDuring → RunningPost →
/// Completed | Failed | Cancelled`. A failing Setup skips straight to
/// `RunningPost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    RunningSetup,
    RunningDuring,
    RunningPost,
    Completed,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn running(section: Section) -> RunPhase {
        match section {
            Section::Setup => RunPhase::RunningSetup,
            Section::During => RunPhase::RunningDuring,
            Section::Post => RunPhase::RunningPost,
        }
    }

    pub fn terminal(outcome: RunOutcome) -> RunPhase {
        match outcome {
            RunOutcome::Completed => RunPhase::Completed,
            RunOutcome::Failed => RunPhase::Failed,
            RunOutcome::Cancelled => RunPhase::Cancelled,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunPhase::RunningSetup | RunPhase::RunningDuring | RunPhase::RunningPost
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::RunningSetup => "running_setup",
            RunPhase::RunningDuring => "running_during",
            RunPhase::RunningPost => "running_post",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
            RunPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as fractional seconds)
// ---------------------------------------------------------------------------

pub(crate) fn serialize_secs<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_f64(d.as_secs_f64())
}

pub(crate) fn serialize_secs_opt<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match d {
        Some(dur) => s.serialize_some(&dur.as_secs_f64()),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_parse_is_case_insensitive_with_aliases() {
        assert_eq!(Section::parse_loose("SETUP"), Some(Section::Setup));
        assert_eq!(Section::parse_loose("Test"), Some(Section::During));
        assert_eq!(Section::parse_loose(" cleanup "), Some(Section::Post));
        assert_eq!(Section::parse_loose("teardown"), None);
    }

    #[test]
    fn wait_type_parse_normalizes_separators() {
        assert_eq!(
            WaitType::parse_loose("Boolean-Return"),
            Some(WaitType::BooleanReturn)
        );
        assert_eq!(WaitType::parse_loose("hard wait"), Some(WaitType::HardWait));
        assert_eq!(WaitType::parse_loose("eventually"), None);
    }

    #[test]
    fn wait_condition_timeout_rejects_non_positive() {
        assert_eq!(
            WaitCondition::new(WaitType::AnyReturn, 1.5).timeout(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(WaitCondition::new(WaitType::AnyReturn, 0.0).timeout(), None);
        assert_eq!(WaitCondition::new(WaitType::AnyReturn, -2.0).timeout(), None);
        assert_eq!(
            WaitCondition::new(WaitType::AnyReturn, f64::NAN).timeout(),
            None
        );
        assert_eq!(
            WaitCondition::new(WaitType::AnyReturn, 1e20).timeout(),
            Some(Duration::MAX)
        );
    }

    #[test]
    fn wait_condition_serializes_type_field() {
        let wc = WaitCondition::new(WaitType::NoWait, 3.0);
        let json = serde_json::to_value(wc).unwrap();
        assert_eq!(json["type"], "no_wait");
        assert_eq!(json["timeout_sec"], 3.0);
    }

    #[test]
    fn phase_activity() {
        assert!(RunPhase::running(Section::During).is_active());
        assert!(!RunPhase::terminal(RunOutcome::Cancelled).is_active());
        assert!(!RunPhase::Idle.is_active());
    }
}
