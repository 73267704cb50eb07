//! Timeline construction for the During section.
//!
//! A During step's `argument` may carry a time specification:
//!
//! - `T+2s`, `T+500ms`, `T+1.5m`, `T+3` (seconds): offset after the master
//!   trigger.
//! - `@14:30:05`, `@14:30`: wall-clock time (local) on the trigger's date.
//! - `@2026-10-18T14:30:05Z`: absolute RFC 3339 instant.
//!
//! Anything else is not a time specification and the step dispatches as soon
//! as its predecessor resolves. Absolute targets are only resolvable once the
//! trigger is captured, so [`Timeline::build`] produces an unbound plan and
//! [`Timeline::bind`] turns it into offsets.
//!
//! Entries always keep definition order. A schedule that goes backwards is
//! reported as a [`TimelineWarning`], never reordered.

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, SequencerError};
use crate::step::Step;

// ---------------------------------------------------------------------------
// ScheduleSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    /// No time specification: dispatch right after the predecessor.
    Immediate,
    /// Fixed offset from the master trigger.
    After(Duration),
    /// Absolute instant.
    At(DateTime<Utc>),
    /// Local wall-clock time on the trigger's date.
    AtClock(NaiveTime),
}

impl ScheduleSpec {
    /// Parse a step argument.
    ///
    /// Returns `Ok(Immediate)` for arguments that are not time specifications
    /// and `Err(reason)` for ones that look like a time specification but do
    /// not parse.
    pub fn parse(argument: Option<&str>) -> std::result::Result<ScheduleSpec, String> {
        let Some(raw) = argument.map(str::trim).filter(|a| !a.is_empty()) else {
            return Ok(ScheduleSpec::Immediate);
        };

        if let Some(rest) = strip_prefix_ignore_case(raw, "T+") {
            return parse_relative(rest).map(ScheduleSpec::After);
        }
        if let Some(rest) = raw.strip_prefix('@') {
            return parse_absolute(rest.trim());
        }
        Ok(ScheduleSpec::Immediate)
    }

    pub fn is_timed(&self) -> bool {
        !matches!(self, ScheduleSpec::Immediate)
    }

    /// Signed offset from `trigger`, or `None` for `Immediate` and for clock
    /// times that do not exist on the trigger's date.
    pub fn resolve(&self, trigger: DateTime<Utc>) -> Option<chrono::Duration> {
        match self {
            ScheduleSpec::Immediate => None,
            ScheduleSpec::After(d) => chrono::Duration::from_std(*d).ok(),
            ScheduleSpec::At(at) => Some(*at - trigger),
            ScheduleSpec::AtClock(time) => {
                let date = trigger.with_timezone(&Local).date_naive();
                let target = Local.from_local_datetime(&date.and_time(*time)).earliest()?;
                Some(target.with_timezone(&Utc) - trigger)
            }
        }
    }

    fn class(&self) -> Option<SpecClass> {
        match self {
            ScheduleSpec::Immediate => None,
            ScheduleSpec::After(_) => Some(SpecClass::Relative),
            ScheduleSpec::At(_) => Some(SpecClass::Instant),
            ScheduleSpec::AtClock(_) => Some(SpecClass::Clock),
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Immediate => f.write_str("immediate"),
            ScheduleSpec::After(d) => write!(f, "T+{:.3}s", d.as_secs_f64()),
            ScheduleSpec::At(at) => write!(f, "@{}", at.to_rfc3339()),
            ScheduleSpec::AtClock(t) => write!(f, "@{}", t.format("%H:%M:%S%.3f")),
        }
    }
}

/// Specs that can be ordered against each other without knowing the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecClass {
    Relative,
    Instant,
    Clock,
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn parse_relative(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid offset '{raw}'"))?;
    let secs = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "s" | "sec" => value,
        "ms" => value / 1000.0,
        "m" | "min" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown offset unit '{other}'")),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("offset out of range '{raw}'"));
    }
    // Must also fit a chrono delta, or it could not be resolved against the trigger.
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| chrono::Duration::from_std(*d).is_ok())
        .ok_or_else(|| format!("offset out of range '{raw}'"))
}

fn parse_absolute(raw: &str) -> std::result::Result<ScheduleSpec, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ScheduleSpec::At(at.with_timezone(&Utc)));
    }
    for fmt in ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(raw, fmt) {
            return Ok(ScheduleSpec::AtClock(t));
        }
    }
    Err(format!("invalid time '{raw}'"))
}

// ---------------------------------------------------------------------------
// TimelineWarning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineWarning {
    pub step: String,
    pub reason: String,
}

impl TimelineWarning {
    pub fn into_error(self) -> SequencerError {
        SequencerError::MalformedTimeline {
            step: self.step,
            reason: self.reason,
        }
    }
}

impl fmt::Display for TimelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.reason)
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub step: Step,
    pub schedule: ScheduleSpec,
}

/// The unbound During plan, in definition order.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    /// Build the plan from the During steps. Disabled steps are skipped.
    ///
    /// An argument that looks like a time specification but does not parse
    /// is an error. Ordering problems detectable without the trigger are
    /// returned as warnings.
    pub fn build(steps: &[Step]) -> Result<(Timeline, Vec<TimelineWarning>)> {
        let mut entries = Vec::new();
        for step in steps.iter().filter(|s| s.enabled) {
            let schedule = ScheduleSpec::parse(step.argument.as_deref()).map_err(|reason| {
                SequencerError::MalformedTimeline {
                    step: step.name.clone(),
                    reason,
                }
            })?;
            entries.push(TimelineEntry {
                step: step.clone(),
                schedule,
            });
        }

        let timeline = Timeline { entries };
        let warnings = timeline.static_order_warnings();
        Ok((timeline, warnings))
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compare each timed entry with the last earlier entry of the same
    /// kind; those comparisons hold for any trigger.
    fn static_order_warnings(&self) -> Vec<TimelineWarning> {
        let mut warnings = Vec::new();
        let mut last: Vec<(SpecClass, &TimelineEntry)> = Vec::new();

        for entry in &self.entries {
            let Some(class) = entry.schedule.class() else {
                continue;
            };
            if let Some((_, prev)) = last.iter().find(|(c, _)| *c == class) {
                if schedule_precedes(&entry.schedule, &prev.schedule) {
                    warnings.push(order_warning(entry, prev));
                }
            }
            last.retain(|(c, _)| *c != class);
            last.push((class, entry));
        }
        warnings
    }

    /// Resolve every entry against the captured trigger.
    ///
    /// Negative offsets are clamped to zero. Warnings cover targets before
    /// the trigger, clock times missing on the trigger's date, and ordering
    /// problems between entries of different kinds (same-kind problems were
    /// already reported by [`Timeline::build`]).
    pub fn bind(&self, trigger: DateTime<Utc>) -> (BoundTimeline, Vec<TimelineWarning>) {
        let mut warnings = Vec::new();
        let mut entries = Vec::with_capacity(self.entries.len());
        let mut latest: Option<(chrono::Duration, &TimelineEntry)> = None;

        for entry in &self.entries {
            let offset = match entry.schedule.resolve(trigger) {
                None if entry.schedule.is_timed() => {
                    warnings.push(TimelineWarning {
                        step: entry.step.name.clone(),
                        reason: format!("{} does not exist on the trigger date", entry.schedule),
                    });
                    Some(Duration::ZERO)
                }
                None => None,
                Some(signed) => {
                    if signed < chrono::Duration::zero() {
                        warnings.push(TimelineWarning {
                            step: entry.step.name.clone(),
                            reason: format!(
                                "{} is {:.3}s before the trigger",
                                entry.schedule,
                                -signed.num_milliseconds() as f64 / 1000.0
                            ),
                        });
                    }
                    if let Some((prev_offset, prev)) = latest {
                        if signed < prev_offset && entry.schedule.class() != prev.schedule.class()
                        {
                            warnings.push(order_warning(entry, prev));
                        }
                    }
                    if latest.map_or(true, |(prev_offset, _)| signed >= prev_offset) {
                        latest = Some((signed, entry));
                    }
                    Some(signed.to_std().unwrap_or(Duration::ZERO))
                }
            };
            entries.push(BoundEntry {
                step: entry.step.clone(),
                offset,
            });
        }

        (BoundTimeline { trigger, entries }, warnings)
    }
}

fn schedule_precedes(a: &ScheduleSpec, b: &ScheduleSpec) -> bool {
    match (a, b) {
        (ScheduleSpec::After(x), ScheduleSpec::After(y)) => x < y,
        (ScheduleSpec::At(x), ScheduleSpec::At(y)) => x < y,
        (ScheduleSpec::AtClock(x), ScheduleSpec::AtClock(y)) => x < y,
        _ => false,
    }
}

fn order_warning(entry: &TimelineEntry, prev: &TimelineEntry) -> TimelineWarning {
    TimelineWarning {
        step: entry.step.name.clone(),
        reason: format!(
            "scheduled at {}, earlier than '{}' at {}; keeping definition order",
            entry.schedule, prev.step.name, prev.schedule
        ),
    }
}

// ---------------------------------------------------------------------------
// BoundTimeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BoundEntry {
    pub step: Step,
    /// Offset from the trigger; `None` dispatches right after the predecessor.
    pub offset: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BoundTimeline {
    trigger: DateTime<Utc>,
    entries: Vec<BoundEntry>,
}

impl BoundTimeline {
    pub fn trigger(&self) -> DateTime<Utc> {
        self.trigger
    }

    pub fn entries(&self) -> &[BoundEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset of the last entry when it is bound; drives time-to-finish.
    pub fn final_offset(&self) -> Option<Duration> {
        self.entries.last().and_then(|e| e.offset)
    }
}
