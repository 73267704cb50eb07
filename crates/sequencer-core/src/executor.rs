//! Step executor: one dispatch, one bounded outcome.
//!
//! Per-step failures never escape as errors. Resolution problems, unreadable
//! configuration, unit faults, panics and timeouts all come back as a failed
//! [`StepOutcome`].
//!
//! For `boolean_return` and `any_return` the unit runs on a worker task and
//! the executor waits at most `timeout_sec`. A unit that misses the deadline is
//! abandoned, not killed: its task keeps running and its late result is only
//! logged.

use futures::future::BoxFuture;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::step::Step;
use crate::types::{serialize_secs, WaitType};
use crate::unit::{Invocation, StepUnit, UnitFault, UnitRegistry, UnitResult};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// StepFailure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StepFailure {
    /// The unit did not complete within `timeout_sec`.
    Timeout,
    /// The unit completed but its result counts as a failure.
    Reported(String),
    /// The unit raised, panicked, or could not be started.
    Fault(String),
}

impl StepFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepFailure::Timeout => ErrorKind::StepTimeout,
            StepFailure::Reported(_) => ErrorKind::StepReportedFailure,
            StepFailure::Fault(_) => ErrorKind::StepFault,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            StepFailure::Timeout => "timeout",
            StepFailure::Reported(r) | StepFailure::Fault(r) => r,
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl Serialize for StepFailure {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Repr<'a> {
            kind: ErrorKind,
            reason: &'a str,
        }
        Repr {
            kind: self.kind(),
            reason: self.reason(),
        }
        .serialize(s)
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub success: bool,
    pub error: Option<StepFailure>,
    #[serde(rename = "elapsed_sec", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl StepOutcome {
    pub fn succeeded(elapsed: Duration) -> Self {
        Self {
            success: true,
            error: None,
            elapsed,
        }
    }

    pub fn failed(failure: StepFailure, elapsed: Duration) -> Self {
        Self {
            success: false,
            error: Some(failure),
            elapsed,
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<UnitRegistry>,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(registry: UnitRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            default_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Timeout used by waiting kinds whose `timeout_sec` is not positive.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn execute(&self, step: &Step) -> StepOutcome {
        let start = Instant::now();
        let kind = step.wait_condition.kind;

        let unit = match self.registry.resolve(&step.location) {
            Ok(unit) => unit,
            Err(fault) => return StepOutcome::failed(StepFailure::Fault(fault.0), start.elapsed()),
        };
        let config = match load_config_payload(&step.config_location).await {
            Ok(config) => config,
            Err(fault) => return StepOutcome::failed(StepFailure::Fault(fault.0), start.elapsed()),
        };

        match kind {
            WaitType::BooleanReturn | WaitType::AnyReturn => {
                let limit = step.wait_condition.timeout().unwrap_or(self.default_timeout);
                let deadline = deadline_after(start, limit);
                let inv = invocation(step, config, Some(deadline));
                self.await_unit(step, kind, unit.as_ref(), inv, deadline, start)
                    .await
            }
            WaitType::HardWait => {
                spawn_detached(step, unit.as_ref(), invocation(step, config, None));
                if let Some(hold) = step.wait_condition.timeout() {
                    tokio::time::sleep_until(deadline_after(start, hold)).await;
                }
                StepOutcome::succeeded(start.elapsed())
            }
            WaitType::NoWait => {
                spawn_detached(step, unit.as_ref(), invocation(step, config, None));
                StepOutcome::succeeded(start.elapsed())
            }
        }
    }

    async fn await_unit(
        &self,
        step: &Step,
        kind: WaitType,
        unit: &dyn StepUnit,
        inv: Invocation,
        deadline: Instant,
        start: Instant,
    ) -> StepOutcome {
        let future = match start_unit(unit, inv) {
            Ok(f) => f,
            Err(fault) => return StepOutcome::failed(StepFailure::Fault(fault.0), start.elapsed()),
        };
        let mut worker = tokio::spawn(future);

        match tokio::time::timeout_at(deadline, &mut worker).await {
            Err(_) => {
                let name = step.name.clone();
                debug!(step = %name, "deadline passed; abandoning unit");
                tokio::spawn(async move {
                    match worker.await {
                        Ok(Ok(value)) => debug!(step = %name, %value, "abandoned unit finished"),
                        Ok(Err(fault)) => debug!(step = %name, %fault, "abandoned unit faulted"),
                        Err(e) => debug!(step = %name, error = %e, "abandoned unit panicked"),
                    }
                });
                StepOutcome::failed(StepFailure::Timeout, start.elapsed())
            }
            Ok(Err(join)) => StepOutcome::failed(
                StepFailure::Fault(format!("step panicked: {join}")),
                start.elapsed(),
            ),
            Ok(Ok(Err(fault))) => StepOutcome::failed(StepFailure::Fault(fault.0), start.elapsed()),
            Ok(Ok(Ok(value))) => evaluate(kind, &value, start.elapsed()),
        }
    }
}

/// `start + limit`, saturating roughly thirty years out instead of overflowing.
fn deadline_after(start: Instant, limit: Duration) -> Instant {
    start
        .checked_add(limit)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn invocation(step: &Step, config: Value, deadline: Option<Instant>) -> Invocation {
    Invocation {
        step: step.name.clone(),
        section: step.section,
        location: step.location.clone(),
        config,
        argument: step.argument.clone(),
        deadline,
    }
}

/// Call `unit.run`, turning a panic in the synchronous part into a fault.
fn start_unit(
    unit: &dyn StepUnit,
    inv: Invocation,
) -> std::result::Result<BoxFuture<'static, UnitResult>, UnitFault> {
    catch_unwind(AssertUnwindSafe(|| unit.run(inv)))
        .map_err(|_| UnitFault::new("step panicked while starting"))
}

/// Start a unit nobody waits on. Faults are logged, never attributed.
fn spawn_detached(step: &Step, unit: &dyn StepUnit, inv: Invocation) {
    let name = step.name.clone();
    let future = match start_unit(unit, inv) {
        Ok(f) => f,
        Err(fault) => {
            warn!(step = %name, %fault, "detached unit failed to start");
            return;
        }
    };
    let handle = tokio::spawn(future);
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(_)) => debug!(step = %name, "detached unit finished"),
            Ok(Err(fault)) => warn!(step = %name, %fault, "detached unit faulted"),
            Err(e) => warn!(step = %name, error = %e, "detached unit panicked"),
        }
    });
}

fn evaluate(kind: WaitType, value: &Value, elapsed: Duration) -> StepOutcome {
    match (kind, value) {
        (WaitType::BooleanReturn, Value::Bool(true)) => StepOutcome::succeeded(elapsed),
        (WaitType::BooleanReturn, Value::Bool(false)) => StepOutcome::failed(
            StepFailure::Reported("step reported failure".into()),
            elapsed,
        ),
        (WaitType::BooleanReturn, other) => StepOutcome::failed(
            StepFailure::Reported(format!("step returned a non-boolean value: {other}")),
            elapsed,
        ),
        _ => StepOutcome::succeeded(elapsed),
    }
}

/// Read a step's configuration payload. Blank locations yield `null`.
pub async fn load_config_payload(location: &str) -> std::result::Result<Value, UnitFault> {
    let location = location.trim();
    if location.is_empty() {
        return Ok(Value::Null);
    }
    let data = tokio::fs::read_to_string(location)
        .await
        .map_err(|e| UnitFault(format!("cannot read config {location}: {e}")))?;
    if crate::paths::is_yaml(std::path::Path::new(location)) {
        serde_yaml::from_str(&data)
            .map_err(|e| UnitFault(format!("invalid config {location}: {e}")))
    } else {
        serde_json::from_str(&data)
            .map_err(|e| UnitFault(format!("invalid config {location}: {e}")))
    }
}
