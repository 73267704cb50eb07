//! Step units: the executable side of a step.
//!
//! A unit is anything implementing [`StepUnit`]. The executor never knows
//! what a unit does; it only hands over the resolved configuration payload,
//! the step argument and the deadline it is willing to wait until, and then
//! interprets the returned JSON value according to the step's wait
//! condition.
//!
//! Units are looked up by the step's `location` in a [`UnitRegistry`].
//! Locations that are not registered fall back to [`CommandUnit`] when the
//! registry allows it.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::command::CommandUnit;
use crate::types::Section;

pub const BUILTIN_PREFIX: &str = "builtin:";

/// An unhandled fault raised by a unit.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct UnitFault(pub String);

impl UnitFault {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type UnitResult = std::result::Result<Value, UnitFault>;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything a unit receives for one dispatch.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub step: String,
    pub section: Section,
    pub location: String,
    /// Parsed configuration payload, `Null` when the step has none.
    pub config: Value,
    pub argument: Option<String>,
    /// When the executor stops waiting. `None` for `no_wait`/`hard_wait`
    /// dispatches, where nobody waits on the unit at all.
    pub deadline: Option<tokio::time::Instant>,
}

// ---------------------------------------------------------------------------
// StepUnit
// ---------------------------------------------------------------------------

pub trait StepUnit: Send + Sync {
    /// Start the unit. The returned future is driven on a worker task and may
    /// outlive the executor's interest in it.
    fn run(&self, invocation: Invocation) -> BoxFuture<'static, UnitResult>;
}

type BoxedFn = dyn Fn(Invocation) -> BoxFuture<'static, UnitResult> + Send + Sync;

/// A unit backed by an async closure.
#[derive(Clone)]
pub struct FnUnit {
    f: Arc<BoxedFn>,
}

impl FnUnit {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitResult> + Send + 'static,
    {
        Self {
            f: Arc::new(move |inv| f(inv).boxed()),
        }
    }
}

impl StepUnit for FnUnit {
    fn run(&self, invocation: Invocation) -> BoxFuture<'static, UnitResult> {
        (self.f)(invocation)
    }
}

impl fmt::Debug for FnUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnUnit")
    }
}

// ---------------------------------------------------------------------------
// UnitRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct UnitRegistry {
    units: HashMap<String, Arc<dyn StepUnit>>,
    command_fallback: bool,
}

impl UnitRegistry {
    /// Empty registry without the command fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `builtin:` units and the command fallback enabled.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            units: HashMap::new(),
            command_fallback: true,
        };
        registry.register_fn("builtin:pass", |_| async { Ok(Value::Bool(true)) });
        registry.register_fn("builtin:fail", |_| async { Ok(Value::Bool(false)) });
        registry.register_fn("builtin:sleep", builtin_sleep);
        registry.register_fn("builtin:echo", builtin_echo);
        registry
    }

    pub fn set_command_fallback(&mut self, enabled: bool) {
        self.command_fallback = enabled;
    }

    pub fn register(&mut self, location: impl Into<String>, unit: Arc<dyn StepUnit>) {
        self.units.insert(location.into(), unit);
    }

    pub fn register_fn<F, Fut>(&mut self, location: impl Into<String>, f: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitResult> + Send + 'static,
    {
        self.register(location, Arc::new(FnUnit::new(f)));
    }

    pub fn contains(&self, location: &str) -> bool {
        self.units.contains_key(location)
    }

    /// Look up the unit for `location`.
    ///
    /// Registered names win. Unknown `builtin:` names never fall back to a
    /// command.
    pub fn resolve(&self, location: &str) -> std::result::Result<Arc<dyn StepUnit>, UnitFault> {
        if let Some(unit) = self.units.get(location) {
            return Ok(Arc::clone(unit));
        }
        if location.trim().is_empty() {
            return Err(UnitFault::new("step has no location"));
        }
        if location.starts_with(BUILTIN_PREFIX) || !self.command_fallback {
            return Err(UnitFault(format!("no unit registered for '{location}'")));
        }
        let unit = CommandUnit::resolve(location)?;
        Ok(Arc::new(unit))
    }
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.units.keys().collect();
        keys.sort();
        f.debug_struct("UnitRegistry")
            .field("units", &keys)
            .field("command_fallback", &self.command_fallback)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in units
// ---------------------------------------------------------------------------

/// Sleeps `config.seconds`, or the argument when it is a plain number.
async fn builtin_sleep(inv: Invocation) -> UnitResult {
    let secs = inv
        .config
        .get("seconds")
        .and_then(Value::as_f64)
        .or_else(|| inv.argument.as_deref().and_then(|a| a.trim().parse().ok()))
        .filter(|s: &f64| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| UnitFault::new("builtin:sleep needs a number of seconds"))?;
    tokio::time::sleep(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)).await;
    Ok(Value::Bool(true))
}

async fn builtin_echo(inv: Invocation) -> UnitResult {
    let text = inv.argument.unwrap_or_default();
    tracing::info!(step = %inv.step, "{text}");
    Ok(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(argument: Option<&str>, config: Value) -> Invocation {
        Invocation {
            step: "s".into(),
            section: Section::Setup,
            location: "test".into(),
            config,
            argument: argument.map(str::to_string),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn registered_unit_resolves() {
        let mut registry = UnitRegistry::new();
        registry.register_fn("readback", |inv| async move {
            Ok(Value::String(inv.argument.unwrap_or_default()))
        });
        let unit = registry.resolve("readback").unwrap();
        let out = unit.run(invocation(Some("hi"), Value::Null)).await.unwrap();
        assert_eq!(out, Value::String("hi".into()));
    }

    #[test]
    fn unknown_location_without_fallback_is_fault() {
        let registry = UnitRegistry::new();
        let err = registry.resolve("/opt/rig/step.sh").err().unwrap();
        assert!(err.0.contains("no unit registered"));
    }

    #[test]
    fn unknown_builtin_never_falls_back() {
        let registry = UnitRegistry::with_builtins();
        assert!(registry.resolve("builtin:nope").is_err());
        assert!(registry.resolve("builtin:pass").is_ok());
    }

    #[test]
    fn blank_location_is_fault() {
        let registry = UnitRegistry::with_builtins();
        assert!(registry.resolve("  ").is_err());
    }

    #[tokio::test]
    async fn builtin_pass_and_fail() {
        let registry = UnitRegistry::with_builtins();
        let pass = registry.resolve("builtin:pass").unwrap();
        let fail = registry.resolve("builtin:fail").unwrap();
        assert_eq!(
            pass.run(invocation(None, Value::Null)).await,
            Ok(Value::Bool(true))
        );
        assert_eq!(
            fail.run(invocation(None, Value::Null)).await,
            Ok(Value::Bool(false))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn builtin_sleep_prefers_config_seconds() {
        let start = tokio::time::Instant::now();
        let out = builtin_sleep(invocation(Some("9"), serde_json::json!({"seconds": 2}))).await;
        assert_eq!(out, Ok(Value::Bool(true)));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn builtin_sleep_rejects_time_spec_argument() {
        let out = builtin_sleep(invocation(Some("T+2s"), Value::Null)).await;
        assert!(out.is_err());
    }

    #[test]
    fn registry_debug_lists_keys() {
        let registry = UnitRegistry::with_builtins();
        let dbg = format!("{registry:?}");
        assert!(dbg.contains("builtin:echo"));
        assert!(dbg.contains("command_fallback: true"));
    }
}
