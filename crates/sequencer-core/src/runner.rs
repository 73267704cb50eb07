//! Sequence runner: the top-level Setup → During → Post state machine.
//!
//! One run at a time per runner. [`SequenceRunner::start`] validates the
//! sequence synchronously (so structural problems surface before any step
//! runs), then spawns the run on the Tokio runtime and hands back a
//! [`RunHandle`].
//!
//! Section policy:
//! - Setup runs in order and stops at the first failure or at cancellation.
//! - During runs only when Setup passed, through the [`Scheduler`].
//! - Post always runs every enabled step, whatever happened before.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{MonotonicClock, SharedClock};
use crate::error::{ErrorKind, Result, SequencerError};
use crate::event::{EventBus, RunEvent};
use crate::executor::StepExecutor;
use crate::scheduler::{DuringExit, Scheduler, StepCounter};
use crate::step::Sequence;
use crate::timeline::Timeline;
use crate::types::{RunOutcome, RunPhase, Section};

// ---------------------------------------------------------------------------
// RunnerOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Longest single sleep while waiting for a timed step. Capped at 100 ms.
    pub poll_interval: Duration,
    /// Spacing of progress ticks while During runs.
    pub progress_interval: Duration,
    /// Turn timeline ordering warnings into structural failures.
    pub strict_timeline: bool,
}

pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            poll_interval: MAX_POLL_INTERVAL,
            progress_interval: Duration::from_millis(250),
            strict_timeline: false,
        }
    }
}

impl RunnerOptions {
    fn normalized(mut self) -> Self {
        if self.poll_interval.is_zero() || self.poll_interval > MAX_POLL_INTERVAL {
            self.poll_interval = MAX_POLL_INTERVAL;
        }
        if self.progress_interval.is_zero() {
            self.progress_interval = RunnerOptions::default().progress_interval;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// One failed step, or a structural failure attributed to a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub section: Section,
    pub step: String,
    pub kind: ErrorKind,
    pub reason: String,
}

impl RunFailure {
    pub fn new(
        section: Section,
        step: &str,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            section,
            step: step.to_string(),
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub sequence: Option<PathBuf>,
    pub outcome: RunOutcome,
    pub failures: Vec<RunFailure>,
    /// Master trigger; `None` when During never started.
    pub trigger: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What a history sink receives once per finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub sequence: Option<PathBuf>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl From<&RunReport> for RunRecord {
    fn from(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id,
            sequence: report.sequence.clone(),
            outcome: report.outcome,
            started_at: report.started_at,
            finished_at: report.finished_at,
        }
    }
}

/// Write-only destination for run history. The runner never reads back.
pub trait RunHistorySink: Send + Sync {
    fn record(&self, record: &RunRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

pub struct RunHandle {
    run_id: Uuid,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request early termination of this run. Idempotent, and a no-op once
    /// the run has finished.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| SequencerError::RunAborted(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// SequenceRunner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SequenceRunner {
    inner: Arc<Inner>,
}

struct Inner {
    executor: StepExecutor,
    clock: SharedClock,
    options: RunnerOptions,
    history: Option<Arc<dyn RunHistorySink>>,
    bus: EventBus,
    active: AtomicBool,
    /// Cancel flag of the active run. Each run gets a fresh one.
    cancel: Mutex<Arc<AtomicBool>>,
    phase: Mutex<RunPhase>,
}

pub struct RunnerBuilder {
    executor: StepExecutor,
    clock: Option<SharedClock>,
    options: RunnerOptions,
    history: Option<Arc<dyn RunHistorySink>>,
}

impl RunnerBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn history(mut self, sink: Arc<dyn RunHistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    pub fn build(self) -> SequenceRunner {
        SequenceRunner {
            inner: Arc::new(Inner {
                executor: self.executor,
                clock: self.clock.unwrap_or_else(MonotonicClock::shared),
                options: self.options.normalized(),
                history: self.history,
                bus: EventBus::new(),
                active: AtomicBool::new(false),
                cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
                phase: Mutex::new(RunPhase::Idle),
            }),
        }
    }
}

impl SequenceRunner {
    pub fn builder(executor: StepExecutor) -> RunnerBuilder {
        RunnerBuilder {
            executor,
            clock: None,
            options: RunnerOptions::default(),
            history: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.bus.subscribe()
    }

    pub fn phase(&self) -> RunPhase {
        *self.inner.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Request early termination of the active run. Idempotent, and a no-op
    /// when nothing is running.
    pub fn cancel(&self) {
        if self.is_active() {
            info!("cancellation requested");
            self.inner.current_cancel().store(true, Ordering::SeqCst);
        }
    }

    /// Start a run on the current Tokio runtime.
    ///
    /// Fails without running any step when the sequence has no enabled
    /// steps, a run is already active, the During timeline does not parse
    /// (or has ordering problems in strict mode), or the time reference
    /// cannot be read.
    pub fn start(&self, sequence: Sequence) -> Result<RunHandle> {
        let inner = &self.inner;
        if sequence.is_empty() {
            return Err(inner.structural(SequencerError::NoSequenceLoaded));
        }
        if inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Not published: the bus belongs to the run already in flight.
            return Err(SequencerError::RunInProgress);
        }
        let guard = ActiveGuard(Arc::clone(inner));

        let (timeline, warnings) =
            Timeline::build(sequence.section(Section::During)).map_err(|e| inner.structural(e))?;
        if inner.options.strict_timeline {
            if let Some(w) = warnings.first() {
                return Err(inner.structural(w.clone().into_error()));
            }
        }
        for w in &warnings {
            inner.bus.warning(
                Some(Section::During),
                Some(w.step.as_str()),
                Some(ErrorKind::MalformedTimeline),
                w.to_string(),
            );
        }
        if !timeline.is_empty() {
            inner
                .clock
                .now()
                .map_err(|e| inner.structural(SequencerError::from(e)))?;
        }

        let cancel = Arc::new(AtomicBool::new(false));
        *inner.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&cancel);
        let run_id = Uuid::new_v4();
        info!(%run_id, steps = sequence.enabled_count(), "run starting");
        let task = tokio::spawn(Arc::clone(inner).execute(
            run_id,
            sequence,
            timeline,
            Arc::clone(&cancel),
            guard,
        ));

        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }

    /// Start a run and wait for it to finish.
    pub async fn run(&self, sequence: Sequence) -> Result<RunReport> {
        self.start(sequence)?.wait().await
    }
}

/// Clears the active flag when the run ends, including on panic or an early
/// return from `start`.
struct ActiveGuard(Arc<Inner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn structural(&self, err: SequencerError) -> SequencerError {
        self.bus.error(None, None, err.kind(), err.to_string());
        err
    }

    fn set_phase(&self, phase: RunPhase) {
        let mut current = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        let previous = *current;
        *current = phase;
        debug!(from = %previous, to = %phase, "runner");
    }

    fn enter(&self, section: Section) {
        self.set_phase(RunPhase::running(section));
        info!(%section, "entering section");
        self.bus.publish(RunEvent::SectionChanged { section });
    }

    fn current_cancel(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn execute(
        self: Arc<Self>,
        run_id: Uuid,
        sequence: Sequence,
        timeline: Timeline,
        cancel: Arc<AtomicBool>,
        _guard: ActiveGuard,
    ) -> RunReport {
        let started_at = Utc::now();
        let mut counter = StepCounter::new(sequence.enabled_count());
        let mut failures = Vec::new();
        let mut trigger = None;
        // Set only when a cancel actually skipped work. A cancel that lands
        // during the last During step or during Post changes nothing.
        let mut cut_short = false;

        self.enter(Section::Setup);
        for step in sequence.enabled(Section::Setup) {
            if cancel.load(Ordering::SeqCst) {
                info!(step = %step.name, "cancelled during setup");
                cut_short = true;
                break;
            }
            let index = counter.started(&self.bus, step);
            let outcome = self.executor.execute(step).await;
            counter.finished(&self.bus, step, index, &outcome);
            if let Some(failure) = outcome.error {
                failures.push(RunFailure::new(
                    Section::Setup,
                    &step.name,
                    failure.kind(),
                    failure.reason(),
                ));
                break;
            }
        }

        if !cut_short && failures.is_empty() && !timeline.is_empty() && cancel.load(Ordering::SeqCst)
        {
            info!("cancelled before During; skipping to Post");
            cut_short = true;
        }
        if !cut_short && failures.is_empty() && !timeline.is_empty() {
            self.enter(Section::During);
            let mut scheduler = Scheduler::new(
                timeline,
                self.executor.clone(),
                Arc::clone(&self.clock),
                self.bus.clone(),
                Arc::clone(&cancel),
                &self.options,
            );
            let exit = scheduler.run(&mut counter).await;
            trigger = scheduler.trigger();
            match exit {
                DuringExit::Drained => {}
                DuringExit::Cancelled => cut_short = true,
                DuringExit::Failed(failure) => failures.push(failure),
                DuringExit::ClockLost(reason) => failures.push(RunFailure::new(
                    Section::During,
                    "",
                    ErrorKind::TimeReferenceUnavailable,
                    reason,
                )),
            }
        }

        self.enter(Section::Post);
        for step in sequence.enabled(Section::Post) {
            let index = counter.started(&self.bus, step);
            let outcome = self.executor.execute(step).await;
            counter.finished(&self.bus, step, index, &outcome);
            if let Some(failure) = outcome.error {
                failures.push(RunFailure::new(
                    Section::Post,
                    &step.name,
                    failure.kind(),
                    failure.reason(),
                ));
            }
        }

        let outcome = if !failures.is_empty() {
            RunOutcome::Failed
        } else if cut_short {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Completed
        };
        self.set_phase(RunPhase::terminal(outcome));
        self.bus.publish(RunEvent::RunFinished { outcome });
        info!(%run_id, %outcome, failures = failures.len(), "run finished");

        let report = RunReport {
            run_id,
            sequence: sequence.source.clone(),
            outcome,
            failures,
            trigger,
            started_at,
            finished_at: Utc::now(),
        };
        if let Some(sink) = &self.history {
            if let Err(e) = sink.record(&RunRecord::from(&report)) {
                warn!(error = %e, "failed to record run history");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{TimeReference, TimeReferenceError};
    use crate::step::Step;
    use crate::types::{WaitCondition, WaitType};
    use crate::unit::{UnitFault, UnitRegistry};
    use serde_json::Value;
    use tokio::time::Instant;

    type Log = Arc<Mutex<Vec<String>>>;

    fn step(section: Section, name: &str, location: &str, kind: WaitType, timeout: f64) -> Step {
        Step::new(section, name, location, WaitCondition::new(kind, timeout))
    }

    /// Builtins plus `record` (returns true) and `record-false`, both logging
    /// the step name.
    fn registry(log: &Log) -> UnitRegistry {
        let mut registry = UnitRegistry::with_builtins();
        registry.set_command_fallback(false);
        for (location, result) in [("record", true), ("record-false", false)] {
            let log = Arc::clone(log);
            registry.register_fn(location, move |inv| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(inv.step);
                    Ok(Value::Bool(result))
                }
            });
        }
        let log = Arc::clone(log);
        registry.register_fn("record-fault", move |inv| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(inv.step);
                Err(UnitFault::new("instrument offline"))
            }
        });
        registry
    }

    fn runner(log: &Log) -> SequenceRunner {
        SequenceRunner::builder(StepExecutor::new(registry(log))).build()
    }

    fn ran(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn sequence(steps: Vec<Step>) -> Sequence {
        let mut seq = Sequence::new();
        for s in steps {
            seq.push(s);
        }
        seq
    }

    fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn full_sequence_completes_with_timed_step() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let mut rx = runner.subscribe();
        let origin = Instant::now();

        let during_b = step(Section::During, "B", "record", WaitType::BooleanReturn, 5.0)
            .with_argument("T+2s");
        let seq = sequence(vec![
            step(Section::Setup, "A", "record", WaitType::BooleanReturn, 5.0),
            during_b,
            step(Section::During, "C", "record", WaitType::AnyReturn, 1.0),
            step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0),
        ]);

        let report = runner.run(seq).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.failures.is_empty());
        assert!(report.trigger.is_some());
        assert_eq!(ran(&log), ["A", "B", "C", "D"]);
        assert!(origin.elapsed() >= Duration::from_secs(2));
        assert_eq!(runner.phase(), RunPhase::Completed);
        assert!(!runner.is_active());

        let events = drain(&mut rx);
        let sections: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::SectionChanged { section } => Some(*section),
                _ => None,
            })
            .collect();
        assert_eq!(sections, [Section::Setup, Section::During, Section::Post]);
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunFinished {
                outcome: RunOutcome::Completed
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_during_never_captures_trigger() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![
            step(Section::Setup, "A", "record", WaitType::BooleanReturn, 5.0),
            step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0),
        ]);
        let report = runner.run(seq).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.trigger, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_setup_skips_to_post() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![
            step(Section::Setup, "A1", "record-false", WaitType::BooleanReturn, 5.0),
            step(Section::Setup, "A2", "record", WaitType::BooleanReturn, 5.0),
            step(Section::During, "B", "record", WaitType::BooleanReturn, 5.0),
            step(Section::Post, "D1", "record-fault", WaitType::AnyReturn, 5.0),
            step(Section::Post, "D2", "record", WaitType::BooleanReturn, 5.0),
        ]);
        let report = runner.run(seq).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(ran(&log), ["A1", "D1", "D2"]);
        assert_eq!(report.trigger, None);

        let kinds: Vec<_> = report.failures.iter().map(|f| (f.step.as_str(), f.kind)).collect();
        assert_eq!(
            kinds,
            [
                ("A1", ErrorKind::StepReportedFailure),
                ("D1", ErrorKind::StepFault)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_during_step_halts_during_and_runs_post() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![
            step(Section::During, "E", "record-false", WaitType::BooleanReturn, 5.0),
            step(Section::During, "F", "record", WaitType::BooleanReturn, 5.0),
            step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0),
        ]);
        let report = runner.run(seq).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(ran(&log), ["E", "D"]);
        assert_eq!(runner.phase(), RunPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_during_skips_remaining_steps() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let mut steps = Vec::new();
        for (i, offset) in ["T+1s", "T+2s", "T+3s", "T+4s", "T+5s"].iter().enumerate() {
            steps.push(
                step(Section::During, &format!("S{}", i + 1), "record", WaitType::AnyReturn, 1.0)
                    .with_argument(*offset),
            );
        }
        steps.push(step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0));

        let handle = runner.start(sequence(steps)).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.cancel();
        handle.cancel();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(ran(&log), ["S1", "S2", "D"]);
        assert_eq!(runner.phase(), RunPhase::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_setup_steps_goes_to_post() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![
            step(Section::Setup, "warmup", "builtin:sleep", WaitType::BooleanReturn, 10.0)
                .with_argument("2"),
            step(Section::Setup, "A", "record", WaitType::BooleanReturn, 5.0),
            step(Section::During, "B", "record", WaitType::BooleanReturn, 5.0),
            step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0),
        ]);
        let handle = runner.start(seq).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        runner.cancel();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(ran(&log), ["D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_post_still_completes() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![
            step(Section::During, "B", "record", WaitType::BooleanReturn, 5.0),
            step(Section::Post, "cool", "builtin:sleep", WaitType::BooleanReturn, 10.0)
                .with_argument("2"),
            step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0),
        ]);
        let handle = runner.start(seq).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runner.phase(), RunPhase::running(Section::Post));
        runner.cancel();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.failures.is_empty());
        assert_eq!(ran(&log), ["B", "D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_last_during_step_still_completes() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![
            step(Section::During, "B", "record", WaitType::BooleanReturn, 5.0),
            step(Section::During, "soak", "builtin:sleep", WaitType::BooleanReturn, 10.0)
                .with_argument("2"),
            step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0),
        ]);
        let handle = runner.start(seq).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        runner.cancel();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(ran(&log), ["B", "D"]);
        assert_eq!(runner.phase(), RunPhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_timeout_still_reaches_post() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![
            step(Section::Setup, "A", "record", WaitType::BooleanReturn, 1e20),
            step(Section::During, "B", "record", WaitType::AnyReturn, 1e300),
            step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0),
        ]);
        let report = runner.run(seq).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(ran(&log), ["A", "B", "D"]);
    }

    #[tokio::test]
    async fn oversized_offset_is_structural() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![step(Section::During, "B", "record", WaitType::AnyReturn, 1.0)
            .with_argument("T+100000000000000000000")]);
        let err = runner.start(seq).err().unwrap();
        assert!(matches!(err, SequencerError::MalformedTimeline { .. }));
        assert!(!runner.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handle_cannot_cancel_next_run() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let first = runner
            .start(sequence(vec![step(Section::Setup, "A", "record", WaitType::BooleanReturn, 5.0)]))
            .unwrap();
        while runner.is_active() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let second = runner
            .start(sequence(vec![
                step(Section::Setup, "warmup", "builtin:sleep", WaitType::BooleanReturn, 10.0)
                    .with_argument("2"),
                step(Section::During, "B", "record", WaitType::BooleanReturn, 5.0),
            ]))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        first.cancel();
        let report = second.wait().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(ran(&log), ["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_active_is_rejected() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let slow = || {
            sequence(vec![
                step(Section::Setup, "wait", "builtin:sleep", WaitType::BooleanReturn, 10.0)
                    .with_argument("3"),
                step(Section::Post, "D", "record", WaitType::BooleanReturn, 5.0),
            ])
        };

        let first = runner.start(slow()).unwrap();
        assert!(runner.is_active());
        let mut rx = runner.subscribe();
        let err = runner.start(slow()).err().unwrap();
        assert!(matches!(err, SequencerError::RunInProgress));
        assert!(
            drain(&mut rx)
                .iter()
                .all(|e| !matches!(e, RunEvent::Status { .. })),
            "rejected start must not leak onto the active run's events"
        );

        let report = first.wait().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(ran(&log), ["D"]);

        // The runner is reusable once the first run ends.
        assert!(runner.start(slow()).is_ok());
    }

    #[tokio::test]
    async fn empty_sequence_fails_fast() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let mut rx = runner.subscribe();
        let seq = sequence(vec![
            step(Section::Setup, "off", "record", WaitType::BooleanReturn, 5.0).disabled(),
        ]);
        let err = runner.start(seq).err().unwrap();
        assert!(matches!(err, SequencerError::NoSequenceLoaded));
        assert!(!runner.is_active());
        match rx.try_recv().unwrap() {
            RunEvent::Status { kind, .. } => assert_eq!(kind, Some(ErrorKind::NoSequenceLoaded)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_time_spec_is_structural() {
        let log: Log = Default::default();
        let runner = runner(&log);
        let seq = sequence(vec![
            step(Section::Setup, "A", "record", WaitType::BooleanReturn, 5.0),
            step(Section::During, "B", "record", WaitType::BooleanReturn, 5.0)
                .with_argument("T+soon"),
        ]);
        let err = runner.start(seq).err().unwrap();
        assert!(matches!(err, SequencerError::MalformedTimeline { .. }));
        assert!(ran(&log).is_empty());
        assert!(!runner.is_active());
    }

    #[tokio::test]
    async fn strict_timeline_rejects_backwards_schedule() {
        let log: Log = Default::default();
        let runner = SequenceRunner::builder(StepExecutor::new(registry(&log)))
            .options(RunnerOptions {
                strict_timeline: true,
                ..RunnerOptions::default()
            })
            .build();
        let seq = sequence(vec![
            step(Section::During, "late", "record", WaitType::AnyReturn, 1.0).with_argument("T+5s"),
            step(Section::During, "early", "record", WaitType::AnyReturn, 1.0).with_argument("T+1s"),
        ]);
        let err = runner.start(seq).err().unwrap();
        assert!(matches!(err, SequencerError::MalformedTimeline { .. }));
    }

    struct BrokenClock;

    impl TimeReference for BrokenClock {
        fn now(&self) -> std::result::Result<DateTime<Utc>, TimeReferenceError> {
            Err(TimeReferenceError("no sync card".into()))
        }
    }

    #[tokio::test]
    async fn unreadable_clock_fails_start() {
        let log: Log = Default::default();
        let runner = SequenceRunner::builder(StepExecutor::new(registry(&log)))
            .clock(Arc::new(BrokenClock))
            .build();
        let seq = sequence(vec![step(Section::During, "B", "record", WaitType::AnyReturn, 1.0)]);
        let err = runner.start(seq).err().unwrap();
        assert!(matches!(err, SequencerError::TimeReferenceUnavailable(_)));
        assert!(!runner.is_active());
    }

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<RunRecord>>);

    impl RunHistorySink for MemorySink {
        fn record(&self, record: &RunRecord) -> Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finished_runs_are_recorded_once() {
        let log: Log = Default::default();
        let sink = Arc::new(MemorySink::default());
        let runner = SequenceRunner::builder(StepExecutor::new(registry(&log)))
            .history(sink.clone())
            .build();
        let mut seq = sequence(vec![step(Section::Setup, "A", "record", WaitType::BooleanReturn, 5.0)]);
        seq.source = Some(PathBuf::from("/rig/seq.json"));

        let report = runner.run(seq).await.unwrap();
        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_id, report.run_id);
        assert_eq!(records[0].sequence.as_deref(), Some(std::path::Path::new("/rig/seq.json")));
        assert_eq!(records[0].outcome, RunOutcome::Completed);
    }

    #[test]
    fn options_cap_poll_interval() {
        let opts = RunnerOptions {
            poll_interval: Duration::from_secs(2),
            progress_interval: Duration::ZERO,
            strict_timeline: false,
        }
        .normalized();
        assert_eq!(opts.poll_interval, MAX_POLL_INTERVAL);
        assert_eq!(opts.progress_interval, Duration::from_millis(250));
    }
}
