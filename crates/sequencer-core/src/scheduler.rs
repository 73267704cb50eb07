//! The During dispatch loop.
//!
//! ```text
//! AwaitingTrigger -> Dispatching(0) -> Waiting(0) -> Advancing -> Dispatching(1) -> ... -> Drained
//! ```
//!
//! `Dispatching(i)` covers the hold before entry `i` is due; `Waiting(i)`
//! covers the executor call. The loop never sleeps longer than the poll
//! interval, so cancellation and progress ticks stay responsive while a
//! multi-minute offset counts down.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::{elapsed_between, SharedClock, TimeReferenceError};
use crate::error::ErrorKind;
use crate::event::{EventBus, RunEvent};
use crate::executor::{StepExecutor, StepOutcome};
use crate::runner::{RunFailure, RunnerOptions};
use crate::step::Step;
use crate::timeline::{BoundTimeline, Timeline};
use crate::types::Section;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    AwaitingTrigger,
    Dispatching(usize),
    Waiting(usize),
    Advancing,
    Drained,
}

/// How the During section ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DuringExit {
    Drained,
    Cancelled,
    Failed(RunFailure),
    /// The time reference failed mid-section.
    ClockLost(String),
}

// ---------------------------------------------------------------------------
// StepCounter
// ---------------------------------------------------------------------------

/// Numbers dispatched steps across the whole run and announces them.
#[derive(Debug, Clone)]
pub(crate) struct StepCounter {
    next: usize,
    total: usize,
}

impl StepCounter {
    pub(crate) fn new(total: usize) -> Self {
        Self { next: 0, total }
    }

    pub(crate) fn started(&mut self, bus: &EventBus, step: &Step) -> usize {
        self.next += 1;
        info!(
            section = %step.section,
            step = %step.name,
            "[{}/{}] starting",
            self.next,
            self.total
        );
        bus.publish(RunEvent::StepStarted {
            section: step.section,
            name: step.name.clone(),
            index: self.next,
            total: self.total,
        });
        self.next
    }

    pub(crate) fn finished(&self, bus: &EventBus, step: &Step, index: usize, outcome: &StepOutcome) {
        match &outcome.error {
            None => info!(
                section = %step.section,
                step = %step.name,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "step passed"
            ),
            Some(failure) => bus.error(
                Some(step.section),
                Some(step.name.as_str()),
                Some(failure.kind()),
                format!("step '{}' failed: {failure}", step.name),
            ),
        }
        bus.publish(RunEvent::StepFinished {
            section: step.section,
            name: step.name.clone(),
            index,
            total: self.total,
            outcome: outcome.clone(),
        });
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    timeline: Timeline,
    executor: StepExecutor,
    clock: SharedClock,
    bus: EventBus,
    cancel: Arc<AtomicBool>,
    poll_interval: Duration,
    progress_interval: Duration,
    strict_timeline: bool,
    state: SchedulerState,
    bound: Option<BoundTimeline>,
    last_elapsed: Duration,
    last_tick: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        timeline: Timeline,
        executor: StepExecutor,
        clock: SharedClock,
        bus: EventBus,
        cancel: Arc<AtomicBool>,
        options: &RunnerOptions,
    ) -> Self {
        Self {
            timeline,
            executor,
            clock,
            bus,
            cancel,
            poll_interval: options.poll_interval,
            progress_interval: options.progress_interval,
            strict_timeline: options.strict_timeline,
            state: SchedulerState::AwaitingTrigger,
            bound: None,
            last_elapsed: Duration::ZERO,
            last_tick: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// The master trigger, once captured.
    pub fn trigger(&self) -> Option<DateTime<Utc>> {
        self.bound.as_ref().map(BoundTimeline::trigger)
    }

    pub(crate) async fn run(&mut self, counter: &mut StepCounter) -> DuringExit {
        let trigger = match self.clock.now() {
            Ok(t) => t,
            Err(e) => return self.clock_lost(e),
        };
        let (bound, warnings) = self.timeline.bind(trigger);
        info!(trigger = %trigger, steps = bound.len(), "master trigger captured");

        for warning in warnings {
            if self.strict_timeline {
                let failure = RunFailure::new(
                    Section::During,
                    &warning.step,
                    ErrorKind::MalformedTimeline,
                    warning.reason.clone(),
                );
                self.bus.error(
                    Some(Section::During),
                    Some(warning.step.as_str()),
                    Some(ErrorKind::MalformedTimeline),
                    warning.to_string(),
                );
                self.bound = Some(bound);
                self.transition(SchedulerState::Drained);
                return DuringExit::Failed(failure);
            }
            self.bus.warning(
                Some(Section::During),
                Some(warning.step.as_str()),
                Some(ErrorKind::MalformedTimeline),
                warning.to_string(),
            );
        }

        let final_offset = bound.final_offset();
        let entries = bound.entries().to_vec();
        self.bound = Some(bound);

        for (i, entry) in entries.iter().enumerate() {
            self.transition(SchedulerState::Dispatching(i));

            if let Some(offset) = entry.offset {
                if let Some(exit) = self.hold_until(offset, final_offset).await {
                    return exit;
                }
            }
            if self.cancel.load(Ordering::SeqCst) {
                info!(
                    step = %entry.step.name,
                    skipped = entries.len() - i,
                    "cancelled; skipping remaining During steps"
                );
                self.transition(SchedulerState::Drained);
                return DuringExit::Cancelled;
            }
            if let Err(e) = self.tick(final_offset, true) {
                return self.clock_lost(e);
            }

            self.transition(SchedulerState::Waiting(i));
            let index = counter.started(&self.bus, &entry.step);
            let (outcome, clock_err) = self.execute_with_ticks(&entry.step, final_offset).await;
            counter.finished(&self.bus, &entry.step, index, &outcome);

            if let Some(failure) = outcome.error {
                self.transition(SchedulerState::Drained);
                return DuringExit::Failed(RunFailure::new(
                    Section::During,
                    &entry.step.name,
                    failure.kind(),
                    failure.reason(),
                ));
            }
            if let Some(e) = clock_err {
                return self.clock_lost(e);
            }
            self.transition(SchedulerState::Advancing);
        }

        if let Err(e) = self.tick(final_offset, true) {
            return self.clock_lost(e);
        }
        self.transition(SchedulerState::Drained);
        DuringExit::Drained
    }

    /// Poll the time reference until `offset` has elapsed since the trigger.
    /// Returns early with an exit on cancellation or clock failure.
    async fn hold_until(
        &mut self,
        offset: Duration,
        final_offset: Option<Duration>,
    ) -> Option<DuringExit> {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                self.transition(SchedulerState::Drained);
                return Some(DuringExit::Cancelled);
            }
            let elapsed = match self.tick(final_offset, false) {
                Ok(e) => e,
                Err(e) => return Some(self.clock_lost(e)),
            };
            if elapsed >= offset {
                return None;
            }
            let remaining = offset - elapsed;
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    /// Run one step while publishing progress ticks. A clock failure during
    /// the step stops the ticks; it is reported once the step resolves.
    async fn execute_with_ticks(
        &mut self,
        step: &Step,
        final_offset: Option<Duration>,
    ) -> (StepOutcome, Option<TimeReferenceError>) {
        let executor = self.executor.clone();
        let execution = executor.execute(step);
        tokio::pin!(execution);

        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let mut clock_err = None;
        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                _ = ticker.tick(), if clock_err.is_none() => {
                    if let Err(e) = self.tick(final_offset, true) {
                        clock_err = Some(e);
                    }
                }
            }
        };
        (outcome, clock_err)
    }

    /// Read the clock and publish a progress tick when one is due.
    /// Returns the elapsed time since the trigger, never decreasing.
    fn tick(
        &mut self,
        final_offset: Option<Duration>,
        force: bool,
    ) -> Result<Duration, TimeReferenceError> {
        let now = self.clock.now()?;
        let trigger = self.trigger().unwrap_or(now);
        let elapsed = elapsed_between(trigger, now).max(self.last_elapsed);
        self.last_elapsed = elapsed;

        let due = self
            .last_tick
            .map_or(true, |t| t.elapsed() >= self.progress_interval);
        if force || due {
            self.last_tick = Some(Instant::now());
            self.bus.publish(RunEvent::ProgressTick {
                elapsed,
                time_to_finish: final_offset.map(|f| f.saturating_sub(elapsed)),
            });
        }
        Ok(elapsed)
    }

    fn clock_lost(&mut self, e: TimeReferenceError) -> DuringExit {
        self.bus.error(
            Some(Section::During),
            None,
            Some(ErrorKind::TimeReferenceUnavailable),
            format!("time reference unavailable: {e}"),
        );
        self.transition(SchedulerState::Drained);
        DuringExit::ClockLost(e.0)
    }

    fn transition(&mut self, next: SchedulerState) {
        debug!(from = ?self.state, to = ?next, "scheduler");
        self.state = next;
    }
}
