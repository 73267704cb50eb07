pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod history;
pub mod io;
pub mod loader;
pub mod paths;
pub mod runner;
pub mod scheduler;
pub mod step;
pub mod timeline;
pub mod types;
pub mod unit;

pub use clock::{MonotonicClock, SharedClock, TimeReference, TimeReferenceError};
pub use error::{ErrorKind, Result, SequencerError};
pub use event::{EventBus, RunEvent, StatusLevel};
pub use executor::{StepExecutor, StepFailure, StepOutcome};
pub use runner::{
    RunFailure, RunHandle, RunHistorySink, RunRecord, RunReport, RunnerBuilder, RunnerOptions,
    SequenceRunner,
};
pub use step::{Sequence, Step};
pub use types::{RunOutcome, RunPhase, Section, WaitCondition, WaitType};
pub use unit::{Invocation, StepUnit, UnitFault, UnitRegistry};
