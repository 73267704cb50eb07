use crate::output::{print_json_line, secs};
use anyhow::Context;
use futures::StreamExt;
use sequencer_core::event::StatusLevel;
use sequencer_core::loader::load_sequence;
use sequencer_core::{
    RunEvent, RunHistorySink, RunOutcome, RunReport, SequenceRunner, StepExecutor, UnitRegistry,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

// ---------------------------------------------------------------------------
// RunExit: typed non-zero exit codes, mapped to a process exit in main
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RunExit {
    Failed { failures: usize },
    Cancelled,
}

impl RunExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunExit::Failed { .. } => 2,
            RunExit::Cancelled => 3,
        }
    }
}

impl std::fmt::Display for RunExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunExit::Failed { failures } => write!(f, "run failed: {failures} failure(s)"),
            RunExit::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for RunExit {}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub fn run(
    root: &Path,
    config_path: Option<&Path>,
    file: Option<&Path>,
    previous: bool,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(root, config_path)?;
    for w in config.validate() {
        if w.level == sequencer_core::config::WarnLevel::Error {
            anyhow::bail!("invalid config: {}", w.message);
        }
        tracing::warn!("{}", w.message);
    }

    let history = super::open_history(root, &config)?;
    let path = match (file, previous) {
        (Some(f), _) => super::resolve_sequence_path(root, &config, f)?,
        (None, true) => history
            .most_recent()?
            .context("no previous sequence recorded")?,
        (None, false) => anyhow::bail!("no sequence file given (pass FILE or --previous)"),
    };

    let loaded = load_sequence(&path, config.default_timeout_sec)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let executor = StepExecutor::new(UnitRegistry::with_builtins())
        .with_default_timeout(config.default_timeout());
    let mut builder = SequenceRunner::builder(executor).options(config.runner_options());
    if config.history.max_entries > 0 {
        let sink: Arc<dyn RunHistorySink> = Arc::new(history);
        builder = builder.history(sink);
    }
    let runner = builder.build();

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(drive(runner, loaded.sequence, json))?;

    if json {
        print_json_line(&serde_json::json!({ "type": "run_report", "report": report }))?;
    } else {
        print_summary(&path, &report);
    }

    match report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Failed => Err(RunExit::Failed {
            failures: report.failures.len(),
        }
        .into()),
        RunOutcome::Cancelled => Err(RunExit::Cancelled.into()),
    }
}

/// Start the run, stream its events and turn Ctrl-C into a cancellation.
async fn drive(
    runner: SequenceRunner,
    sequence: sequencer_core::Sequence,
    json: bool,
) -> anyhow::Result<RunReport> {
    let printer = tokio::spawn(print_events(runner.subscribe(), json));

    let handle = match runner.start(sequence) {
        Ok(h) => h,
        Err(e) => {
            printer.abort();
            return Err(e).context("failed to start run");
        }
    };

    let canceller = runner.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling; post steps will still run");
            canceller.cancel();
        }
    });

    let report = handle.wait().await;
    ctrl_c.abort();
    let _ = printer.await;
    Ok(report?)
}

async fn print_events(rx: broadcast::Receiver<RunEvent>, json: bool) {
    let mut stream = BroadcastStream::new(rx);
    let mut ticking = false;

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "event printer lagged");
                continue;
            }
        };
        let done = matches!(event, RunEvent::RunFinished { .. });

        if json {
            if let Err(e) = print_json_line(&event) {
                tracing::warn!(error = %e, "failed to print event");
            }
        } else {
            print_human(&event, &mut ticking);
        }
        if done {
            break;
        }
    }
}

fn print_human(event: &RunEvent, ticking: &mut bool) {
    if *ticking && !matches!(event, RunEvent::ProgressTick { .. }) {
        eprintln!();
        *ticking = false;
    }
    match event {
        RunEvent::SectionChanged { section } => println!("== {section} =="),
        RunEvent::StepStarted {
            name, index, total, ..
        } => println!("[{index}/{total}] {name}"),
        RunEvent::StepFinished {
            name,
            index,
            total,
            outcome,
            ..
        } => match &outcome.error {
            None => println!("[{index}/{total}] {name}: passed ({})", secs(outcome.elapsed)),
            Some(failure) => println!(
                "[{index}/{total}] {name}: FAILED ({}) {failure}",
                secs(outcome.elapsed)
            ),
        },
        RunEvent::ProgressTick {
            elapsed,
            time_to_finish,
        } => {
            match time_to_finish {
                Some(left) => eprint!("\r  T+{}  remaining {}   ", secs(*elapsed), secs(*left)),
                None => eprint!("\r  T+{}   ", secs(*elapsed)),
            }
            let _ = std::io::stderr().flush();
            *ticking = true;
        }
        RunEvent::Status {
            level, message, ..
        } => {
            let prefix = match level {
                StatusLevel::Warning => "warning",
                StatusLevel::Error => "error",
            };
            eprintln!("[{prefix}] {message}");
        }
        RunEvent::RunFinished { .. } => {}
    }
}

fn print_summary(path: &Path, report: &RunReport) {
    println!(
        "{}: {} in {}",
        path.display(),
        report.outcome,
        secs(
            (report.finished_at - report.started_at)
                .to_std()
                .unwrap_or_default()
        )
    );
    for f in &report.failures {
        if f.step.is_empty() {
            println!("  {} [{}] {}", f.section, f.kind, f.reason);
        } else {
            println!("  {} / {} [{}] {}", f.section, f.step, f.kind, f.reason);
        }
    }
}
