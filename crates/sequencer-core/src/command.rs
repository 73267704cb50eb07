//! External-program step units.
//!
//! # Protocol
//! - argv: the step argument, when present, is the only argument.
//! - stdin: `{"config": <payload>, "argument": <string|null>}` followed by a
//!   newline, then closed.
//! - env: `SEQUENCER_STEP` and `SEQUENCER_SECTION`.
//! - stdout: the last non-empty line is the return value. JSON is parsed
//!   (`true`/`false` become booleans), anything else is returned as a string,
//!   no output is `null`.
//! - exit status: non-zero is a fault carrying the tail of stderr.
//!
//! Stderr is captured, not inherited, so unit chatter stays out of the
//! operator's terminal unless the unit fails.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::unit::{Invocation, StepUnit, UnitFault, UnitResult};

/// Upper bound on the stderr tail carried in a fault message.
const MAX_FAULT_OUTPUT: usize = 2 * 1024;

#[derive(Debug, Clone)]
pub struct CommandUnit {
    program: PathBuf,
}

impl CommandUnit {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Paths are used as-is; bare names are looked up on `PATH`.
    pub fn resolve(location: &str) -> std::result::Result<Self, UnitFault> {
        let looks_like_path = location.contains('/') || location.contains('\\');
        if looks_like_path {
            let path = Path::new(location);
            if !path.exists() {
                return Err(UnitFault(format!("step program not found: {location}")));
            }
            return Ok(Self::new(path));
        }
        which::which(location)
            .map(Self::new)
            .map_err(|e| UnitFault(format!("step program '{location}' not on PATH: {e}")))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl StepUnit for CommandUnit {
    fn run(&self, invocation: Invocation) -> BoxFuture<'static, UnitResult> {
        let program = self.program.clone();
        async move { run_program(&program, invocation).await }.boxed()
    }
}

async fn run_program(program: &Path, inv: Invocation) -> UnitResult {
    let mut cmd = Command::new(program);
    if let Some(arg) = &inv.argument {
        cmd.arg(arg);
    }
    cmd.env("SEQUENCER_STEP", &inv.step)
        .env("SEQUENCER_SECTION", inv.section.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| UnitFault(format!("failed to spawn {}: {e}", program.display())))?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::json!({
            "config": inv.config,
            "argument": inv.argument,
        });
        let mut buf = serde_json::to_vec(&payload)
            .map_err(|e| UnitFault(format!("failed to encode stdin payload: {e}")))?;
        buf.push(b'\n');
        // A program that never reads stdin closes the pipe early; that is fine.
        if let Err(e) = stdin.write_all(&buf).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(UnitFault(format!("failed to write stdin: {e}")));
            }
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| UnitFault(format!("failed to wait for {}: {e}", program.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = tail(stderr.trim(), MAX_FAULT_OUTPUT);
        return Err(if tail.is_empty() {
            UnitFault(format!("exited with {code}"))
        } else {
            UnitFault(format!("exited with {code}: {tail}"))
        });
    }

    Ok(parse_return_value(&String::from_utf8_lossy(&output.stdout)))
}

/// Interpret a unit's stdout as its return value.
pub(crate) fn parse_return_value(stdout: &str) -> Value {
    let Some(line) = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() else {
        return Value::Null;
    };
    match line.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
