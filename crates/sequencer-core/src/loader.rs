//! Sequence file loader.
//!
//! A sequence file is a JSON or YAML mapping from section name to a list of
//! step rows:
//!
//! ```yaml
//! Setup:
//!   - step_name: power on
//!     module_path: units/psu.sh
//!     config: configs/psu.json
//!     enable: true
//!     wait_type: boolean_return
//!     timeout_sec: 10
//! Test:
//!   - name: capture
//!     location: builtin:sleep
//!     argument: T+2s
//!     wait_condition: { type: hard_wait, timeout_sec: 1 }
//! Cleanup: []
//! ```
//!
//! Section and field names match case-insensitively, and the older field
//! names (`step_name`, `module_path`, `config`, `enable`, `wait_time`) are
//! accepted next to the current ones. Rows that cannot form a step are
//! dropped with a warning rather than failing the whole file.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Result, SequencerError};
use crate::paths;
use crate::step::{Sequence, Step};
use crate::types::{Section, WaitCondition, WaitType};
use crate::unit::BUILTIN_PREFIX;

#[derive(Debug, Clone)]
pub struct LoadedSequence {
    pub sequence: Sequence,
    /// Dropped rows and ignored sections, in file order.
    pub warnings: Vec<String>,
}

/// Read and normalize a sequence file. Relative unit and config paths are
/// resolved against the file's directory.
pub fn load_sequence(path: &Path, default_timeout_sec: f64) -> Result<LoadedSequence> {
    let data = std::fs::read_to_string(path)?;
    let invalid = |reason: String| SequencerError::InvalidSequence {
        path: path.display().to_string(),
        reason,
    };
    let doc: Value = if paths::is_yaml(path) {
        serde_yaml::from_str(&data).map_err(|e| invalid(e.to_string()))?
    } else {
        serde_json::from_str(&data).map_err(|e| invalid(e.to_string()))?
    };

    let base = path.parent().unwrap_or(Path::new("."));
    let mut loaded = parse_sequence(&doc, base, default_timeout_sec).map_err(invalid)?;
    loaded.sequence.source = Some(path.to_path_buf());
    debug!(
        path = %path.display(),
        steps = loaded.sequence.enabled_count(),
        dropped = loaded.warnings.len(),
        "sequence loaded"
    );
    Ok(loaded)
}

/// Normalize an already-parsed document. Fails only when the top level is
/// not a mapping.
pub fn parse_sequence(
    doc: &Value,
    base_dir: &Path,
    default_timeout_sec: f64,
) -> std::result::Result<LoadedSequence, String> {
    let Some(sections) = doc.as_object() else {
        return Err("top level must be a mapping of section names to step lists".into());
    };

    let mut sequence = Sequence::new();
    let mut warnings = Vec::new();

    for (key, rows) in sections {
        let Some(section) = Section::parse_loose(key) else {
            warnings.push(format!("ignoring unknown section '{key}'"));
            continue;
        };
        let Some(rows) = rows.as_array() else {
            if !rows.is_null() {
                warnings.push(format!("section '{key}' is not a list; ignored"));
            }
            continue;
        };

        let mut seen: HashSet<String> = sequence
            .section(section)
            .iter()
            .map(|s| s.name.clone())
            .collect();
        for (i, row) in rows.iter().enumerate() {
            match parse_row(section, row, base_dir, default_timeout_sec) {
                Ok(step) if !seen.insert(step.name.clone()) => warnings.push(format!(
                    "{section} row {}: duplicate step name '{}' dropped",
                    i + 1,
                    step.name
                )),
                Ok(step) => sequence.push(step),
                Err(reason) => warnings.push(format!("{section} row {}: {reason}", i + 1)),
            }
        }
    }

    for w in &warnings {
        warn!("{w}");
    }
    Ok(LoadedSequence { sequence, warnings })
}

fn parse_row(
    section: Section,
    row: &Value,
    base_dir: &Path,
    default_timeout_sec: f64,
) -> std::result::Result<Step, String> {
    let Some(row) = row.as_object() else {
        return Err("not a mapping; dropped".into());
    };

    let name = text(field(row, &["name", "step_name"]))
        .ok_or_else(|| "missing step name; dropped".to_string())?;
    let location = text(field(row, &["location", "module_path"]))
        .ok_or_else(|| format!("step '{name}' has no location; dropped"))?;
    let location = resolve_location(base_dir, &location);
    let config_location = text(field(row, &["config_location", "config"]))
        .map(|c| paths::resolve_against(base_dir, &c).display().to_string())
        .unwrap_or_default();

    let enabled = match field(row, &["enabled", "enable"]) {
        None | Some(Value::Null) => true,
        Some(v) => flag(v).ok_or_else(|| format!("step '{name}' has an invalid enabled flag"))?,
    };
    let argument = field(row, &["argument"]).and_then(argument_text);
    let wait_condition = wait_condition(row, default_timeout_sec)
        .map_err(|reason| format!("step '{name}': {reason}; dropped"))?;

    Ok(Step {
        section,
        name,
        location,
        config_location,
        enabled,
        argument,
        wait_condition,
    })
}

fn wait_condition(
    row: &Map<String, Value>,
    default_timeout_sec: f64,
) -> std::result::Result<WaitCondition, String> {
    let (kind, timeout) = match field(row, &["wait_condition"]).and_then(Value::as_object) {
        Some(wc) => (field(wc, &["type", "wait_type"]), field(wc, &["timeout_sec", "timeout"])),
        None => (
            field(row, &["wait_type"]),
            field(row, &["timeout_sec", "wait_time"]),
        ),
    };

    let kind = match kind.and_then(Value::as_str) {
        None => WaitType::BooleanReturn,
        Some(raw) => {
            WaitType::parse_loose(raw).ok_or_else(|| format!("unknown wait type '{raw}'"))?
        }
    };
    let timeout_sec = match timeout {
        None | Some(Value::Null) => default_timeout_sec,
        Some(v) => number(v).ok_or_else(|| format!("invalid timeout {v}"))?,
    };
    Ok(WaitCondition::new(kind, timeout_sec))
}

/// Case-insensitive field lookup; `-` and spaces count as `_`.
fn field<'a>(row: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|want| {
        row.iter()
            .find(|(k, _)| normalize_key(k) == *want)
            .map(|(_, v)| v)
    })
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn argument_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Registry names and bare program names are kept; relative paths are
/// anchored at the sequence file's directory.
fn resolve_location(base_dir: &Path, location: &str) -> String {
    let looks_like_path =
        location.contains('/') || location.contains('\\') || location.starts_with('.');
    if location.starts_with(BUILTIN_PREFIX) || !looks_like_path {
        return location.to_string();
    }
    paths::resolve_against(base_dir, location)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn parse(doc: Value) -> LoadedSequence {
        parse_sequence(&doc, Path::new("/seqs"), 60.0).unwrap()
    }

    #[test]
    fn sections_and_fields_match_case_insensitively() {
        let loaded = parse(json!({
            "SETUP": [{"Step_Name": "power", "Module_Path": "builtin:pass", "ENABLE": true}],
            "Test": [{"name": "capture", "location": "builtin:pass", "argument": "T+2s",
                      "wait_condition": {"Type": "hard-wait", "timeout_sec": 1.5}}],
            "cleanup": [{"name": "off", "location": "builtin:pass", "wait_type": "no_wait"}],
        }));
        assert!(loaded.warnings.is_empty());
        let seq = loaded.sequence;
        assert_eq!(seq.setup[0].name, "power");
        assert_eq!(seq.during[0].argument.as_deref(), Some("T+2s"));
        assert_eq!(
            seq.during[0].wait_condition,
            WaitCondition::new(WaitType::HardWait, 1.5)
        );
        assert_eq!(seq.post[0].wait_condition.kind, WaitType::NoWait);
        assert_eq!(seq.post[0].wait_condition.timeout_sec, 60.0);
    }

    #[test]
    fn malformed_rows_are_dropped_with_warnings() {
        let loaded = parse(json!({
            "setup": [
                "not a row",
                {"name": "", "location": "builtin:pass"},
                {"name": "no-location"},
                {"name": "bad-wait", "location": "builtin:pass", "wait_type": "eventually"},
                {"name": "ok", "location": "builtin:pass"},
                {"name": "ok", "location": "builtin:fail"},
            ],
            "teardown": [],
        }));
        assert_eq!(loaded.sequence.setup.len(), 1);
        assert_eq!(loaded.sequence.setup[0].location, "builtin:pass");
        assert_eq!(loaded.warnings.len(), 6);
        assert!(loaded.warnings.iter().any(|w| w.contains("duplicate")));
        assert!(loaded.warnings.iter().any(|w| w.contains("teardown")));
    }

    #[test]
    fn relative_paths_resolve_against_sequence_dir() {
        let loaded = parse(json!({
            "setup": [
                {"name": "a", "location": "units/psu.sh", "config": "cfg/psu.json"},
                {"name": "b", "location": "python3"},
                {"name": "c", "location": "/opt/rig/dmm.sh"},
                {"name": "d", "location": "builtin:echo"},
            ]
        }));
        let setup = &loaded.sequence.setup;
        assert_eq!(setup[0].location, "/seqs/units/psu.sh");
        assert_eq!(setup[0].config_location, "/seqs/cfg/psu.json");
        assert_eq!(setup[1].location, "python3");
        assert_eq!(setup[2].location, "/opt/rig/dmm.sh");
        assert_eq!(setup[3].location, "builtin:echo");
        assert_eq!(setup[3].config_location, "");
    }

    #[test]
    fn legacy_flags_and_wait_time_are_accepted() {
        let loaded = parse(json!({
            "setup": [
                {"name": "a", "location": "builtin:pass", "enable": "no", "wait_time": "2.5"},
                {"name": "b", "location": "builtin:pass", "argument": 3},
            ]
        }));
        let setup = &loaded.sequence.setup;
        assert!(!setup[0].enabled);
        assert_eq!(setup[0].wait_condition.timeout_sec, 2.5);
        assert_eq!(setup[1].argument.as_deref(), Some("3"));
    }

    #[test]
    fn top_level_must_be_mapping() {
        assert!(parse_sequence(&json!([1, 2]), Path::new("."), 60.0).is_err());
    }

    #[test]
    fn load_yaml_file_records_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("burn-in.yaml");
        std::fs::write(
            &path,
            "Setup:\n  - name: a\n    location: builtin:pass\nDuring:\n  - name: b\n    location: ./units/b.sh\n    argument: T+1s\n",
        )
        .unwrap();
        let loaded = load_sequence(&path, 30.0).unwrap();
        assert_eq!(loaded.sequence.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.sequence.setup[0].wait_condition.timeout_sec, 30.0);
        assert_eq!(
            loaded.sequence.during[0].location,
            dir.path().join("./units/b.sh").display().to_string()
        );
    }

    #[test]
    fn invalid_json_is_invalid_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = load_sequence(&path, 60.0).unwrap_err();
        assert!(matches!(err, SequencerError::InvalidSequence { .. }));
    }
}
