use crate::output::{print_json, print_table};
use anyhow::Context;
use sequencer_core::loader::load_sequence;
use sequencer_core::timeline::{ScheduleSpec, Timeline};
use sequencer_core::{Section, Step, UnitRegistry};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct StepRow<'a> {
    #[serde(flatten)]
    step: &'a Step,
    schedule: Option<String>,
    unit_error: Option<String>,
}

pub fn run(root: &Path, config_path: Option<&Path>, file: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root, config_path)?;
    let path = super::resolve_sequence_path(root, &config, file)?;
    let loaded = load_sequence(&path, config.default_timeout_sec)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let sequence = &loaded.sequence;

    let (_, timeline_warnings) = Timeline::build(sequence.section(Section::During))
        .context("During timeline is malformed")?;
    let timeline_warnings: Vec<String> =
        timeline_warnings.iter().map(ToString::to_string).collect();

    let registry = UnitRegistry::with_builtins();
    let rows: Vec<StepRow> = Section::all()
        .iter()
        .flat_map(|s| sequence.section(*s))
        .map(|step| StepRow {
            step,
            schedule: match step.section {
                Section::During => ScheduleSpec::parse(step.argument.as_deref())
                    .ok()
                    .filter(ScheduleSpec::is_timed)
                    .map(|s| s.to_string()),
                _ => None,
            },
            unit_error: registry.resolve(&step.location).err().map(|e| e.0),
        })
        .collect();
    let unresolved = rows
        .iter()
        .filter(|r| r.step.enabled && r.unit_error.is_some())
        .count();

    if json {
        print_json(&serde_json::json!({
            "path": path,
            "enabled_steps": sequence.enabled_count(),
            "steps": rows,
            "load_warnings": loaded.warnings,
            "timeline_warnings": timeline_warnings,
        }))?;
    } else {
        let table = rows
            .iter()
            .map(|r| {
                vec![
                    r.step.section.to_string(),
                    r.step.name.clone(),
                    r.step.wait_condition.kind.to_string(),
                    format!("{}", r.step.wait_condition.timeout_sec),
                    r.schedule.clone().unwrap_or_default(),
                    if r.step.enabled { "yes" } else { "no" }.to_string(),
                    r.unit_error
                        .as_ref()
                        .map_or_else(|| r.step.location.clone(), |e| format!("! {e}")),
                ]
            })
            .collect();
        print_table(
            &["SECTION", "NAME", "WAIT", "TIMEOUT", "AT", "ENABLED", "UNIT"],
            table,
        );
        for w in loaded.warnings.iter().chain(&timeline_warnings) {
            println!("[warning] {w}");
        }
    }

    if sequence.is_empty() {
        anyhow::bail!("{} has no enabled steps", path.display());
    }
    if config.strict_timeline && !timeline_warnings.is_empty() {
        anyhow::bail!("timeline has ordering problems and strict_timeline is set");
    }
    if unresolved > 0 {
        anyhow::bail!("{unresolved} step(s) reference a unit that cannot be resolved");
    }
    Ok(())
}
