use crate::types::{Section, WaitCondition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One row of a sequence definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub section: Section,
    /// Display label, unique within its section.
    pub name: String,
    /// Registry key or path of the executable unit.
    pub location: String,
    /// Path of the configuration payload handed to the unit. Empty for none.
    #[serde(default)]
    pub config_location: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub argument: Option<String>,
    #[serde(default)]
    pub wait_condition: WaitCondition,
}

fn default_enabled() -> bool {
    true
}

impl Step {
    pub fn new(
        section: Section,
        name: impl Into<String>,
        location: impl Into<String>,
        wait_condition: WaitCondition,
    ) -> Self {
        Self {
            section,
            name: name.into(),
            location: location.into(),
            config_location: String::new(),
            enabled: true,
            argument: None,
            wait_condition,
        }
    }

    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.argument = Some(argument.into());
        self
    }

    pub fn with_config(mut self, config_location: impl Into<String>) -> Self {
        self.config_location = config_location.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------------

/// A normalized sequence: three ordered step lists.
///
/// Order within a section is definition order and is never changed after
/// loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub setup: Vec<Step>,
    #[serde(default)]
    pub during: Vec<Step>,
    #[serde(default)]
    pub post: Vec<Step>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step to the list for its own section.
    pub fn push(&mut self, step: Step) {
        self.section_mut(step.section).push(step);
    }

    pub fn section(&self, section: Section) -> &[Step] {
        match section {
            Section::Setup => &self.setup,
            Section::During => &self.during,
            Section::Post => &self.post,
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut Vec<Step> {
        match section {
            Section::Setup => &mut self.setup,
            Section::During => &mut self.during,
            Section::Post => &mut self.post,
        }
    }

    pub fn enabled(&self, section: Section) -> impl Iterator<Item = &Step> {
        self.section(section).iter().filter(|s| s.enabled)
    }

    pub fn enabled_count(&self) -> usize {
        Section::all()
            .iter()
            .map(|s| self.enabled(*s).count())
            .sum()
    }

    /// A sequence with nothing to dispatch counts as not loaded.
    pub fn is_empty(&self) -> bool {
        self.enabled_count() == 0
    }

    pub fn find(&self, section: Section, name: &str) -> Option<&Step> {
        self.section(section).iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WaitType;

    fn step(section: Section, name: &str) -> Step {
        Step::new(
            section,
            name,
            "builtin:pass",
            WaitCondition::new(WaitType::BooleanReturn, 1.0),
        )
    }

    #[test]
    fn push_routes_by_section_and_keeps_order() {
        let mut seq = Sequence::new();
        seq.push(step(Section::Post, "d"));
        seq.push(step(Section::Setup, "a"));
        seq.push(step(Section::During, "b"));
        seq.push(step(Section::During, "c"));

        let during: Vec<_> = seq.during.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(during, ["b", "c"]);
        assert_eq!(seq.setup[0].name, "a");
        assert_eq!(seq.post[0].name, "d");
    }

    #[test]
    fn disabled_steps_are_kept_but_not_counted() {
        let mut seq = Sequence::new();
        seq.push(step(Section::Setup, "a").disabled());
        seq.push(step(Section::Post, "b"));

        assert_eq!(seq.setup.len(), 1);
        assert_eq!(seq.enabled_count(), 1);
        assert_eq!(seq.enabled(Section::Setup).count(), 0);
    }

    #[test]
    fn only_disabled_steps_is_empty() {
        let mut seq = Sequence::new();
        assert!(seq.is_empty());
        seq.push(step(Section::During, "x").disabled());
        assert!(seq.is_empty());
    }

    #[test]
    fn names_are_scoped_per_section() {
        let mut seq = Sequence::new();
        seq.push(step(Section::Setup, "init"));
        seq.push(step(Section::Post, "init"));
        assert_eq!(seq.find(Section::Post, "init").unwrap().section, Section::Post);
        assert!(seq.find(Section::During, "init").is_none());
    }
}
