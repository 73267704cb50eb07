use crate::output::print_json;
use sequencer_core::config::WarnLevel;
use std::path::Path;

pub fn run(root: &Path, config_path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root, config_path)?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "root": root,
            "config": config,
            "history_path": config.history_path(root),
            "warnings": warnings,
        });
        print_json(&value)?;
    } else {
        println!("root: {}", root.display());
        print!("{}", serde_yaml::to_string(&config)?);
        println!("history_path: {}", config.history_path(root).display());
        if warnings.is_empty() {
            println!("\nConfig is valid. No warnings.");
        } else {
            println!();
            for w in &warnings {
                let prefix = match w.level {
                    WarnLevel::Warning => "warning",
                    WarnLevel::Error => "error",
                };
                println!("[{prefix}] {}", w.message);
            }
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
