use crate::output::{print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, config_path: Option<&Path>, clear: bool, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root, config_path)?;
    let history = super::open_history(root, &config)?;

    if clear {
        history.clear()?;
        if json {
            print_json(&serde_json::json!({ "cleared": true }))?;
        } else {
            println!("History cleared.");
        }
        return Ok(());
    }

    let entries = history.entries()?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No previous sequences.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let state = if p.is_file() { "" } else { "missing" };
            vec![(i + 1).to_string(), p.display().to_string(), state.to_string()]
        })
        .collect();
    print_table(&["#", "SEQUENCE", ""], rows);
    Ok(())
}
