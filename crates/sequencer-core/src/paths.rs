use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "sequencer.yaml";
pub const CONFIG_ENV: &str = "SEQUENCER_CONFIG";
pub const STATE_DIR: &str = ".sequencer";
pub const HISTORY_FILE: &str = ".sequencer/history.yaml";

/// Extensions the loader recognises as sequence definitions.
pub const SEQUENCE_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn history_path(root: &Path) -> PathBuf {
    root.join(HISTORY_FILE)
}

/// Join `path` onto `base` unless it is already absolute.
pub fn resolve_against(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

pub fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("yaml" | "yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_root() {
        let root = Path::new("/rig");
        assert_eq!(config_path(root), PathBuf::from("/rig/sequencer.yaml"));
        assert_eq!(
            history_path(root),
            PathBuf::from("/rig/.sequencer/history.yaml")
        );
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let base = Path::new("/seqs");
        assert_eq!(resolve_against(base, "/opt/x.sh"), PathBuf::from("/opt/x.sh"));
        assert_eq!(
            resolve_against(base, "units/x.sh"),
            PathBuf::from("/seqs/units/x.sh")
        );
    }

    #[test]
    fn yaml_detection_is_case_insensitive() {
        assert!(is_yaml(Path::new("a.YML")));
        assert!(is_yaml(Path::new("a.yaml")));
        assert!(!is_yaml(Path::new("a.json")));
    }
}
