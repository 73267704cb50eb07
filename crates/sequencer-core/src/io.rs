use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `data` to `path` through a tempfile in the same directory, so a
/// crash mid-write never leaves a truncated history or config file behind.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a file that may legitimately be absent. Missing is `Ok(None)`.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/history.yaml");
        atomic_write(&path, b"- a.json\n").unwrap();
        atomic_write(&path, b"- b.json\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "- b.json\n");
    }

    #[test]
    fn read_optional_distinguishes_missing() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_optional(&dir.path().join("nope")).unwrap(), None);
        std::fs::write(dir.path().join("yes"), "x").unwrap();
        assert_eq!(
            read_optional(&dir.path().join("yes")).unwrap().as_deref(),
            Some("x")
        );
    }
}
