//! Saving received files.
//!
//! Writes go to a `.part` file next to the target and are renamed into place,
//! so a crash never leaves a truncated file under the final name. Existing
//! files are never overwritten: [`unique_path`] picks `name (1).ext`,
//! `name (2).ext`, and so on.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::error;

/// Atomically write `content` to `path` via a temporary file and rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".part");
    let tmp_path = path.with_file_name(tmp_name);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "save_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "save_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

/// First free path for `name` inside `dir`.
pub fn unique_path(dir: &Path, name: &Path) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let ext = name.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| {
            let file = match &ext {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            dir.join(file)
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Reduce an untrusted file name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> PathBuf {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .last()
        .unwrap_or("");
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_start_matches('.').trim();
    if safe.is_empty() {
        PathBuf::from("file")
    } else {
        PathBuf::from(safe)
    }
}
