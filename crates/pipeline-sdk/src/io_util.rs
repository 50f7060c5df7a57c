use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory names never copied into a job workspace snapshot.
pub const SNAPSHOT_EXCLUDES: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

/// File system helpers.
pub struct IOUtil;

impl IOUtil {
    /// Recursively copy `source` into `destination`, skipping any entry whose
    /// file name is listed in `excludes`. Symlinks are copied as the files
    /// they point to. Returns the number of files copied.
    pub fn copy_directory(source: &Path, destination: &Path, excludes: &[&str]) -> Result<u64> {
        anyhow::ensure!(
            source.is_dir(),
            "Source directory '{}' does not exist",
            source.display()
        );
        fs::create_dir_all(destination)
            .with_context(|| format!("Failed to create '{}'", destination.display()))?;

        let mut copied = 0u64;
        let walker = WalkDir::new(source)
            .follow_links(true)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !excludes.contains(&name))
                    .unwrap_or(true)
            });

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk '{}'", source.display()))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .with_context(|| format!("'{}' escaped the source tree", entry.path().display()))?;
            let target = destination.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create '{}'", target.display()))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target).with_context(|| {
                    format!(
                        "Failed to copy '{}' to '{}'",
                        entry.path().display(),
                        target.display()
                    )
                })?;
                copied += 1;
            }
        }

        Ok(copied)
    }

    /// Copy a single file into `directory`, keeping its file name.
    pub fn copy_into(file: &Path, directory: &Path) -> Result<PathBuf> {
        let name = file
            .file_name()
            .with_context(|| format!("'{}' has no file name", file.display()))?;
        fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create '{}'", directory.display()))?;
        let target = directory.join(name);
        fs::copy(file, &target).with_context(|| {
            format!("Failed to copy '{}' to '{}'", file.display(), target.display())
        })?;
        Ok(target)
    }

    /// Serialize a value as JSON and write it to a file.
    pub fn save_object<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, json.as_bytes())
            .with_context(|| format!("Failed to write object to '{}'", path.display()))?;
        Ok(())
    }
}
