// Per-job registry of report artifacts (coverage XML, scan JSON).

use anyhow::{Context, Result};
use pipeline_sdk::IOUtil;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::definition::ArtifactDeclaration;

#[derive(Debug, Default)]
pub struct ArtifactStore {
    entries: BTreeMap<String, Vec<PathBuf>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a declaration against `base` and record the files found.
    /// Returns how many files matched; zero is not an error.
    pub fn register(&mut self, declaration: &ArtifactDeclaration, base: &Path) -> Result<usize> {
        let pattern = base.join(&declaration.path);
        let pattern = pattern.to_string_lossy();
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .with_context(|| format!("Invalid artifact path '{}'", declaration.path))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        let count = files.len();
        if count > 0 {
            self.entries.insert(declaration.name.clone(), files);
        }
        Ok(count)
    }

    pub fn resolve(&self, name: &str) -> Option<&[PathBuf]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// The first file registered under `name`.
    pub fn first(&self, name: &str) -> Option<&Path> {
        self.resolve(name)
            .and_then(|files| files.first())
            .map(PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every artifact into `destination`; returns the exported paths.
    pub fn export(&self, destination: &Path) -> Result<Vec<PathBuf>> {
        let mut exported = Vec::new();
        for files in self.entries.values() {
            for file in files {
                exported.push(IOUtil::copy_into(file, destination)?);
            }
        }
        Ok(exported)
    }
}
