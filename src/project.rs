use crate::core::Diagnostic;
use crate::detection::{self, MarkerPolicy};
use crate::error::RefreshError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

#[async_trait]
pub trait ProjectContext: Send + Sync {
    fn clear_diagnostics(&self, project: &Path);

    fn record_diagnostics(&self, project: &Path, diagnostics: Vec<Diagnostic>);

    fn diagnostics(&self, project: &Path) -> Vec<Diagnostic>;

    async fn refresh(&self, path: &Path, recursive: bool) -> Result<(), RefreshError>;

    async fn is_configured(&self, build_dir: &Path, policy: MarkerPolicy) -> bool {
        detection::is_configured(build_dir, policy).await
    }

    fn resolve_path(&self, base: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshSnapshot {
    pub files: usize,
    pub directories: usize,
    pub refreshed_at: u64,
}

#[derive(Default)]
pub struct FsProjectContext {
    diagnostics: RwLock<HashMap<PathBuf, Vec<Diagnostic>>>,
    snapshots: RwLock<HashMap<PathBuf, RefreshSnapshot>>,
}

impl FsProjectContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_refresh(&self, path: &Path) -> Option<RefreshSnapshot> {
        self.snapshots.read().get(path).copied()
    }
}

#[async_trait]
impl ProjectContext for FsProjectContext {
    fn clear_diagnostics(&self, project: &Path) {
        self.diagnostics.write().remove(project);
    }

    fn record_diagnostics(&self, project: &Path, diagnostics: Vec<Diagnostic>) {
        self.diagnostics
            .write()
            .insert(project.to_path_buf(), diagnostics);
    }

    fn diagnostics(&self, project: &Path) -> Vec<Diagnostic> {
        self.diagnostics
            .read()
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    async fn refresh(&self, path: &Path, recursive: bool) -> Result<(), RefreshError> {
        let root = path.to_path_buf();
        let walk_root = root.clone();
        let counts = tokio::task::spawn_blocking(move || scan(&walk_root, recursive))
            .await
            .map_err(|e| RefreshError {
                path: root.clone(),
                reason: e.to_string(),
            })??;

        let snapshot = RefreshSnapshot {
            files: counts.0,
            directories: counts.1,
            refreshed_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        tracing::debug!("Refreshed {:?}: {:?}", root, snapshot);
        self.snapshots.write().insert(root, snapshot);
        Ok(())
    }
}

fn scan(root: &Path, recursive: bool) -> Result<(usize, usize), RefreshError> {
    if !root.is_dir() {
        return Err(RefreshError {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut walker = WalkDir::new(root).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = 0;
    let mut directories = 0;
    for entry in walker {
        let entry = entry.map_err(|e| RefreshError {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if entry.file_type().is_dir() {
            directories += 1;
        } else {
            files += 1;
        }
    }
    Ok((files, directories))
}
