use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

pub const CMAKE_FILES_DIR: &str = "CMakeFiles";

pub const CONFIGURED_STAMP: &str = ".zephyr-runner-configured";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerPolicy {
    /// Any `CMakeFiles` directory counts, even one left by a failed run.
    CMakeFiles,
    /// Only a stamp written after a zero exit counts.
    #[default]
    Stamp,
}

pub async fn is_configured(build_dir: &Path, policy: MarkerPolicy) -> bool {
    match policy {
        MarkerPolicy::CMakeFiles => fs::metadata(build_dir.join(CMAKE_FILES_DIR))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false),
        MarkerPolicy::Stamp => fs::metadata(build_dir.join(CONFIGURED_STAMP))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false),
    }
}

pub async fn mark_configured(build_dir: &Path, policy: MarkerPolicy) -> io::Result<()> {
    match policy {
        MarkerPolicy::CMakeFiles => Ok(()),
        MarkerPolicy::Stamp => fs::write(build_dir.join(CONFIGURED_STAMP), b"configured\n").await,
    }
}

pub async fn clear_configured(build_dir: &Path, policy: MarkerPolicy) -> io::Result<()> {
    match policy {
        MarkerPolicy::CMakeFiles => Ok(()),
        MarkerPolicy::Stamp => match fs::remove_file(build_dir.join(CONFIGURED_STAMP)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

pub async fn resolve_executable(name: &str, search_paths: &[PathBuf]) -> PathBuf {
    let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);

    for dir in search_paths {
        let candidate = dir.join(&file_name);
        tracing::trace!("Checking tool candidate: {:?}", candidate);
        if is_executable(&candidate).await {
            tracing::debug!("Resolved {} to {:?}", name, candidate);
            return candidate;
        }
    }

    tracing::debug!("{} not found in {} search path(s), deferring to PATH", name, search_paths.len());
    PathBuf::from(name)
}

async fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path).await else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Canonical form of `path`, which need not exist yet: the deepest existing
/// ancestor is canonicalized and the rest is appended.
pub async fn canonicalize_lenient(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing).await {
            let mut resolved = canonical;
            for component in rest.iter().rev() {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        resolved.pop();
                    }
                    other => resolved.push(other),
                }
            }
            return resolved;
        }
        match (existing.parent(), existing.components().next_back()) {
            (Some(parent), Some(last)) => {
                rest.push(last);
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
