use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

const SCAN_DIR_PREFIX: &str = "scan-";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("staged path is empty")]
    Empty,
    #[error("staged path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps a source-relative path (`"alice/photo.jpg"`) under `root`.
pub fn staged_path_for(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if out == root {
        return Err(PathError::Empty);
    }
    Ok(out)
}

/// Per-scan scratch directory named after the scan's lease holder. Removed
/// when the scan finishes or times out; leftovers from crashed scans are
/// removed by [`sweep_stale`].
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub async fn create(staging_root: &Path, scan_id: &str) -> std::io::Result<Self> {
        let staging = Self::for_scan(staging_root, scan_id);
        tokio::fs::create_dir_all(&staging.path).await?;
        Ok(staging)
    }

    /// Handle on a scan's directory without touching the filesystem.
    pub fn for_scan(staging_root: &Path, scan_id: &str) -> Self {
        Self {
            path: staging_root.join(format!("{SCAN_DIR_PREFIX}{scan_id}")),
        }
    }

    /// Target for a file of `folder`, with parent directories created.
    pub async fn file_path(&self, folder: &str, file_name: &str) -> Result<PathBuf, StagingError> {
        let target = staged_path_for(&self.path, &format!("{folder}/{file_name}"))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(target)
    }

    pub async fn remove(self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Deletes scan directories left behind by earlier runs. Directories of
/// holders in `live` belong to scans still in progress and are kept.
pub async fn sweep_stale(
    staging_root: &Path,
    live: &BTreeSet<String>,
) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(staging_root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(holder) = name
            .to_str()
            .and_then(|name| name.strip_prefix(SCAN_DIR_PREFIX))
        else {
            continue;
        };
        if live.contains(holder) {
            tracing::debug!("keeping staging directory of running scan {holder}");
            continue;
        }
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
