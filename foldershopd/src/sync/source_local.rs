use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use super::source::{EntryKind, FileEntry, FileSource, SourceError, join_path};

/// Reads folders from the local filesystem (or a mounted share).
#[derive(Debug, Default)]
pub struct LocalSource;

impl FileSource for LocalSource {
    fn list(&mut self, path: &str) -> Result<Vec<FileEntry>, SourceError> {
        let reader = fs::read_dir(path).map_err(|err| SourceError::List {
            path: path.to_string(),
            reason: err.to_string(),
        })?;

        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!("skipping non UTF-8 entry in {path}");
                continue;
            };
            if name == "." || name == ".." {
                continue;
            }
            // Follows symlinks so linked folders on mounted shares count as dirs.
            let metadata = match fs::metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!("skipping unreadable entry {name} in {path}: {err}");
                    continue;
                }
            };
            let modified = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .and_then(|age| i64::try_from(age.as_secs()).ok());
            let kind = if metadata.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(FileEntry {
                path: join_path(path, &name),
                name,
                kind,
                size: (kind == EntryKind::File).then_some(metadata.len()),
                modified,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn is_dir(&mut self, path: &str) -> bool {
        Path::new(path).is_dir()
    }

    fn download(&mut self, path: &str, target: &Path) -> Result<u64, SourceError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, target).map_err(|err| SourceError::Download {
            path: path.to_string(),
            reason: err.to_string(),
        })
    }
}
