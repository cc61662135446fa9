use std::fs;
use std::io::{self, Read};
use std::path::Path;

use ftp::types::FileType;
use ftp::{FtpError, FtpStream};

use super::source::{EntryKind, FileEntry, FileSource, SourceConfig, SourceError, join_path};

pub struct FtpSource {
    stream: FtpStream,
}

impl FtpSource {
    pub fn connect(config: &SourceConfig) -> Result<Self, SourceError> {
        let mut stream = FtpStream::connect((config.host.as_str(), config.port)).map_err(|err| {
            SourceError::Connect {
                address: config.address(),
                reason: err.to_string(),
            }
        })?;
        let control = stream.get_ref();
        control
            .set_read_timeout(Some(config.timeout))
            .and_then(|()| control.set_write_timeout(Some(config.timeout)))
            .map_err(|err| SourceError::Connect {
                address: config.address(),
                reason: err.to_string(),
            })?;
        let password = config.password.as_deref().unwrap_or_default();
        stream
            .login(&config.username, password)
            .map_err(|err| match err {
                FtpError::InvalidResponse(_) => SourceError::Auth(config.username.clone()),
                other => SourceError::Connect {
                    address: config.address(),
                    reason: other.to_string(),
                },
            })?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|err| SourceError::Connect {
                address: config.address(),
                reason: err.to_string(),
            })?;
        tracing::debug!("connected to ftp://{}", config.address());
        Ok(Self { stream })
    }

    /// Probes a path by changing into it and back.
    fn probe_dir(&mut self, path: &str) -> bool {
        let Ok(previous) = self.stream.pwd() else {
            return false;
        };
        if self.stream.cwd(path).is_err() {
            return false;
        }
        if let Err(err) = self.stream.cwd(&previous) {
            tracing::warn!("ftp: failed to restore working directory {previous}: {err}");
        }
        true
    }
}

/// NLST may answer with bare names or with the listed path prefixed.
fn entry_name(raw: &str) -> Option<&str> {
    let name = raw.trim_end_matches('/').rsplit('/').next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name)
}

impl FileSource for FtpSource {
    fn list(&mut self, path: &str) -> Result<Vec<FileEntry>, SourceError> {
        let raw = self.stream.nlst(Some(path)).map_err(|err| SourceError::List {
            path: path.to_string(),
            reason: err.to_string(),
        })?;

        let mut entries = Vec::with_capacity(raw.len());
        for line in &raw {
            let Some(name) = entry_name(line) else {
                continue;
            };
            let full = join_path(path, name);
            if self.probe_dir(&full) {
                entries.push(FileEntry {
                    name: name.to_string(),
                    path: full,
                    kind: EntryKind::Dir,
                    size: None,
                    modified: None,
                });
                continue;
            }
            let size = self
                .stream
                .size(&full)
                .ok()
                .flatten()
                .and_then(|size| u64::try_from(size).ok());
            let modified = self
                .stream
                .mdtm(&full)
                .ok()
                .flatten()
                .map(|stamp| stamp.timestamp());
            entries.push(FileEntry {
                name: name.to_string(),
                path: full,
                kind: EntryKind::File,
                size,
                modified,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn is_dir(&mut self, path: &str) -> bool {
        self.probe_dir(path)
    }

    fn download(&mut self, path: &str, target: &Path) -> Result<u64, SourceError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        self.stream
            .retr(path, |reader| {
                write_download(reader, target).map_err(FtpError::ConnectionError)
            })
            .map_err(|err| SourceError::Download {
                path: path.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Streams a transfer to `target` without buffering it in memory.
fn write_download(reader: &mut dyn Read, target: &Path) -> io::Result<u64> {
    let mut file = fs::File::create(target)?;
    let written = io::copy(reader, &mut file)?;
    file.sync_all()?;
    Ok(written)
}

impl Drop for FtpSource {
    fn drop(&mut self) {
        let _ = self.stream.quit();
    }
}
