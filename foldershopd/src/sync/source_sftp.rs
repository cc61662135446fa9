use std::fs;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};

use ssh2::{Session, Sftp};

use super::source::{EntryKind, FileEntry, FileSource, SourceConfig, SourceError, join_path};

pub struct SftpSource {
    // Keeps the SSH transport alive for `sftp`.
    _session: Session,
    sftp: Sftp,
}

impl SftpSource {
    pub fn connect(config: &SourceConfig) -> Result<Self, SourceError> {
        let connect_err = |reason: String| SourceError::Connect {
            address: config.address(),
            reason,
        };

        let address = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|err| connect_err(err.to_string()))?
            .next()
            .ok_or_else(|| connect_err("host did not resolve".into()))?;
        let tcp = TcpStream::connect_timeout(&address, config.timeout)
            .map_err(|err| connect_err(err.to_string()))?;

        let mut session = Session::new().map_err(|err| connect_err(err.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(config.timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|err| connect_err(err.to_string()))?;

        let auth = match (&config.private_key, &config.password) {
            (Some(key), passphrase) => {
                let public = public_key_for(key);
                session.userauth_pubkey_file(
                    &config.username,
                    public.as_deref(),
                    key,
                    passphrase.as_deref(),
                )
            }
            (None, Some(password)) => session.userauth_password(&config.username, password),
            (None, None) => return Err(SourceError::Auth(config.username.clone())),
        };
        if auth.is_err() || !session.authenticated() {
            return Err(SourceError::Auth(config.username.clone()));
        }

        let sftp = session.sftp().map_err(|err| connect_err(err.to_string()))?;
        tracing::debug!("connected to sftp://{}", config.address());
        Ok(Self {
            _session: session,
            sftp,
        })
    }
}

fn public_key_for(private_key: &Path) -> Option<PathBuf> {
    let mut public = private_key.as_os_str().to_owned();
    public.push(".pub");
    let public = PathBuf::from(public);
    public.exists().then_some(public)
}

impl FileSource for SftpSource {
    fn list(&mut self, path: &str) -> Result<Vec<FileEntry>, SourceError> {
        let listing = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|err| SourceError::List {
                path: path.to_string(),
                reason: err.to_string(),
            })?;

        let mut entries: Vec<FileEntry> = listing
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_str()?.to_string();
                if name == "." || name == ".." {
                    return None;
                }
                let kind = if stat.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                };
                Some(FileEntry {
                    path: join_path(path, &name),
                    name,
                    kind,
                    size: if kind == EntryKind::File { stat.size } else { None },
                    modified: stat.mtime.and_then(|mtime| i64::try_from(mtime).ok()),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn is_dir(&mut self, path: &str) -> bool {
        self.sftp
            .stat(Path::new(path))
            .map(|stat| stat.is_dir())
            .unwrap_or(false)
    }

    fn download(&mut self, path: &str, target: &Path) -> Result<u64, SourceError> {
        let mut remote = self
            .sftp
            .open(Path::new(path))
            .map_err(|err| SourceError::Download {
                path: path.to_string(),
                reason: err.to_string(),
            })?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(target)?;
        let copied = io::copy(&mut remote, &mut file)?;
        file.sync_all()?;
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_used_only_when_present() {
        let temp = tempfile::tempdir().unwrap();
        let key = temp.path().join("id_ed25519");
        fs::write(&key, b"private").unwrap();
        assert_eq!(public_key_for(&key), None);

        fs::write(temp.path().join("id_ed25519.pub"), b"public").unwrap();
        assert_eq!(
            public_key_for(&key),
            Some(temp.path().join("id_ed25519.pub"))
        );
    }
}
