use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use super::source_ftp::FtpSource;
use super::source_local::LocalSource;
use super::source_sftp::SftpSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source configuration error: {0}")]
    Config(String),
    #[error("cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("authentication failed for {0}")]
    Auth(String),
    #[error("cannot list {path}: {reason}")]
    List { path: String, reason: String },
    #[error("cannot download {path}: {reason}")]
    Download { path: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub modified: Option<i64>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// Blocking file-source transport. One connection per value; callers go
/// through [`SourceHandle`] to keep the blocking I/O off the runtime.
pub trait FileSource: Send {
    /// Entries of `path`, excluding `.` and `..`.
    fn list(&mut self, path: &str) -> Result<Vec<FileEntry>, SourceError>;

    fn is_dir(&mut self, path: &str) -> bool;

    /// Copies `path` to the local `target`, returning the byte count.
    fn download(&mut self, path: &str, target: &Path) -> Result<u64, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Ftp,
    Sftp,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Local => "local",
            SourceKind::Ftp => "ftp",
            SourceKind::Sftp => "sftp",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            SourceKind::Local => 0,
            SourceKind::Ftp => 21,
            SourceKind::Sftp => 22,
        }
    }
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "file" => Ok(SourceKind::Local),
            "ftp" => Ok(SourceKind::Ftp),
            "sftp" | "ssh" => Ok(SourceKind::Sftp),
            other => Err(SourceError::Config(format!("unknown source kind: {other}"))),
        }
    }
}

#[derive(Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub timeout: Duration,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

impl SourceConfig {
    pub fn local() -> Self {
        Self {
            kind: SourceKind::Local,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: None,
            private_key: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        if self.kind == SourceKind::Local {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(SourceError::Config("host is required".into()));
        }
        if self.username.trim().is_empty() {
            return Err(SourceError::Config("username is required".into()));
        }
        let has_key = self.kind == SourceKind::Sftp && self.private_key.is_some();
        if self.password.is_none() && !has_key {
            return Err(SourceError::Config(format!(
                "{} needs a password{}",
                self.kind.as_str(),
                if self.kind == SourceKind::Sftp {
                    " or private key"
                } else {
                    ""
                }
            )));
        }
        Ok(())
    }

    /// Opens a blocking connection for this configuration.
    pub fn connect(&self) -> Result<Box<dyn FileSource>, SourceError> {
        self.validate()?;
        Ok(match self.kind {
            SourceKind::Local => Box::new(LocalSource),
            SourceKind::Ftp => Box::new(FtpSource::connect(self)?),
            SourceKind::Sftp => Box::new(SftpSource::connect(self)?),
        })
    }
}

/// Joins a remote directory and a child name with `/`.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Async front for a [`FileSource`]: every call runs on the blocking pool and
/// calls are serialized over the single underlying connection.
#[derive(Clone)]
pub struct SourceHandle {
    inner: Arc<Mutex<Box<dyn FileSource>>>,
}

impl SourceHandle {
    pub fn new(source: Box<dyn FileSource>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(source)),
        }
    }

    pub async fn connect(config: SourceConfig) -> Result<Self, SourceError> {
        let source = tokio::task::spawn_blocking(move || config.connect())
            .await
            .map_err(|err| SourceError::Worker(err.to_string()))??;
        Ok(Self::new(source))
    }

    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>, SourceError> {
        let path = path.to_string();
        self.run(move |source| source.list(&path)).await
    }

    pub async fn is_dir(&self, path: &str) -> bool {
        let path = path.to_string();
        self.run(move |source| Ok(source.is_dir(&path)))
            .await
            .unwrap_or(false)
    }

    pub async fn download(&self, path: &str, target: &Path) -> Result<u64, SourceError> {
        let path = path.to_string();
        let target = target.to_path_buf();
        self.run(move |source| source.download(&path, &target)).await
    }

    async fn run<T, F>(&self, op: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn FileSource) -> Result<T, SourceError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut source = inner
                .lock()
                .map_err(|_| SourceError::Worker("source connection poisoned".into()))?;
            op(&mut **source)
        })
        .await
        .map_err(|err| SourceError::Worker(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(kind: SourceKind) -> SourceConfig {
        SourceConfig {
            kind,
            host: "files.example".into(),
            port: kind.default_port(),
            username: "shop".into(),
            password: None,
            private_key: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn parses_source_kind() {
        assert_eq!("FTP".parse::<SourceKind>().unwrap(), SourceKind::Ftp);
        assert_eq!("sftp".parse::<SourceKind>().unwrap(), SourceKind::Sftp);
        assert_eq!("local".parse::<SourceKind>().unwrap(), SourceKind::Local);
        assert!("smb".parse::<SourceKind>().is_err());
    }

    #[test]
    fn remote_sources_need_credentials() {
        assert!(matches!(
            remote(SourceKind::Ftp).validate(),
            Err(SourceError::Config(_))
        ));

        let mut sftp = remote(SourceKind::Sftp);
        sftp.private_key = Some(PathBuf::from("/keys/id_ed25519"));
        assert!(sftp.validate().is_ok());

        let mut ftp = remote(SourceKind::Ftp);
        ftp.private_key = Some(PathBuf::from("/keys/id_ed25519"));
        assert!(ftp.validate().is_err());
        ftp.password = Some("secret".into());
        assert!(ftp.validate().is_ok());

        assert!(SourceConfig::local().validate().is_ok());
    }

    #[test]
    fn debug_hides_password() {
        let mut config = remote(SourceKind::Ftp);
        config.password = Some("hunter2".into());
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn join_path_handles_trailing_slash() {
        assert_eq!(join_path("/user_folders/", "alice"), "/user_folders/alice");
        assert_eq!(join_path("/user_folders", "alice"), "/user_folders/alice");
        assert_eq!(join_path("", "alice"), "alice");
    }

    #[tokio::test]
    async fn handle_runs_local_source() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("alice")).unwrap();
        std::fs::write(temp.path().join("alice/a.txt"), b"hello").unwrap();

        let handle = SourceHandle::connect(SourceConfig::local()).await.unwrap();
        let base = temp.path().to_str().unwrap();

        assert!(handle.is_dir(base).await);
        let entries = handle.list(&join_path(base, "alice")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");

        let target = temp.path().join("copy.txt");
        let bytes = handle.download(&entries[0].path, &target).await.unwrap();
        assert_eq!(bytes, 5);
    }
}
