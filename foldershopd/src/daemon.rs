use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use foldershop_core::{ProductStatus, StorefrontClient};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::storage::{CredentialError, CredentialStorage};
use crate::sync::activity::ActivityLog;
use crate::sync::engine::{ExistingFilePolicy, ScanEngine, ScanOutcome, ScanSettings, ScanStatus};
use crate::sync::lease::unix_now;
use crate::sync::materializer::ProductDefaults;
use crate::sync::postprocess::{PostProcessPipeline, VideoWatermark, WatermarkPosition};
use crate::sync::preview::PreviewSettings;
use crate::sync::registry::{LogEntry, RegistryStore};
use crate::sync::source::{SourceConfig, SourceKind};
use crate::webhook;

const DEFAULT_BASE_PATH: &str = "/user_folders";
const DEFAULT_PRICE: f64 = 9.99;
const DEFAULT_SCAN_INTERVAL_MINS: u64 = 60;
const DEFAULT_MAX_SCAN_SECS: u64 = 300;
const DEFAULT_LOCK_TTL_SECS: u64 = 600;
const DEFAULT_FILE_LOCK_TTL_SECS: u64 = 600;
const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WATERMARK_SIZE: u64 = 15;
const DEFAULT_PREVIEW_FIELD: &str = "preview_file";
const DEFAULT_WEBHOOK_ADDR: &str = "127.0.0.1:8089";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("home directory is unavailable")]
    NoHome,
}

#[derive(Clone)]
pub struct StorefrontConfig {
    pub url: String,
    pub user: String,
    pub app_password: String,
}

impl std::fmt::Debug for StorefrontConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorefrontConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("app_password", &"***")
            .finish()
    }
}

#[derive(Clone)]
pub struct WebhookConfig {
    pub addr: SocketAddr,
    pub secret: String,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("addr", &self.addr)
            .field("secret", &"***")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub source: SourceConfig,
    pub storefront: StorefrontConfig,
    pub defaults: ProductDefaults,
    pub scan: ScanSettings,
    pub scan_interval: Duration,
    /// `None` uses the per-user data directory.
    pub db_path: Option<PathBuf>,
    pub watermark: Option<VideoWatermark>,
    pub webhook: Option<WebhookConfig>,
    pub log_enabled: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok()).context("invalid configuration")
    }

    /// Builds the configuration from any variable lookup. Fails before
    /// anything touches the source or the storefront.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = dirs::home_dir();
        let home = home.as_deref();

        let kind = match non_empty(&lookup, "FOLDERSHOP_SOURCE") {
            Some(value) => SourceKind::from_str(&value).map_err(|_| ConfigError::Invalid {
                name: "FOLDERSHOP_SOURCE",
                value,
            })?,
            None => SourceKind::Local,
        };
        let base_path = match lookup("FOLDERSHOP_BASE_PATH") {
            None => DEFAULT_BASE_PATH.to_string(),
            Some(value) if value.trim().is_empty() => {
                return Err(ConfigError::Missing("FOLDERSHOP_BASE_PATH"));
            }
            Some(value) => value.trim().to_string(),
        };

        let host = non_empty(&lookup, "FOLDERSHOP_HOST").unwrap_or_default();
        let username = non_empty(&lookup, "FOLDERSHOP_USERNAME").unwrap_or_default();
        if kind != SourceKind::Local {
            if host.is_empty() {
                return Err(ConfigError::Missing("FOLDERSHOP_HOST"));
            }
            if username.is_empty() {
                return Err(ConfigError::Missing("FOLDERSHOP_USERNAME"));
            }
        }
        let port = read_u64(&lookup, "FOLDERSHOP_PORT", u64::from(kind.default_port()));
        let port = u16::try_from(port).map_err(|_| ConfigError::Invalid {
            name: "FOLDERSHOP_PORT",
            value: port.to_string(),
        })?;
        let source = SourceConfig {
            kind,
            host,
            port,
            username,
            password: lookup("FOLDERSHOP_PASSWORD").filter(|value| !value.is_empty()),
            private_key: read_path(&lookup, "FOLDERSHOP_PRIVATE_KEY", home)?,
            timeout: Duration::from_secs(read_u64(
                &lookup,
                "FOLDERSHOP_TIMEOUT_SECS",
                DEFAULT_SOURCE_TIMEOUT_SECS,
            )),
        };

        let storefront = StorefrontConfig {
            url: required(&lookup, "FOLDERSHOP_STOREFRONT_URL")?,
            user: required(&lookup, "FOLDERSHOP_STOREFRONT_USER")?,
            app_password: required(&lookup, "FOLDERSHOP_STOREFRONT_APP_PASSWORD")?,
        };

        let price = match non_empty(&lookup, "FOLDERSHOP_DEFAULT_PRICE") {
            Some(value) => match value.parse::<f64>() {
                Ok(price) if price.is_finite() && price >= 0.0 => price,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "FOLDERSHOP_DEFAULT_PRICE",
                        value,
                    });
                }
            },
            None => DEFAULT_PRICE,
        };
        let status = match non_empty(&lookup, "FOLDERSHOP_PRODUCT_STATUS") {
            Some(value) => ProductStatus::from_str(&value).map_err(|_| ConfigError::Invalid {
                name: "FOLDERSHOP_PRODUCT_STATUS",
                value,
            })?,
            None => ProductStatus::Draft,
        };
        let policy = match non_empty(&lookup, "FOLDERSHOP_POLICY") {
            Some(value) => {
                ExistingFilePolicy::parse(&value).ok_or(ConfigError::Invalid {
                    name: "FOLDERSHOP_POLICY",
                    value,
                })?
            }
            None => ExistingFilePolicy::default(),
        };

        let preview = non_empty(&lookup, "FOLDERSHOP_PREVIEW_PATH").map(|root| PreviewSettings {
            root,
            field: non_empty(&lookup, "FOLDERSHOP_PREVIEW_FIELD")
                .unwrap_or_else(|| DEFAULT_PREVIEW_FIELD.to_string()),
        });
        let scan = ScanSettings {
            base_path,
            remove_deleted: read_bool(&lookup, "FOLDERSHOP_REMOVE_DELETED", true),
            policy,
            lease_ttl: Duration::from_secs(read_u64(
                &lookup,
                "FOLDERSHOP_LOCK_TTL_SECS",
                DEFAULT_LOCK_TTL_SECS,
            )),
            file_lease_ttl: Duration::from_secs(read_u64(
                &lookup,
                "FOLDERSHOP_FILE_LOCK_TTL_SECS",
                DEFAULT_FILE_LOCK_TTL_SECS,
            )),
            max_duration: Duration::from_secs(read_u64(
                &lookup,
                "FOLDERSHOP_MAX_SCAN_SECS",
                DEFAULT_MAX_SCAN_SECS,
            )),
            staging_root: read_path(&lookup, "FOLDERSHOP_STAGING_DIR", home)?
                .unwrap_or_else(default_staging_root),
            preview,
        };

        let watermark = if read_bool(&lookup, "FOLDERSHOP_WATERMARK_ENABLED", false) {
            let image = read_path(&lookup, "FOLDERSHOP_WATERMARK_PATH", home)?
                .ok_or(ConfigError::Missing("FOLDERSHOP_WATERMARK_PATH"))?;
            let position = match non_empty(&lookup, "FOLDERSHOP_WATERMARK_POSITION") {
                Some(value) => {
                    WatermarkPosition::from_str(&value).map_err(|_| ConfigError::Invalid {
                        name: "FOLDERSHOP_WATERMARK_POSITION",
                        value,
                    })?
                }
                None => WatermarkPosition::default(),
            };
            let size = read_u64(&lookup, "FOLDERSHOP_WATERMARK_SIZE", DEFAULT_WATERMARK_SIZE);
            Some(VideoWatermark {
                ffmpeg: non_empty(&lookup, "FOLDERSHOP_WATERMARK_FFMPEG")
                    .unwrap_or_else(|| "ffmpeg".to_string()),
                image,
                position,
                size_percent: size.min(100) as u32,
            })
        } else {
            None
        };

        let webhook = match non_empty(&lookup, "FOLDERSHOP_WEBHOOK_SECRET") {
            Some(secret) => {
                let addr = non_empty(&lookup, "FOLDERSHOP_WEBHOOK_ADDR")
                    .unwrap_or_else(|| DEFAULT_WEBHOOK_ADDR.to_string());
                let addr = addr.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
                    name: "FOLDERSHOP_WEBHOOK_ADDR",
                    value: addr.clone(),
                })?;
                Some(WebhookConfig { addr, secret })
            }
            None => None,
        };

        Ok(Self {
            source,
            storefront,
            defaults: ProductDefaults { price, status },
            scan,
            scan_interval: Duration::from_secs(
                read_u64(
                    &lookup,
                    "FOLDERSHOP_SCAN_INTERVAL_MINS",
                    DEFAULT_SCAN_INTERVAL_MINS,
                )
                .saturating_mul(60),
            ),
            db_path: read_path(&lookup, "FOLDERSHOP_DB", home)?,
            watermark,
            webhook,
            log_enabled: read_bool(&lookup, "FOLDERSHOP_LOG_ENABLED", true),
        })
    }

    /// Keyring account for the transport password; `None` for local sources.
    pub fn credential_account(&self) -> Option<String> {
        match self.source.kind {
            SourceKind::Local => None,
            _ => Some(account_name(&self.source.username, &self.source.host)),
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<ScanEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let registry = match &config.db_path {
            Some(path) => RegistryStore::open(path).await,
            None => RegistryStore::new_default().await,
        }
        .context("failed to initialize registry store")?;

        let staging_root = &config.scan.staging_root;
        tokio::fs::create_dir_all(staging_root)
            .await
            .with_context(|| format!("failed to create staging root at {staging_root:?}"))?;

        let source = with_stored_password(&config);
        let client = StorefrontClient::new(
            &config.storefront.url,
            config.storefront.user.as_str(),
            config.storefront.app_password.as_str(),
        )
        .context("invalid storefront configuration")?;
        let activity = ActivityLog::new(registry.clone(), config.log_enabled);
        let engine = ScanEngine::new(
            client,
            registry,
            source,
            config.defaults.clone(),
            build_pipeline(config.watermark.as_ref()),
            config.scan.clone(),
            activity,
        )
        .context("failed to build scan engine")?;

        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    pub fn engine(&self) -> &Arc<ScanEngine> {
        &self.engine
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            source = self.config.source.kind.as_str(),
            base_path = %self.config.scan.base_path,
            interval_mins = self.config.scan_interval.as_secs() / 60,
            policy = self.config.scan.policy.as_str(),
            "foldershopd started"
        );

        let webhook_handle = match &self.config.webhook {
            Some(webhook) => Some(spawn_webhook(Arc::clone(&self.engine), webhook).await?),
            None => None,
        };

        let mut ticker = tokio::time::interval(scheduler_tick(self.config.scan_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res.context("failed waiting for shutdown signal")?;
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_if_due().await;
                }
            }
        }

        if let Some(handle) = webhook_handle {
            handle.abort();
        }
        Ok(())
    }

    /// Starts a scan when the configured interval has passed since the last
    /// one began. Returns whether a scan was attempted.
    pub async fn run_if_due(&self) -> bool {
        let last = match self.engine.registry().last_scan_at().await {
            Ok(last) => last,
            Err(err) => {
                tracing::warn!("cannot read last scan time: {err}");
                return false;
            }
        };
        if !is_scan_due(last, unix_now(), self.config.scan_interval) {
            return false;
        }
        match self.engine.run_scan().await {
            Ok(outcome) => tracing::info!("{}", outcome.describe()),
            Err(err) => tracing::error!("scheduled scan failed: {err}"),
        }
        true
    }

    pub async fn scan_once(&self) -> anyhow::Result<ScanOutcome> {
        self.engine.run_scan().await.context("scan failed")
    }

    pub async fn reset_registry(&self) -> anyhow::Result<u64> {
        self.engine
            .reset_registry()
            .await
            .context("failed to reset registry")
    }

    pub async fn clear_scan_lock(&self) -> anyhow::Result<bool> {
        self.engine
            .clear_scan_lock()
            .await
            .context("failed to clear scan lock")
    }

    pub async fn activity_log(&self) -> anyhow::Result<Vec<LogEntry>> {
        self.engine
            .registry()
            .log_entries()
            .await
            .context("failed to read activity log")
    }

    pub async fn clear_activity_log(&self) -> anyhow::Result<u64> {
        self.engine
            .registry()
            .clear_log()
            .await
            .context("failed to clear activity log")
    }

    pub async fn status(&self) -> anyhow::Result<ScanStatus> {
        self.engine.status().await.context("failed to read status")
    }

    pub fn render_status(&self, status: &ScanStatus) -> String {
        render_status(status, self.config.scan_interval, unix_now())
    }
}

/// Fills in the transport password from the keyring when the environment
/// does not provide one. A missing entry is not fatal here; the source
/// reports it when it tries to connect.
fn with_stored_password(config: &DaemonConfig) -> SourceConfig {
    let mut source = config.source.clone();
    if source.password.is_some() {
        return source;
    }
    let Some(account) = config.credential_account() else {
        return source;
    };
    let stored = CredentialStorage::new(&account).and_then(|storage| storage.get_password());
    match stored {
        Ok(password) => source.password = Some(password),
        Err(CredentialError::NotFound) => {
            tracing::debug!("no stored password for {account}");
        }
        Err(err) => tracing::warn!("cannot read stored password for {account}: {err}"),
    }
    source
}

fn build_pipeline(watermark: Option<&VideoWatermark>) -> PostProcessPipeline {
    let pipeline = PostProcessPipeline::new();
    match watermark {
        Some(watermark) => pipeline.with(Box::new(watermark.clone())),
        None => pipeline,
    }
}

async fn spawn_webhook(
    engine: Arc<ScanEngine>,
    config: &WebhookConfig,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind webhook listener on {}", config.addr))?;
    let app = webhook::router(engine, &config.secret);
    tracing::info!("webhook listening on {}", config.addr);
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("webhook server stopped: {err}");
        }
    }))
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
