use super::*;
use crate::sync::engine::ScanPhase;
use crate::sync::lease::SCAN_LEASE;
use crate::sync::registry::LeaseRecord;
use std::collections::HashMap;
use tempfile::tempdir;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

const STOREFRONT: [(&str, &str); 3] = [
    ("FOLDERSHOP_STOREFRONT_URL", "https://shop.example"),
    ("FOLDERSHOP_STOREFRONT_USER", "admin"),
    ("FOLDERSHOP_STOREFRONT_APP_PASSWORD", "abcd efgh"),
];

fn with_storefront(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
    let mut pairs = STOREFRONT.to_vec();
    pairs.extend_from_slice(extra);
    pairs
}

#[test]
fn expands_tilde_to_home() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/keys/id_ed25519", &home),
        PathBuf::from("/tmp/home-user/keys/id_ed25519")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/srv/files", &home), PathBuf::from("/srv/files"));
}

#[test]
fn defaults_apply_for_local_source() {
    let config = DaemonConfig::from_lookup(lookup_from(&STOREFRONT)).unwrap();
    assert_eq!(config.source.kind, SourceKind::Local);
    assert_eq!(config.scan.base_path, "/user_folders");
    assert!(config.scan.remove_deleted);
    assert_eq!(config.scan.policy, ExistingFilePolicy::CreateOnce);
    assert_eq!(config.scan.max_duration, Duration::from_secs(300));
    assert_eq!(config.scan.lease_ttl, Duration::from_secs(600));
    assert_eq!(config.scan_interval, Duration::from_secs(3600));
    assert_eq!(config.defaults.price_string(), "9.99");
    assert_eq!(config.defaults.status, ProductStatus::Draft);
    assert!(config.watermark.is_none());
    assert!(config.webhook.is_none());
    assert!(config.scan.preview.is_none());
    assert!(config.log_enabled);
    assert_eq!(config.credential_account(), None);
}

#[test]
fn storefront_credentials_are_required() {
    let err = DaemonConfig::from_lookup(lookup_from(&[(
        "FOLDERSHOP_STOREFRONT_URL",
        "https://shop.example",
    )]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Missing("FOLDERSHOP_STOREFRONT_USER")));
}

#[test]
fn blank_base_path_is_rejected() {
    let err = DaemonConfig::from_lookup(lookup_from(&with_storefront(&[(
        "FOLDERSHOP_BASE_PATH",
        "  ",
    )])))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Missing("FOLDERSHOP_BASE_PATH")));
}

#[test]
fn remote_source_needs_host_and_username() {
    let err = DaemonConfig::from_lookup(lookup_from(&with_storefront(&[(
        "FOLDERSHOP_SOURCE",
        "sftp",
    )])))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Missing("FOLDERSHOP_HOST")));

    let config = DaemonConfig::from_lookup(lookup_from(&with_storefront(&[
        ("FOLDERSHOP_SOURCE", "sftp"),
        ("FOLDERSHOP_HOST", "files.example"),
        ("FOLDERSHOP_USERNAME", "deploy"),
    ])))
    .unwrap();
    assert_eq!(config.source.port, 22);
    assert_eq!(config.source.password, None);
    assert_eq!(
        config.credential_account().as_deref(),
        Some("deploy@files.example")
    );
}

#[test]
fn parses_overrides() {
    let config = DaemonConfig::from_lookup(lookup_from(&with_storefront(&[
        ("FOLDERSHOP_SOURCE", "ftp"),
        ("FOLDERSHOP_HOST", "ftp.example"),
        ("FOLDERSHOP_PORT", "2121"),
        ("FOLDERSHOP_USERNAME", "shop"),
        ("FOLDERSHOP_PASSWORD", "secret"),
        ("FOLDERSHOP_DEFAULT_PRICE", "4.5"),
        ("FOLDERSHOP_PRODUCT_STATUS", "publish"),
        ("FOLDERSHOP_REMOVE_DELETED", "no"),
        ("FOLDERSHOP_POLICY", "create_or_update"),
        ("FOLDERSHOP_SCAN_INTERVAL_MINS", "15"),
        ("FOLDERSHOP_PREVIEW_PATH", "/previews"),
        ("FOLDERSHOP_WEBHOOK_SECRET", "s3cret"),
        ("FOLDERSHOP_WEBHOOK_ADDR", "0.0.0.0:9000"),
        ("FOLDERSHOP_LOG_ENABLED", "off"),
    ])))
    .unwrap();

    assert_eq!(config.source.kind, SourceKind::Ftp);
    assert_eq!(config.source.port, 2121);
    assert_eq!(config.source.password.as_deref(), Some("secret"));
    assert_eq!(config.defaults.price_string(), "4.50");
    assert_eq!(config.defaults.status, ProductStatus::Publish);
    assert!(!config.scan.remove_deleted);
    assert_eq!(config.scan.policy, ExistingFilePolicy::CreateOrUpdate);
    assert_eq!(config.scan_interval, Duration::from_secs(900));
    let preview = config.scan.preview.unwrap();
    assert_eq!(preview.root, "/previews");
    assert_eq!(preview.field, "preview_file");
    let webhook = config.webhook.unwrap();
    assert_eq!(webhook.addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
    assert_eq!(webhook.secret, "s3cret");
    assert!(!config.log_enabled);
}

#[test]
fn invalid_values_are_reported_by_name() {
    for (name, value) in [
        ("FOLDERSHOP_SOURCE", "gopher"),
        ("FOLDERSHOP_DEFAULT_PRICE", "-1"),
        ("FOLDERSHOP_PRODUCT_STATUS", "archived"),
        ("FOLDERSHOP_POLICY", "sometimes"),
        ("FOLDERSHOP_PORT", "70000"),
    ] {
        let err = DaemonConfig::from_lookup(lookup_from(&with_storefront(&[(name, value)])))
            .unwrap_err();
        match err {
            ConfigError::Invalid { name: reported, .. } => assert_eq!(reported, name),
            other => panic!("unexpected error for {name}: {other}"),
        }
    }
}

#[test]
fn watermark_requires_image_path() {
    let err = DaemonConfig::from_lookup(lookup_from(&with_storefront(&[(
        "FOLDERSHOP_WATERMARK_ENABLED",
        "true",
    )])))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Missing("FOLDERSHOP_WATERMARK_PATH")));

    let config = DaemonConfig::from_lookup(lookup_from(&with_storefront(&[
        ("FOLDERSHOP_WATERMARK_ENABLED", "1"),
        ("FOLDERSHOP_WATERMARK_PATH", "/srv/logo.png"),
        ("FOLDERSHOP_WATERMARK_POSITION", "top-left"),
        ("FOLDERSHOP_WATERMARK_SIZE", "250"),
    ])))
    .unwrap();
    let watermark = config.watermark.unwrap();
    assert_eq!(watermark.image, PathBuf::from("/srv/logo.png"));
    assert_eq!(watermark.position, WatermarkPosition::TopLeft);
    assert_eq!(watermark.size_percent, 100);
    assert_eq!(watermark.ffmpeg, "ffmpeg");
}

#[test]
fn interval_readers_ignore_zero_and_garbage() {
    let lookup = lookup_from(&[("A", "0"), ("B", "abc"), ("C", "7")]);
    assert_eq!(read_u64(&lookup, "A", 42), 42);
    assert_eq!(read_u64(&lookup, "B", 42), 42);
    assert_eq!(read_u64(&lookup, "C", 42), 7);
    assert_eq!(read_u64(&lookup, "MISSING", 42), 42);
    assert!(read_bool(&lookup, "MISSING", true));
}

#[test]
fn scan_due_after_interval() {
    let hour = Duration::from_secs(3600);
    assert!(is_scan_due(None, 1_000, hour));
    assert!(!is_scan_due(Some(1_000), 1_000 + 3599, hour));
    assert!(is_scan_due(Some(1_000), 1_000 + 3600, hour));
}

#[test]
fn scheduler_checks_at_least_every_minute() {
    assert_eq!(scheduler_tick(Duration::from_secs(3600)), Duration::from_secs(60));
    assert_eq!(scheduler_tick(Duration::from_secs(5)), Duration::from_secs(5));
    assert_eq!(scheduler_tick(Duration::ZERO), Duration::from_secs(1));
}

#[test]
fn formats_timestamps_as_rfc3339() {
    assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
    assert_eq!(
        render_log_entry(&LogEntry {
            id: 1,
            logged_at: 86_400,
            message: "Scan completed. Created: 2, Skipped: 0".into(),
        }),
        "1970-01-02T00:00:00Z  Scan completed. Created: 2, Skipped: 0"
    );
}

#[test]
fn status_mentions_lock_holder_and_next_run() {
    let status = ScanStatus {
        phase: ScanPhase::Idle,
        last_scan_at: Some(0),
        processed_files: 3,
        lock: Some(LeaseRecord {
            name: SCAN_LEASE.into(),
            holder: "host-1".into(),
            acquired_at: 0,
            expires_at: 600,
        }),
    };
    let rendered = render_status(&status, Duration::from_secs(3600), 10);
    assert!(rendered.contains("phase: idle"));
    assert!(rendered.contains("next scan: 1970-01-01T01:00:00Z"));
    assert!(rendered.contains("processed files: 3"));
    assert!(rendered.contains("held by host-1"));

    let rendered = render_status(&status, Duration::from_secs(3600), 7200);
    assert!(rendered.contains("next scan: due"));
    assert!(rendered.contains("scan lock: expired"));
}

async fn local_runtime(base_path: &Path, db: &Path, staging: &Path) -> DaemonRuntime {
    let base = base_path.to_string_lossy().into_owned();
    let db = db.to_string_lossy().into_owned();
    let staging = staging.to_string_lossy().into_owned();
    let config = DaemonConfig::from_lookup(move |name| match name {
        "FOLDERSHOP_BASE_PATH" => Some(base.clone()),
        "FOLDERSHOP_DB" => Some(db.clone()),
        "FOLDERSHOP_STAGING_DIR" => Some(staging.clone()),
        "FOLDERSHOP_STOREFRONT_URL" => Some("http://127.0.0.1:9".into()),
        "FOLDERSHOP_STOREFRONT_USER" => Some("admin".into()),
        "FOLDERSHOP_STOREFRONT_APP_PASSWORD" => Some("pass".into()),
        _ => None,
    })
    .unwrap();
    DaemonRuntime::bootstrap(config).await.unwrap()
}

#[tokio::test]
async fn bootstrap_leaves_existing_staging_dirs_alone() {
    let temp = tempdir().unwrap();
    let staging = temp.path().join("staging");
    std::fs::create_dir_all(staging.join("scan-running/alice")).unwrap();

    let _runtime = local_runtime(
        &temp.path().join("missing"),
        &temp.path().join("registry.db"),
        &staging,
    )
    .await;

    assert!(staging.join("scan-running/alice").exists());
}

#[tokio::test]
async fn scheduler_waits_for_interval_after_a_failed_scan() {
    let temp = tempdir().unwrap();
    let runtime = local_runtime(
        &temp.path().join("missing"),
        &temp.path().join("registry.db"),
        &temp.path().join("staging"),
    )
    .await;

    assert!(runtime.run_if_due().await);
    assert!(!runtime.run_if_due().await);

    let status = runtime.status().await.unwrap();
    assert!(status.last_scan_at.is_some());
    assert!(status.lock.is_none());
    assert!(
        runtime
            .activity_log()
            .await
            .unwrap()
            .iter()
            .any(|entry| entry.message.starts_with("Scan aborted"))
    );
    assert!(runtime.clear_activity_log().await.unwrap() > 0);
    assert!(runtime.activity_log().await.unwrap().is_empty());
}
