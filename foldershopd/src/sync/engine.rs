use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use foldershop_core::StorefrontClient;
use serde::Serialize;
use thiserror::Error;

use super::activity::ActivityLog;
use super::lease::{self, Lease, LeaseAttempt, SCAN_LEASE, unix_now};
use super::materializer::{FileRequest, Materializer, ProductDefaults};
use super::naming;
use super::postprocess::PostProcessPipeline;
use super::preview::{PreviewPass, PreviewReport, PreviewSettings};
use super::reconciler::DeletionReconciler;
use super::registry::{LeaseRecord, ProcessedRecord, RegistryError, RegistryStore};
use super::source::{FileEntry, SourceConfig, SourceError, SourceHandle, join_path};
use super::owner::OwnerResolver;
use super::staging::{self, StagingDir, StagingError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("base path {0} is not a directory on the source")]
    BasePathMissing(String),
    #[error("staging error: {0}")]
    Staging(#[from] StagingError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("scan lock was taken over by another process")]
    LeaseLost,
    #[error("invalid owner pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// What to do with a file whose product key is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistingFilePolicy {
    #[default]
    CreateOnce,
    /// Re-upload the attachment when size or modification time changed.
    CreateOrUpdate,
}

impl ExistingFilePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExistingFilePolicy::CreateOnce => "create-once",
            ExistingFilePolicy::CreateOrUpdate => "create-or-update",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "create-once" => Some(ExistingFilePolicy::CreateOnce),
            "create-or-update" => Some(ExistingFilePolicy::CreateOrUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub base_path: String,
    pub remove_deleted: bool,
    pub policy: ExistingFilePolicy,
    pub lease_ttl: Duration,
    pub file_lease_ttl: Duration,
    pub max_duration: Duration,
    pub staging_root: PathBuf,
    pub preview: Option<PreviewSettings>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            base_path: "/user_folders".to_string(),
            remove_deleted: true,
            policy: ExistingFilePolicy::CreateOnce,
            lease_ttl: Duration::from_secs(600),
            file_lease_ttl: Duration::from_secs(600),
            max_duration: Duration::from_secs(300),
            staging_root: std::env::temp_dir().join("foldershop"),
            preview: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    Locked,
    Scanning,
    Reconciling,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Idle => "idle",
            ScanPhase::Locked => "locked",
            ScanPhase::Scanning => "scanning",
            ScanPhase::Reconciling => "reconciling",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub folders: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deleted: usize,
    /// Some folder could not be mapped or listed; deletions were not applied.
    pub incomplete: bool,
    pub previews: PreviewReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed(ScanSummary),
    AlreadyRunning { holder: String },
    TimedOut,
}

impl ScanOutcome {
    /// One-line summary for the CLI and the scheduler log.
    pub fn describe(&self) -> String {
        match self {
            ScanOutcome::Completed(summary) => format!(
                "scan completed: folders={}, created={}, updated={}, skipped={}, failed={}, deleted={}{}",
                summary.folders,
                summary.created,
                summary.updated,
                summary.skipped,
                summary.failed,
                summary.deleted,
                if summary.incomplete { " (incomplete)" } else { "" }
            ),
            ScanOutcome::AlreadyRunning { holder } => {
                format!("scan skipped: already running ({holder})")
            }
            ScanOutcome::TimedOut => "scan timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStatus {
    pub phase: ScanPhase,
    pub last_scan_at: Option<i64>,
    pub processed_files: u64,
    pub lock: Option<LeaseRecord>,
}

/// A top-level folder that resolved to a storefront user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFolder {
    pub name: String,
    pub path: String,
    pub owner_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Created,
    Updated,
    Skipped,
    Failed,
}

struct StagedFile {
    downloaded: PathBuf,
    upload: PathBuf,
}

pub struct ScanEngine {
    client: StorefrontClient,
    registry: RegistryStore,
    source: SourceConfig,
    owners: OwnerResolver,
    materializer: Materializer,
    pipeline: PostProcessPipeline,
    settings: ScanSettings,
    activity: ActivityLog,
    phase: Mutex<ScanPhase>,
}

impl ScanEngine {
    pub fn new(
        client: StorefrontClient,
        registry: RegistryStore,
        source: SourceConfig,
        defaults: ProductDefaults,
        pipeline: PostProcessPipeline,
        settings: ScanSettings,
        activity: ActivityLog,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            owners: OwnerResolver::new(client.clone())?,
            materializer: Materializer::new(client.clone(), defaults),
            client,
            registry,
            source,
            pipeline,
            settings,
            activity,
            phase: Mutex::new(ScanPhase::Idle),
        })
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    pub fn phase(&self) -> ScanPhase {
        *self
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: ScanPhase) {
        tracing::debug!("scan phase -> {}", phase.as_str());
        *self
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    /// True while an unexpired scan lock exists, held by any process.
    pub async fn is_scan_running(&self) -> Result<bool, EngineError> {
        let lock = self.registry.lease(SCAN_LEASE).await?;
        Ok(lock.is_some_and(|lock| !lock.is_expired(unix_now())))
    }

    pub async fn status(&self) -> Result<ScanStatus, EngineError> {
        Ok(ScanStatus {
            phase: self.phase(),
            last_scan_at: self.registry.last_scan_at().await?,
            processed_files: self.registry.count().await?,
            lock: self.registry.lease(SCAN_LEASE).await?,
        })
    }

    /// Forgets every processed file so the next scan reconsiders all of them.
    pub async fn reset_registry(&self) -> Result<u64, EngineError> {
        let removed = self.registry.reset().await?;
        self.activity
            .info(format!("Registry reset, {removed} entries removed"))
            .await;
        Ok(removed)
    }

    /// Drops the scan lock whoever holds it.
    pub async fn clear_scan_lock(&self) -> Result<bool, EngineError> {
        let cleared = self.registry.clear_lease(SCAN_LEASE).await?;
        if cleared {
            self.activity.info("Scan lock cleared manually").await;
        }
        Ok(cleared)
    }

    /// Runs one scan unless another one holds the lock. The whole scan is
    /// bounded by `max_duration`; its leases and staging directory are
    /// released on every exit path.
    pub async fn run_scan(&self) -> Result<ScanOutcome, EngineError> {
        let holder = lease::new_holder_id();
        let attempt =
            Lease::acquire(&self.registry, SCAN_LEASE, &holder, self.settings.lease_ttl).await?;
        let lease = match attempt {
            LeaseAttempt::Acquired(lease) => lease,
            LeaseAttempt::Reclaimed { lease, previous } => {
                self.activity
                    .warn(format!(
                        "Reclaimed expired scan lock held by {}",
                        previous.holder
                    ))
                    .await;
                lease
            }
            LeaseAttempt::Held(current) => {
                self.activity
                    .info("Scan already running. Skipping this execution.")
                    .await;
                return Ok(ScanOutcome::AlreadyRunning {
                    holder: current.holder,
                });
            }
        };

        self.set_phase(ScanPhase::Locked);
        self.sweep_staging().await;
        let result =
            tokio::time::timeout(self.settings.max_duration, self.scan_locked(&lease)).await;

        // A timed out scan never reaches its own cleanup; file leases share
        // the scan's holder so they go with it.
        let staging = StagingDir::for_scan(&self.settings.staging_root, &holder);
        if let Err(err) = staging.remove().await {
            tracing::warn!("failed to remove staging directory: {err}");
        }
        match self.registry.release_leases_held_by(&holder).await {
            Ok(released) => tracing::debug!("released {released} leases of scan {holder}"),
            Err(err) => tracing::warn!("failed to release scan leases: {err}"),
        }
        self.set_phase(ScanPhase::Idle);

        match result {
            Ok(Ok(summary)) => Ok(ScanOutcome::Completed(summary)),
            Ok(Err(err)) => {
                self.activity.warn(format!("Scan aborted: {err}")).await;
                Err(err)
            }
            Err(_) => {
                self.activity
                    .warn(format!(
                        "Scan stopped after exceeding {}s",
                        self.settings.max_duration.as_secs()
                    ))
                    .await;
                Ok(ScanOutcome::TimedOut)
            }
        }
    }

    async fn scan_locked(&self, lease: &Lease) -> Result<ScanSummary, EngineError> {
        self.registry.set_last_scan_at(unix_now()).await?;
        self.set_phase(ScanPhase::Scanning);

        let source = match SourceHandle::connect(self.source.clone()).await {
            Ok(source) => source,
            Err(err) => {
                self.activity
                    .warn(format!(
                        "Failed to connect to {} source: {err}",
                        self.source.kind.as_str()
                    ))
                    .await;
                return Err(err.into());
            }
        };

        let base = self.settings.base_path.as_str();
        if !source.is_dir(base).await {
            return Err(EngineError::BasePathMissing(base.to_string()));
        }
        self.activity
            .info(format!("Starting folder scan in {base}"))
            .await;

        let staging = StagingDir::create(&self.settings.staging_root, lease.holder()).await?;
        self.scan_with_staging(&source, &staging, lease).await
    }

    /// Removes staging directories of scans that no longer hold any lease.
    async fn sweep_staging(&self) {
        let live = match self.registry.live_lease_holders(unix_now()).await {
            Ok(live) => live,
            Err(err) => {
                tracing::warn!("cannot list lease holders, staging sweep skipped: {err}");
                return;
            }
        };
        match staging::sweep_stale(&self.settings.staging_root, &live).await {
            Ok(0) => {}
            Ok(count) => tracing::info!("removed {count} leftover staging directories"),
            Err(err) => tracing::warn!("failed to sweep staging root: {err}"),
        }
    }

    async fn scan_with_staging(
        &self,
        source: &SourceHandle,
        staging: &StagingDir,
        lease: &Lease,
    ) -> Result<ScanSummary, EngineError> {
        let mut summary = ScanSummary::default();
        let mut current = HashSet::new();

        let owners = self.map_owner_folders(source, &mut summary).await?;
        for owner in &owners {
            self.scan_owner_folder(source, staging, lease, owner, &mut summary, &mut current)
                .await;
            if !lease.renew().await? {
                return Err(EngineError::LeaseLost);
            }
        }

        if let Some(preview) = &self.settings.preview {
            let pass = PreviewPass {
                registry: &self.registry,
                materializer: &self.materializer,
                activity: &self.activity,
                settings: preview,
                source,
                staging,
            };
            summary.previews = pass.run(&owners).await;
        }

        self.set_phase(ScanPhase::Reconciling);
        if self.settings.remove_deleted {
            if summary.incomplete {
                self.activity
                    .warn("Source listing incomplete, deleted-file removal skipped")
                    .await;
            } else {
                let report = DeletionReconciler::new(&self.client, &self.registry)
                    .reconcile(&current)
                    .await?;
                summary.deleted = report.deleted;
                summary.failed += report.failed;
                if report.forgotten > 0 {
                    self.activity
                        .info(format!(
                            "Removed {} products for deleted files",
                            report.deleted
                        ))
                        .await;
                }
            }
        }

        self.activity
            .info(format!(
                "Scan completed. Created: {}, Skipped: {}",
                summary.created, summary.skipped
            ))
            .await;
        if summary.updated > 0 || summary.failed > 0 {
            self.activity
                .info(format!(
                    "Updated: {}, Failed: {}",
                    summary.updated, summary.failed
                ))
                .await;
        }
        Ok(summary)
    }

    /// Lists the base path and resolves each folder's owner. A failed base
    /// listing aborts the scan; a failed resolution only marks it incomplete.
    async fn map_owner_folders(
        &self,
        source: &SourceHandle,
        summary: &mut ScanSummary,
    ) -> Result<Vec<OwnerFolder>, EngineError> {
        let entries = source.list(&self.settings.base_path).await?;
        let mut owners = Vec::new();
        for entry in entries.into_iter().filter(FileEntry::is_dir) {
            summary.folders += 1;
            match self.owners.resolve(&entry.name).await {
                Ok(Some(owner)) => {
                    tracing::debug!(
                        "folder {} belongs to user #{} by {}",
                        entry.name,
                        owner.owner_id,
                        owner.rule.as_str()
                    );
                    owners.push(OwnerFolder {
                        name: entry.name,
                        path: entry.path,
                        owner_id: owner.owner_id,
                    });
                }
                Ok(None) => {
                    self.activity
                        .info(format!("No user found for folder: {}", entry.name))
                        .await;
                }
                Err(err) => {
                    self.activity
                        .warn(format!(
                            "Cannot resolve owner of folder {}: {err}",
                            entry.name
                        ))
                        .await;
                    summary.incomplete = true;
                }
            }
        }
        Ok(owners)
    }

    async fn scan_owner_folder(
        &self,
        source: &SourceHandle,
        staging: &StagingDir,
        lease: &Lease,
        owner: &OwnerFolder,
        summary: &mut ScanSummary,
        current: &mut HashSet<String>,
    ) {
        self.activity
            .info(format!(
                "Scanning folder for user #{}: {}",
                owner.owner_id, owner.name
            ))
            .await;

        let entries = match source.list(&owner.path).await {
            Ok(entries) => entries,
            Err(err) => {
                self.activity
                    .warn(format!("Failed to open directory {}: {err}", owner.path))
                    .await;
                summary.incomplete = true;
                return;
            }
        };

        for entry in entries.iter().filter(|entry| !entry.is_dir()) {
            let key = naming::product_key(owner.owner_id, &entry.name);
            current.insert(key.clone());
            match self
                .process_file(source, staging, lease, owner, entry, &key)
                .await
            {
                FileOutcome::Created => summary.created += 1,
                FileOutcome::Updated => summary.updated += 1,
                FileOutcome::Skipped => summary.skipped += 1,
                FileOutcome::Failed => summary.failed += 1,
            }
        }
    }

    async fn process_file(
        &self,
        source: &SourceHandle,
        staging: &StagingDir,
        lease: &Lease,
        owner: &OwnerFolder,
        entry: &FileEntry,
        key: &str,
    ) -> FileOutcome {
        let existing = match self.registry.get(key).await {
            Ok(existing) => existing,
            Err(err) => {
                tracing::warn!("registry lookup failed for {key}: {err}");
                return FileOutcome::Failed;
            }
        };
        let update = match (existing, self.settings.policy) {
            (None, _) => None,
            (Some(_), ExistingFilePolicy::CreateOnce) => return FileOutcome::Skipped,
            (Some(record), ExistingFilePolicy::CreateOrUpdate) => {
                if !source_changed(&record, entry) {
                    return FileOutcome::Skipped;
                }
                Some(record)
            }
        };

        let file_lease = match Lease::acquire(
            &self.registry,
            &lease::file_lease_name(key),
            lease.holder(),
            self.settings.file_lease_ttl,
        )
        .await
        .map(LeaseAttempt::into_lease)
        {
            Ok(Some(file_lease)) => file_lease,
            Ok(None) => {
                self.activity
                    .info(format!(
                        "File {} is being processed by another scan, skipping",
                        entry.name
                    ))
                    .await;
                return FileOutcome::Skipped;
            }
            Err(err) => {
                tracing::warn!("cannot lock {key}: {err}");
                return FileOutcome::Failed;
            }
        };

        let outcome = match update {
            None => self.create_from_file(source, staging, owner, entry, key).await,
            Some(record) => {
                self.update_from_file(source, staging, owner, entry, key, record)
                    .await
            }
        };

        if let Err(err) = file_lease.release().await {
            tracing::warn!("failed to release lock for {key}: {err}");
        }
        outcome
    }

    async fn create_from_file(
        &self,
        source: &SourceHandle,
        staging: &StagingDir,
        owner: &OwnerFolder,
        entry: &FileEntry,
        key: &str,
    ) -> FileOutcome {
        // A product created by a run that died before recording it.
        match self.client.find_product_by_sku(key).await {
            Ok(Some(product)) => {
                let record = processed_record(owner, entry, key, Some(product.id));
                if let Err(err) = self.registry.record(&record).await {
                    tracing::warn!("cannot record existing product for {key}: {err}");
                    return FileOutcome::Failed;
                }
                self.activity
                    .info(format!(
                        "Product {} already exists for file: {}, registry updated",
                        product.id, entry.name
                    ))
                    .await;
                return FileOutcome::Skipped;
            }
            Ok(None) => {}
            Err(err) => {
                self.activity
                    .warn(format!(
                        "Error checking existing product for {}: {err}",
                        entry.name
                    ))
                    .await;
                return FileOutcome::Failed;
            }
        }

        let staged = match self.stage(source, staging, owner, entry).await {
            Ok(staged) => staged,
            Err(err) => {
                self.activity
                    .warn(format!("Failed to download file {}: {err}", entry.name))
                    .await;
                return FileOutcome::Failed;
            }
        };

        let result = self
            .materializer
            .create(FileRequest {
                product_key: key,
                owner_id: owner.owner_id,
                folder: &owner.name,
                file_name: &entry.name,
                staged: &staged.upload,
            })
            .await;
        discard(&staged).await;

        let created = match result {
            Ok(created) => created,
            Err(err) => {
                self.activity
                    .warn(format!("Error processing file {}: {err}", entry.name))
                    .await;
                return FileOutcome::Failed;
            }
        };

        let record = processed_record(owner, entry, key, Some(created.product_id));
        if let Err(err) = self.registry.record(&record).await {
            // The SKU lookup above adopts the product on the next scan.
            tracing::warn!("product {} created but not recorded: {err}", created.product_id);
        }
        self.activity
            .info(format!(
                "Created new {} product from file: {} (user #{})",
                created.class.as_str(),
                entry.name,
                owner.owner_id
            ))
            .await;
        FileOutcome::Created
    }

    async fn update_from_file(
        &self,
        source: &SourceHandle,
        staging: &StagingDir,
        owner: &OwnerFolder,
        entry: &FileEntry,
        key: &str,
        record: ProcessedRecord,
    ) -> FileOutcome {
        let product_id = match self.live_product_id(key, &record).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::info!("product for {key} is gone, creating it again");
                return self.create_from_file(source, staging, owner, entry, key).await;
            }
            Err(err) => {
                self.activity
                    .warn(format!("Error checking product for {}: {err}", entry.name))
                    .await;
                return FileOutcome::Failed;
            }
        };

        let staged = match self.stage(source, staging, owner, entry).await {
            Ok(staged) => staged,
            Err(err) => {
                self.activity
                    .warn(format!("Failed to download file {}: {err}", entry.name))
                    .await;
                return FileOutcome::Failed;
            }
        };
        let result = self
            .materializer
            .refresh(
                product_id,
                FileRequest {
                    product_key: key,
                    owner_id: owner.owner_id,
                    folder: &owner.name,
                    file_name: &entry.name,
                    staged: &staged.upload,
                },
            )
            .await;
        discard(&staged).await;

        if let Err(err) = result {
            self.activity
                .warn(format!("Error updating product from {}: {err}", entry.name))
                .await;
            return FileOutcome::Failed;
        }
        let record = processed_record(owner, entry, key, Some(product_id));
        if let Err(err) = self.registry.record(&record).await {
            tracing::warn!("product {product_id} updated but not recorded: {err}");
        }
        self.activity
            .info(format!(
                "Updated product {product_id} from changed file: {}",
                entry.name
            ))
            .await;
        FileOutcome::Updated
    }

    async fn live_product_id(
        &self,
        key: &str,
        record: &ProcessedRecord,
    ) -> Result<Option<u64>, foldershop_core::StorefrontError> {
        if let Some(id) = record.product_id {
            if self.client.get_product(id).await?.is_some() {
                return Ok(Some(id));
            }
        }
        Ok(self
            .client
            .find_product_by_sku(key)
            .await?
            .map(|product| product.id))
    }

    async fn stage(
        &self,
        source: &SourceHandle,
        staging: &StagingDir,
        owner: &OwnerFolder,
        entry: &FileEntry,
    ) -> Result<StagedFile, EngineError> {
        let downloaded = staging.file_path(&owner.name, &entry.name).await?;
        source.download(&entry.path, &downloaded).await?;
        let upload = self.pipeline.run(&downloaded, &entry.name).await;
        Ok(StagedFile { downloaded, upload })
    }
}

fn source_changed(record: &ProcessedRecord, entry: &FileEntry) -> bool {
    record.size != entry.size || record.modified != entry.modified
}

fn processed_record(
    owner: &OwnerFolder,
    entry: &FileEntry,
    key: &str,
    product_id: Option<u64>,
) -> ProcessedRecord {
    ProcessedRecord {
        product_key: key.to_string(),
        owner_id: owner.owner_id,
        folder: owner.name.clone(),
        file_name: entry.name.clone(),
        source_path: join_path(&owner.path, &entry.name),
        product_id,
        size: entry.size,
        modified: entry.modified,
        processed_at: unix_now(),
    }
}

async fn discard(staged: &StagedFile) {
    let _ = tokio::fs::remove_file(&staged.downloaded).await;
    if staged.upload != staged.downloaded {
        let _ = tokio::fs::remove_file(&staged.upload).await;
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
