use serde::Serialize;

use super::activity::ActivityLog;
use super::engine::OwnerFolder;
use super::lease::unix_now;
use super::materializer::Materializer;
use super::naming;
use super::registry::{PreviewRecord, ProcessedRecord, RegistryStore};
use super::source::{SourceHandle, join_path};
use super::staging::StagingDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewSettings {
    /// Directory holding one sub-folder of previews per owner folder.
    pub root: String,
    /// Product meta field that receives the preview media id.
    pub field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreviewReport {
    pub processed: usize,
    pub attached: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Finds the product a preview belongs to: same file stem first, then a
/// loose match against the product title.
pub fn match_preview<'r>(
    records: &'r [ProcessedRecord],
    preview_name: &str,
) -> Option<&'r ProcessedRecord> {
    let stem = naming::file_stem(preview_name);
    records
        .iter()
        .find(|record| naming::file_stem(&record.file_name) == stem)
        .or_else(|| {
            let wanted = naming::normalized_name(stem);
            records.iter().find(|record| {
                naming::normalized_name(&naming::product_title(&record.file_name)) == wanted
            })
        })
}

/// Attaches preview files to products already created for the same owner.
pub struct PreviewPass<'a> {
    pub registry: &'a RegistryStore,
    pub materializer: &'a Materializer,
    pub activity: &'a ActivityLog,
    pub settings: &'a PreviewSettings,
    pub source: &'a SourceHandle,
    pub staging: &'a StagingDir,
}

impl PreviewPass<'_> {
    pub async fn run(&self, owners: &[OwnerFolder]) -> PreviewReport {
        let mut report = PreviewReport::default();
        for owner in owners {
            self.run_folder(owner, &mut report).await;
        }
        if report.processed > 0 {
            self.activity
                .info(format!(
                    "Preview processing completed. Processed: {}, Attached: {}, Skipped: {}",
                    report.processed, report.attached, report.skipped
                ))
                .await;
        }
        report
    }

    async fn run_folder(&self, owner: &OwnerFolder, report: &mut PreviewReport) {
        let dir = join_path(&self.settings.root, &owner.name);
        if !self.source.is_dir(&dir).await {
            return;
        }
        let entries = match self.source.list(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("cannot list previews in {dir}: {err}");
                return;
            }
        };
        let records = match self.registry.list_by_owner(owner.owner_id).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!("cannot load products of user #{}: {err}", owner.owner_id);
                return;
            }
        };

        for entry in entries.iter().filter(|entry| !entry.is_dir()) {
            report.processed += 1;
            let Some(product_id) =
                match_preview(&records, &entry.name).and_then(|record| record.product_id)
            else {
                tracing::debug!("no product matches preview {}", entry.path);
                report.skipped += 1;
                continue;
            };

            match self.registry.preview(&entry.path).await {
                Ok(Some(seen)) if seen.product_id == product_id && seen.modified == entry.modified => {
                    report.skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("cannot read preview state for {}: {err}", entry.path);
                    report.failed += 1;
                    continue;
                }
            }

            let staged = match self
                .staging
                .file_path(&format!("previews/{}", owner.name), &entry.name)
                .await
            {
                Ok(staged) => staged,
                Err(err) => {
                    tracing::warn!("cannot stage preview {}: {err}", entry.name);
                    report.failed += 1;
                    continue;
                }
            };
            if let Err(err) = self.source.download(&entry.path, &staged).await {
                tracing::warn!("cannot download preview {}: {err}", entry.path);
                report.failed += 1;
                continue;
            }

            let result = self
                .materializer
                .attach_preview(product_id, &self.settings.field, &entry.name, &staged)
                .await;
            let _ = tokio::fs::remove_file(&staged).await;

            match result {
                Ok(media_id) => {
                    let record = PreviewRecord {
                        preview_path: entry.path.clone(),
                        product_id,
                        modified: entry.modified,
                    };
                    if let Err(err) = self.registry.record_preview(&record, unix_now()).await {
                        tracing::warn!("preview attached but not recorded: {err}");
                    }
                    tracing::info!(
                        "attached preview {} (media {media_id}) to product {product_id}",
                        entry.name
                    );
                    report.attached += 1;
                }
                Err(err) => {
                    tracing::warn!("cannot attach preview {}: {err}", entry.name);
                    report.failed += 1;
                }
            }
        }
    }
}
