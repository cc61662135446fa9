use std::collections::{BTreeSet, HashSet};

use foldershop_core::StorefrontClient;

use super::registry::{RegistryError, RegistryStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Products hard-deleted from the storefront.
    pub deleted: usize,
    /// Registry keys dropped, including ones whose product was already gone.
    pub forgotten: usize,
    pub failed: usize,
}

/// Keys that were processed before but are absent from the current listing.
pub fn stale_keys(registered: &BTreeSet<String>, current: &HashSet<String>) -> Vec<String> {
    registered
        .iter()
        .filter(|key| !current.contains(key.as_str()))
        .cloned()
        .collect()
}

/// Removes products whose source files disappeared. Only call this with the
/// key set of a complete listing.
pub struct DeletionReconciler<'a> {
    client: &'a StorefrontClient,
    registry: &'a RegistryStore,
}

impl<'a> DeletionReconciler<'a> {
    pub fn new(client: &'a StorefrontClient, registry: &'a RegistryStore) -> Self {
        Self { client, registry }
    }

    pub async fn reconcile(&self, current: &HashSet<String>) -> Result<ReconcileReport, RegistryError> {
        let registered = self.registry.keys().await?;
        let mut report = ReconcileReport::default();

        for key in stale_keys(&registered, current) {
            let product = match self.client.find_product_by_sku(&key).await {
                Ok(product) => product,
                Err(err) => {
                    tracing::warn!("cannot look up product for {key}: {err}");
                    report.failed += 1;
                    continue;
                }
            };

            if let Some(product) = product {
                if let Err(err) = self.client.delete_product(product.id, true).await {
                    tracing::warn!("cannot delete product {} for {key}: {err}", product.id);
                    report.failed += 1;
                    continue;
                }
                tracing::info!("deleted product {} for removed file {key}", product.id);
                report.deleted += 1;
            } else {
                tracing::debug!("product for {key} already gone");
            }

            self.registry.remove(&key).await?;
            report.forgotten += 1;
        }

        Ok(report)
    }
}
