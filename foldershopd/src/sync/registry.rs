use std::collections::BTreeSet;
use std::path::PathBuf;

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const LAST_SCAN_AT_KEY: &str = "last_scan_at";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid stored value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// One source file that has been turned into a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub product_key: String,
    pub owner_id: u64,
    pub folder: String,
    pub file_name: String,
    pub source_path: String,
    pub product_id: Option<u64>,
    pub size: Option<u64>,
    pub modified: Option<i64>,
    pub processed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub name: String,
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    Acquired,
    /// The previous holder's lease had expired and was taken over.
    Reclaimed(LeaseRecord),
    Held(LeaseRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: i64,
    pub logged_at: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRecord {
    pub preview_path: String,
    pub product_id: u64,
    pub modified: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    pool: SqlitePool,
}

impl RegistryStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, RegistryError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &std::path::Path) -> Result<Self, RegistryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, RegistryError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), RegistryError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, product_key: &str) -> Result<Option<ProcessedRecord>, RegistryError> {
        let row = sqlx::query(
            "SELECT product_key, owner_id, folder, file_name, source_path, product_id, size, modified, processed_at
             FROM processed_files WHERE product_key = ?",
        )
        .bind(product_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| processed_from_row(&row)).transpose()
    }

    pub async fn contains(&self, product_key: &str) -> Result<bool, RegistryError> {
        let row = sqlx::query("SELECT 1 FROM processed_files WHERE product_key = ?")
            .bind(product_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Inserts or replaces the record for `record.product_key`.
    pub async fn record(&self, record: &ProcessedRecord) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO processed_files (product_key, owner_id, folder, file_name, source_path, product_id, size, modified, processed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(product_key) DO UPDATE SET
                owner_id = excluded.owner_id,
                folder = excluded.folder,
                file_name = excluded.file_name,
                source_path = excluded.source_path,
                product_id = excluded.product_id,
                size = excluded.size,
                modified = excluded.modified,
                processed_at = excluded.processed_at",
        )
        .bind(&record.product_key)
        .bind(to_db_id(record.owner_id))
        .bind(&record.folder)
        .bind(&record.file_name)
        .bind(&record.source_path)
        .bind(record.product_id.map(to_db_id))
        .bind(record.size.map(to_db_id))
        .bind(record.modified)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, product_key: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM processed_files WHERE product_key = ?")
            .bind(product_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn keys(&self) -> Result<BTreeSet<String>, RegistryError> {
        let rows = sqlx::query("SELECT product_key FROM processed_files")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("product_key").map_err(RegistryError::from))
            .collect()
    }

    pub async fn list_by_owner(&self, owner_id: u64) -> Result<Vec<ProcessedRecord>, RegistryError> {
        let rows = sqlx::query(
            "SELECT product_key, owner_id, folder, file_name, source_path, product_id, size, modified, processed_at
             FROM processed_files WHERE owner_id = ? ORDER BY file_name",
        )
        .bind(to_db_id(owner_id))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(processed_from_row).collect()
    }

    pub async fn count(&self) -> Result<u64, RegistryError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM processed_files")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    /// Forgets every processed file. Products in the storefront are untouched.
    pub async fn reset(&self) -> Result<u64, RegistryError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM processed_files")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM attached_previews")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Takes the named lease if it is free or expired, in one statement so two
    /// concurrent callers can never both succeed.
    pub async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: i64,
        ttl_secs: i64,
    ) -> Result<LeaseGrant, RegistryError> {
        let previous = self.lease(name).await?;
        let result = sqlx::query(
            "INSERT INTO leases (name, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE leases.expires_at <= ?3",
        )
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(now.saturating_add(ttl_secs))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(granted(previous, holder, now));
        }

        match self.lease(name).await? {
            Some(current) => Ok(LeaseGrant::Held(current)),
            // Released between our insert and this read.
            None => Ok(LeaseGrant::Held(LeaseRecord {
                name: name.to_string(),
                holder: String::new(),
                acquired_at: now,
                expires_at: now,
            })),
        }
    }

    /// Extends a lease still owned by `holder`. Returns false if it was lost.
    pub async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        now: i64,
        ttl_secs: i64,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query("UPDATE leases SET expires_at = ? WHERE name = ? AND holder = ?")
            .bind(now.saturating_add(ttl_secs))
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drops every lease taken by one scan attempt, whatever its name.
    pub async fn release_leases_held_by(&self, holder: &str) -> Result<u64, RegistryError> {
        let result = sqlx::query("DELETE FROM leases WHERE holder = ?")
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Holders with at least one unexpired lease.
    pub async fn live_lease_holders(&self, now: i64) -> Result<BTreeSet<String>, RegistryError> {
        let rows = sqlx::query("SELECT DISTINCT holder FROM leases WHERE expires_at > ?")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("holder").map_err(RegistryError::from))
            .collect()
    }

    /// Drops the lease regardless of holder.
    pub async fn clear_lease(&self, name: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM leases WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn lease(&self, name: &str) -> Result<Option<LeaseRecord>, RegistryError> {
        let row = sqlx::query(
            "SELECT name, holder, acquired_at, expires_at FROM leases WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LeaseRecord {
            name: row.try_get("name")?,
            holder: row.try_get("holder")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn setting(&self, key: &str) -> Result<Option<String>, RegistryError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.try_get("value")).transpose()?)
    }

    pub async fn set_last_scan_at(&self, at: i64) -> Result<(), RegistryError> {
        self.set_setting(LAST_SCAN_AT_KEY, &at.to_string()).await
    }

    pub async fn last_scan_at(&self) -> Result<Option<i64>, RegistryError> {
        match self.setting(LAST_SCAN_AT_KEY).await? {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| RegistryError::InvalidValue {
                    field: LAST_SCAN_AT_KEY,
                    value,
                }),
            None => Ok(None),
        }
    }

    /// Appends to the activity log and drops the oldest rows beyond `cap`.
    pub async fn append_log(&self, now: i64, message: &str, cap: u32) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO activity_log (logged_at, message) VALUES (?, ?)")
            .bind(now)
            .bind(message)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM activity_log WHERE id NOT IN (
                SELECT id FROM activity_log ORDER BY id DESC LIMIT ?
             )",
        )
        .bind(i64::from(cap))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Oldest first.
    pub async fn log_entries(&self) -> Result<Vec<LogEntry>, RegistryError> {
        let rows = sqlx::query("SELECT id, logged_at, message FROM activity_log ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(LogEntry {
                    id: row.try_get("id")?,
                    logged_at: row.try_get("logged_at")?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }

    pub async fn clear_log(&self) -> Result<u64, RegistryError> {
        let result = sqlx::query("DELETE FROM activity_log")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn preview(&self, preview_path: &str) -> Result<Option<PreviewRecord>, RegistryError> {
        let row = sqlx::query(
            "SELECT preview_path, product_id, modified FROM attached_previews WHERE preview_path = ?",
        )
        .bind(preview_path)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PreviewRecord {
            preview_path: row.try_get("preview_path")?,
            product_id: from_db_id("product_id", row.try_get("product_id")?)?,
            modified: row.try_get("modified")?,
        }))
    }

    pub async fn record_preview(
        &self,
        record: &PreviewRecord,
        attached_at: i64,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO attached_previews (preview_path, product_id, modified, attached_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(preview_path) DO UPDATE SET
                product_id = excluded.product_id,
                modified = excluded.modified,
                attached_at = excluded.attached_at",
        )
        .bind(&record.preview_path)
        .bind(to_db_id(record.product_id))
        .bind(record.modified)
        .bind(attached_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn processed_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ProcessedRecord, RegistryError> {
    let product_id: Option<i64> = row.try_get("product_id")?;
    let size: Option<i64> = row.try_get("size")?;
    Ok(ProcessedRecord {
        product_key: row.try_get("product_key")?,
        owner_id: from_db_id("owner_id", row.try_get("owner_id")?)?,
        folder: row.try_get("folder")?,
        file_name: row.try_get("file_name")?,
        source_path: row.try_get("source_path")?,
        product_id: product_id.map(|id| from_db_id("product_id", id)).transpose()?,
        size: size.map(|size| from_db_id("size", size)).transpose()?,
        modified: row.try_get("modified")?,
        processed_at: row.try_get("processed_at")?,
    })
}

/// Classifies a successful upsert. `previous` was read before the write, so
/// a live lease released by its holder in between counts as a plain acquire.
fn granted(previous: Option<LeaseRecord>, holder: &str, now: i64) -> LeaseGrant {
    match previous {
        Some(previous) if previous.is_expired(now) && previous.holder != holder => {
            LeaseGrant::Reclaimed(previous)
        }
        _ => LeaseGrant::Acquired,
    }
}

fn to_db_id(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_id(field: &'static str, value: i64) -> Result<u64, RegistryError> {
    u64::try_from(value).map_err(|_| RegistryError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

pub fn default_db_path() -> Result<PathBuf, RegistryError> {
    let mut path = dirs::data_dir().ok_or(RegistryError::MissingDataDir)?;
    path.push("foldershop");
    path.push("registry.db");
    Ok(path)
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
