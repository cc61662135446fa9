use std::time::Duration;

use sha2::{Digest, Sha256};

use super::registry::{LeaseGrant, LeaseRecord, RegistryError, RegistryStore};

pub const SCAN_LEASE: &str = "scan";

/// Lease name guarding a single product key.
pub fn file_lease_name(product_key: &str) -> String {
    format!("file:{:x}", Sha256::digest(product_key.as_bytes()))
}

/// Identifies one scan attempt across processes.
pub fn new_holder_id() -> String {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Debug)]
pub enum LeaseAttempt {
    Acquired(Lease),
    Reclaimed { lease: Lease, previous: LeaseRecord },
    Held(LeaseRecord),
}

impl LeaseAttempt {
    pub fn into_lease(self) -> Option<Lease> {
        match self {
            LeaseAttempt::Acquired(lease) | LeaseAttempt::Reclaimed { lease, .. } => Some(lease),
            LeaseAttempt::Held(_) => None,
        }
    }
}

/// A held, time-limited lease. Must be released explicitly; if the process
/// dies the lease simply expires.
#[derive(Debug)]
pub struct Lease {
    registry: RegistryStore,
    name: String,
    holder: String,
    ttl: Duration,
}

impl Lease {
    pub async fn acquire(
        registry: &RegistryStore,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseAttempt, RegistryError> {
        let grant = registry
            .try_acquire_lease(name, holder, unix_now(), ttl_secs(ttl))
            .await?;
        let lease = || Lease {
            registry: registry.clone(),
            name: name.to_string(),
            holder: holder.to_string(),
            ttl,
        };
        Ok(match grant {
            LeaseGrant::Acquired => LeaseAttempt::Acquired(lease()),
            LeaseGrant::Reclaimed(previous) => LeaseAttempt::Reclaimed {
                lease: lease(),
                previous,
            },
            LeaseGrant::Held(current) => LeaseAttempt::Held(current),
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Pushes expiry out by another TTL. False means someone else took it.
    pub async fn renew(&self) -> Result<bool, RegistryError> {
        self.registry
            .renew_lease(&self.name, &self.holder, unix_now(), ttl_secs(self.ttl))
            .await
    }

    pub async fn release(self) -> Result<(), RegistryError> {
        self.registry.release_lease(&self.name, &self.holder).await?;
        Ok(())
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn make_store() -> RegistryStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = RegistryStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    #[test]
    fn file_lease_name_is_stable_hash() {
        let name = file_lease_name("42-photo-jpg");
        assert_eq!(name, file_lease_name("42-photo-jpg"));
        assert_ne!(name, file_lease_name("42-photo-png"));
        assert_eq!(name.len(), "file:".len() + 64);
    }

    #[test]
    fn holder_ids_differ() {
        assert_ne!(new_holder_id(), new_holder_id());
    }

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let store = make_store().await;
        let ttl = Duration::from_secs(600);

        let first = Lease::acquire(&store, SCAN_LEASE, "a", ttl)
            .await
            .unwrap()
            .into_lease()
            .expect("first lease");
        let second = Lease::acquire(&store, SCAN_LEASE, "b", ttl).await.unwrap();
        assert!(matches!(second, LeaseAttempt::Held(ref held) if held.holder == "a"));

        assert!(first.renew().await.unwrap());
        first.release().await.unwrap();

        let third = Lease::acquire(&store, SCAN_LEASE, "b", ttl).await.unwrap();
        assert!(matches!(third, LeaseAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let store = make_store().await;
        store
            .try_acquire_lease(SCAN_LEASE, "crashed", unix_now() - 10_000, 600)
            .await
            .unwrap();

        let attempt = Lease::acquire(&store, SCAN_LEASE, "fresh", Duration::from_secs(600))
            .await
            .unwrap();
        match attempt {
            LeaseAttempt::Reclaimed { lease, previous } => {
                assert_eq!(previous.holder, "crashed");
                assert_eq!(lease.holder(), "fresh");
            }
            other => panic!("unexpected attempt: {other:?}"),
        }
    }
}
