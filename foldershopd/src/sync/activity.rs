use super::lease::unix_now;
use super::registry::RegistryStore;

pub const ACTIVITY_LOG_CAP: u32 = 100;

/// Operator-facing activity messages. Always traced; also persisted to the
/// bounded activity log when enabled.
#[derive(Clone)]
pub struct ActivityLog {
    registry: RegistryStore,
    enabled: bool,
}

impl ActivityLog {
    pub fn new(registry: RegistryStore, enabled: bool) -> Self {
        Self { registry, enabled }
    }

    pub async fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "foldershopd::activity", "{message}");
        self.persist(&message).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "foldershopd::activity", "{message}");
        self.persist(&message).await;
    }

    async fn persist(&self, message: &str) {
        if !self.enabled {
            return;
        }
        if let Err(err) = self
            .registry
            .append_log(unix_now(), message, ACTIVITY_LOG_CAP)
            .await
        {
            tracing::warn!("failed to persist activity log entry: {err}");
        }
    }
}
