//! External cron trigger: `GET /cron/{secret}` starts a scan in the
//! background. Unknown secrets get a plain 404.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::sync::engine::ScanEngine;

#[derive(Clone)]
struct WebhookState {
    engine: Arc<ScanEngine>,
    secret_digest: [u8; 32],
}

pub fn router(engine: Arc<ScanEngine>, secret: &str) -> Router {
    Router::new()
        .route("/cron/{secret}", get(trigger_scan))
        .with_state(WebhookState {
            engine,
            secret_digest: digest(secret),
        })
}

async fn trigger_scan(State(state): State<WebhookState>, Path(secret): Path<String>) -> Response {
    if !secret_matches(&state.secret_digest, &secret) {
        return StatusCode::NOT_FOUND.into_response();
    }

    match state.engine.is_scan_running().await {
        Ok(true) => {
            tracing::info!("webhook trigger ignored, scan already running");
            return (
                StatusCode::CONFLICT,
                Json(json!({ "status": "already_running" })),
            )
                .into_response();
        }
        Ok(false) => {}
        Err(err) => {
            tracing::warn!("webhook cannot read scan lock: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error" })),
            )
                .into_response();
        }
    }

    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        match engine.run_scan().await {
            Ok(outcome) => tracing::info!("webhook {}", outcome.describe()),
            Err(err) => tracing::error!("webhook scan failed: {err}"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

/// Compares fixed-size digests without early exit.
fn secret_matches(expected: &[u8; 32], candidate: &str) -> bool {
    let candidate = digest(candidate);
    expected
        .iter()
        .zip(candidate.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::activity::ActivityLog;
    use crate::sync::engine::ScanSettings;
    use crate::sync::lease::{SCAN_LEASE, unix_now};
    use crate::sync::materializer::ProductDefaults;
    use crate::sync::postprocess::PostProcessPipeline;
    use crate::sync::registry::RegistryStore;
    use crate::sync::source::SourceConfig;
    use axum::body::Body;
    use axum::http::Request;
    use foldershop_core::StorefrontClient;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    async fn engine() -> (Arc<ScanEngine>, TempDir) {
        let temp = tempdir().unwrap();
        let registry = RegistryStore::open(&temp.path().join("registry.db"))
            .await
            .unwrap();
        let settings = ScanSettings {
            base_path: temp.path().join("missing").to_string_lossy().into_owned(),
            staging_root: temp.path().join("staging"),
            ..ScanSettings::default()
        };
        let engine = ScanEngine::new(
            StorefrontClient::new("http://127.0.0.1:9", "admin", "pass").unwrap(),
            registry.clone(),
            SourceConfig::local(),
            ProductDefaults::default(),
            PostProcessPipeline::new(),
            settings,
            ActivityLog::new(registry, true),
        )
        .unwrap();
        (Arc::new(engine), temp)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn only_the_exact_secret_matches() {
        let expected = digest("s3cret");
        assert!(secret_matches(&expected, "s3cret"));
        assert!(!secret_matches(&expected, "s3cre"));
        assert!(!secret_matches(&expected, "S3CRET"));
    }

    #[tokio::test]
    async fn wrong_secret_is_not_found() {
        let (engine, _temp) = engine().await;
        let response = router(engine, "s3cret")
            .oneshot(get_request("/cron/guess"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn held_lock_returns_conflict() {
        let (engine, _temp) = engine().await;
        engine
            .registry()
            .try_acquire_lease(SCAN_LEASE, "other-host", unix_now(), 600)
            .await
            .unwrap();

        let response = router(Arc::clone(&engine), "s3cret")
            .oneshot(get_request("/cron/s3cret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "already_running");
    }

    #[tokio::test]
    async fn valid_secret_starts_a_scan() {
        let (engine, _temp) = engine().await;
        let response = router(Arc::clone(&engine), "s3cret")
            .oneshot(get_request("/cron/s3cret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut started = false;
        for _ in 0..50 {
            if engine.registry().last_scan_at().await.unwrap().is_some() {
                started = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(started);
    }
}
