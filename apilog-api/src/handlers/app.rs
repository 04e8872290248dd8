use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use apilog_common::database::StoreHandle;
use apilog_common::{health, metrics};

/// Routes served on the internal port.
pub fn internal_router(store: StoreHandle, recorder: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/live", routing::get(health::live))
        .route("/ready", routing::get(health::ready))
        .route(
            "/metrics",
            routing::get(move || std::future::ready(metrics::render(recorder.as_ref()))),
        )
        .with_state(store)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_json_diff::assert_json_eq;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use apilog_common::database::ConnectionManager;
    use apilog_common::test_utils::MemoryLogStore;

    use super::*;

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn live() {
        let app = internal_router(StoreHandle::unconfigured(), None);

        let (status, body) = get(app, "/live").await;

        assert_eq!(status, StatusCode::OK);
        assert_json_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            json!({"status": "ok"})
        );
    }

    #[tokio::test]
    async fn ready_follows_the_store() {
        let store = Arc::new(MemoryLogStore::new());
        let manager = ConnectionManager::with_store(store.clone());
        let app = internal_router(manager.handle(), None);

        let (status, _) = get(app.clone(), "/ready").await;
        assert_eq!(status, StatusCode::OK);

        store.set_reachable(false);
        let (status, body) = get(app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_json_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            json!({"status": "error", "message": "db unreachable"})
        );
    }

    #[tokio::test]
    async fn metrics_without_recorder() {
        let app = internal_router(StoreHandle::unconfigured(), None);

        let (status, body) = get(app, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"no metrics recorder installed");
    }
}
