use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{middleware, routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use apilog_common::database::StoreHandle;
use apilog_common::health;
use apilog_common::metrics;
use apilog_common::pipeline::{track_request, RequestPipeline};
use apilog_common::responses::StatusBody;

use crate::worker::WorkerHealthProbe;

#[derive(Clone, FromRef)]
struct AppState {
    store: StoreHandle,
    probe: WorkerHealthProbe,
}

/// Routes served on the health port. Requests are measured but not logged to the store.
pub fn app(
    store: StoreHandle,
    probe: WorkerHealthProbe,
    recorder: Option<PrometheusHandle>,
) -> Router {
    Router::new()
        .route("/live", routing::get(live))
        .route("/ready", routing::get(health::ready))
        .route(
            "/metrics",
            routing::get(move || std::future::ready(metrics::render(recorder.as_ref()))),
        )
        .with_state(AppState { store, probe })
        .layer(middleware::from_fn_with_state(
            RequestPipeline::metrics_only(),
            track_request,
        ))
}

async fn live(State(probe): State<WorkerHealthProbe>) -> Response {
    if probe.is_healthy() {
        StatusBody::ok().into_response()
    } else {
        StatusBody::error("worker unhealthy").with_status(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_json_diff::assert_json_eq;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use apilog_common::database::ConnectionManager;
    use apilog_common::test_utils::MemoryLogStore;

    use super::*;
    use crate::worker::BackgroundProcessor;

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn live_before_first_iteration() {
        let (_processor, probe) =
            BackgroundProcessor::new(StoreHandle::unconfigured(), Duration::from_secs(1), 10);
        let app = app(StoreHandle::unconfigured(), probe, None);

        let (status, body) = get(app, "/live").await;

        assert_eq!(status, StatusCode::OK);
        assert_json_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn live_reports_failing_processor() {
        let store = Arc::new(MemoryLogStore::new());
        let manager = ConnectionManager::with_store(store.clone());
        let (mut processor, probe) =
            BackgroundProcessor::new(manager.handle(), Duration::from_secs(1), 10);
        let app = app(manager.handle(), probe, None);

        store.set_fail_claims(true);
        processor.iterate().await;

        let (status, body) = get(app.clone(), "/live").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_json_eq!(
            body,
            json!({"status": "error", "message": "worker unhealthy"})
        );

        // Liveness and readiness are independent: the store still answers pings.
        let (status, body) = get(app, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_json_eq!(body, json!({"status": "ready"}));
    }

    #[tokio::test(start_paused = true)]
    async fn live_reports_stale_processor() {
        let store = Arc::new(MemoryLogStore::new());
        let manager = ConnectionManager::with_store(store);
        let (mut processor, probe) =
            BackgroundProcessor::new(manager.handle(), Duration::from_secs(1), 10);
        let app = app(manager.handle(), probe, None);

        processor.iterate().await;
        assert_eq!(get(app.clone(), "/live").await.0, StatusCode::OK);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            get(app, "/live").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn ready_without_database() {
        let (_processor, probe) =
            BackgroundProcessor::new(StoreHandle::unconfigured(), Duration::from_secs(1), 10);
        let app = app(StoreHandle::unconfigured(), probe, None);

        let (status, body) = get(app, "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_json_eq!(
            body,
            json!({"status": "error", "message": "db not configured"})
        );
    }
}
