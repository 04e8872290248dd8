use std::sync::Arc;

use axum::extract::State;
use axum::{routing, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct TimeResponse {
    pub status: String,
    /// RFC 3339, UTC, whole seconds.
    pub timestamp: String,
    pub env: String,
}

#[derive(Clone)]
struct PublicState {
    env: Arc<str>,
}

/// Routes served on the public port.
pub fn public_router(env: &str) -> Router {
    Router::new()
        .route("/api/v1/time", routing::get(current_time))
        .with_state(PublicState { env: env.into() })
}

async fn current_time(State(state): State<PublicState>) -> Json<TimeResponse> {
    Json(TimeResponse {
        status: "ok".to_owned(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        env: state.env.to_string(),
    })
}
