use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// The `{"status": ..., "message": ...}` body shared by probes and error responses.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusBody {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl StatusBody {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    pub fn ready() -> Self {
        Self {
            status: "ready",
            message: None,
        }
    }

    pub fn error(message: &'static str) -> Self {
        Self {
            status: "error",
            message: Some(message),
        }
    }

    pub fn with_status(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for StatusBody {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}
