use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use crate::model::LogRecord;
use crate::sink::LogSink;

/// Known routes keep their own label, everything else is reported as `/other`
/// so scanners hitting random paths cannot blow up label cardinality.
pub fn route_label(path: &str) -> &'static str {
    match path {
        "/live" => "/live",
        "/ready" => "/ready",
        "/metrics" => "/metrics",
        "/api/v1/time" => "/api/v1/time",
        _ => "/other",
    }
}

/// Same idea as `route_label` for methods: extension methods are reported as `OTHER`.
pub fn method_label(method: &Method) -> &'static str {
    match method.as_str() {
        "GET" => "GET",
        "POST" => "POST",
        "PUT" => "PUT",
        "DELETE" => "DELETE",
        "HEAD" => "HEAD",
        "OPTIONS" => "OPTIONS",
        "PATCH" => "PATCH",
        "CONNECT" => "CONNECT",
        "TRACE" => "TRACE",
        _ => "OTHER",
    }
}

/// State for `track_request`.
#[derive(Clone, Default)]
pub struct RequestPipeline {
    sink: Option<LogSink>,
}

impl RequestPipeline {
    /// Record metrics and queue a `LogRecord` for every request.
    pub fn with_sink(sink: LogSink) -> Self {
        Self { sink: Some(sink) }
    }

    /// Record metrics only.
    pub fn metrics_only() -> Self {
        Self { sink: None }
    }
}

/// Middleware to record HTTP metrics, a log line and a `LogRecord` for each request.
pub async fn track_request(
    State(pipeline): State<RequestPipeline>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_owned());

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    let endpoint = route_label(&path);
    let method_name = method_label(&method);

    metrics::counter!(
        "http_requests_total",
        "method" => method_name,
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method_name,
        "endpoint" => endpoint
    )
    .record(elapsed.as_secs_f64());
    if status >= 400 {
        metrics::counter!(
            "http_errors_total",
            "method" => method_name,
            "endpoint" => endpoint,
            "status" => status.to_string()
        )
        .increment(1);
    }

    let record = LogRecord::new(method.as_str(), &path, status, elapsed, &remote_addr);
    info!(
        method = %record.method,
        path = %record.endpoint,
        status,
        duration_ms = record.duration_ms,
        remote_addr = %record.remote_addr,
        "request completed"
    );
    if let Some(sink) = &pipeline.sink {
        sink.enqueue(record);
    }

    response
}
