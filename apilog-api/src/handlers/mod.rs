mod app;
mod public;

use axum::{middleware, Router};
use governor::clock::Clock;
use tower_http::trace::TraceLayer;

use apilog_common::limiter::{rate_limit, RequestLimiter};
use apilog_common::pipeline::{track_request, RequestPipeline};

pub use app::internal_router;
pub use public::{public_router, TimeResponse};

/// Wrap a request-serving router: the limiter runs first, rejected requests never reach
/// the pipeline or the handlers.
pub fn with_request_layers<C>(
    router: Router,
    limiter: RequestLimiter<C>,
    pipeline: RequestPipeline,
) -> Router
where
    C: Clock + Clone + Send + Sync + 'static,
{
    router
        .layer(middleware::from_fn_with_state(pipeline, track_request))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(limiter, rate_limit::<C>))
}
