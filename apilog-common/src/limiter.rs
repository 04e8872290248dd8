//! Process-wide request rate limiter.
//!
//! Every request served by the API process draws from a single token bucket, regardless of
//! client or listener. The bucket refills at `limit` tokens per second and holds at most
//! `limit` tokens, so an idle process admits a burst of `limit` requests at once.
//!
//! A limit of 0 rejects every request.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{clock, Quota, RateLimiter};
use metrics::counter;

use crate::responses::StatusBody;

type Bucket<C> =
    RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as clock::Clock>::Instant>>;

#[derive(Clone)]
pub struct RequestLimiter<C: clock::Clock = clock::DefaultClock> {
    /// None when the limit is 0.
    bucket: Option<Arc<Bucket<C>>>,
    rejected: Arc<AtomicU64>,
}

impl RequestLimiter {
    /// Creates a limiter admitting `limit` requests per second with a burst of `limit`.
    ///
    /// # Example
    ///
    /// ```
    /// use apilog_common::limiter::RequestLimiter;
    ///
    /// let limiter = RequestLimiter::new(1);
    /// assert!(limiter.allow());   // the burst
    /// assert!(!limiter.allow());  // bucket is empty until it refills
    /// ```
    pub fn new(limit: u32) -> Self {
        Self::with_clock(limit, &clock::DefaultClock::default())
    }
}

impl<C: clock::Clock> RequestLimiter<C> {
    /// Same as `new`, reading time from `clock`.
    pub fn with_clock(limit: u32, clock: &C) -> Self {
        let bucket = NonZeroU32::new(limit).map(|limit| {
            let quota = Quota::per_second(limit).allow_burst(limit);
            Arc::new(RateLimiter::direct_with_clock(quota, clock))
        });

        Self {
            bucket,
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Take one token from the bucket. Never blocks.
    ///
    /// Returns `true` if the request may proceed. Rejections increment the
    /// `http_rate_limited_total` metric.
    pub fn allow(&self) -> bool {
        let allowed = match &self.bucket {
            Some(bucket) => bucket.check().is_ok(),
            None => false,
        };

        if !allowed {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            counter!("http_rate_limited_total").increment(1);
        }
        allowed
    }

    /// Number of requests rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Middleware answering 429 before any routing or handler work when the bucket is empty.
pub async fn rate_limit<C>(
    State(limiter): State<RequestLimiter<C>>,
    request: Request,
    next: Next,
) -> Response
where
    C: clock::Clock + Clone + Send + Sync + 'static,
{
    if !limiter.allow() {
        return StatusBody::error("rate limit exceeded")
            .with_status(StatusCode::TOO_MANY_REQUESTS);
    }

    next.run(request).await
}
