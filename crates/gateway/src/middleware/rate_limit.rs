//! Rate limiting middleware using token bucket algorithm

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use condoportal_common::{config::RateLimitConfig, errors::AppError};
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter using governor crate
pub type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Shared limiter plus the configured rate, reported on rejection
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<GlobalRateLimiter>,
    requests_per_second: u32,
}

impl RateLimit {
    /// `None` when disabled or when either setting is zero
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let per_second = NonZeroU32::new(config.requests_per_second)?;
        let burst = NonZeroU32::new(config.burst)?;

        Some(Self {
            limiter: Arc::new(RateLimiter::direct(
                Quota::per_second(per_second).allow_burst(burst),
            )),
            requests_per_second: config.requests_per_second,
        })
    }
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimit>,
    request: Request,
    next: Next,
) -> Response {
    match rate_limit.limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            tracing::warn!(path = %request.uri().path(), "Rate limit exceeded");
            AppError::RateLimited {
                limit: rate_limit.requests_per_second,
            }
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(requests_per_second: u32, burst: u32, enabled: bool) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second,
            burst,
            enabled,
        }
    }

    #[test]
    fn test_rate_limiter_creation() {
        let rate_limit = RateLimit::from_config(&config(100, 200, true)).unwrap();
        assert!(rate_limit.limiter.check().is_ok());
    }

    #[test]
    fn test_burst_is_enforced() {
        let rate_limit = RateLimit::from_config(&config(1, 2, true)).unwrap();
        assert!(rate_limit.limiter.check().is_ok());
        assert!(rate_limit.limiter.check().is_ok());
        assert!(rate_limit.limiter.check().is_err());
    }

    #[test]
    fn test_disabled_or_zero_settings() {
        assert!(RateLimit::from_config(&config(10, 20, false)).is_none());
        assert!(RateLimit::from_config(&config(0, 20, true)).is_none());
    }
}
