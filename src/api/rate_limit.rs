//! Per-endpoint, per-client request rate limiting.
//!
//! Each endpoint group gets its own GCRA limiter keyed by client IP. The
//! client address comes from the connection; requests served without one
//! (in-process tests) share the unspecified address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::debug;

use super::error::ApiError;
use crate::config::RateLimitConfig;

/// Limiter for one endpoint group.
pub struct EndpointLimiter {
    name: &'static str,
    limiter: DefaultKeyedRateLimiter<IpAddr>,
    clock: DefaultClock,
}

impl EndpointLimiter {
    /// Allow `requests_per_minute` per client, with bursts of the same size.
    pub fn per_minute(name: &'static str, requests_per_minute: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            name,
            limiter: RateLimiter::keyed(Quota::per_minute(rate)),
            clock: DefaultClock::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Admit one request from `client`, or report how long it must wait.
    pub fn check(&self, client: IpAddr) -> Result<(), Duration> {
        self.limiter
            .check_key(&client)
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

/// Limiters for every endpoint group, or none when limiting is disabled.
#[derive(Clone, Default)]
pub struct RateLimits {
    pub search: Option<Arc<EndpointLimiter>>,
    pub hybrid: Option<Arc<EndpointLimiter>>,
    pub nearby: Option<Arc<EndpointLimiter>>,
    pub fulltext: Option<Arc<EndpointLimiter>>,
    pub pincode: Option<Arc<EndpointLimiter>>,
    pub listing: Option<Arc<EndpointLimiter>>,
    pub stats: Option<Arc<EndpointLimiter>>,
    pub admin: Option<Arc<EndpointLimiter>>,
}

impl RateLimits {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        let limiter = |name, rpm| Some(Arc::new(EndpointLimiter::per_minute(name, rpm)));
        Self {
            search: limiter("search", config.search),
            hybrid: limiter("hybrid", config.hybrid),
            nearby: limiter("nearby", config.nearby),
            fulltext: limiter("fulltext", config.fulltext),
            pincode: limiter("pincode", config.pincode),
            listing: limiter("listing", config.listing),
            stats: limiter("stats", config.stats),
            admin: limiter("admin", config.admin),
        }
    }
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Middleware rejecting requests over the endpoint's quota with 429.
pub async fn enforce(
    State(limiter): State<Arc<EndpointLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_ip(&request);
    match limiter.check(client) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            debug!("Rate limit hit on {} for {}", limiter.name(), client);
            metrics::counter!("dpo_rate_limited_total", "endpoint" => limiter.name())
                .increment(1);
            ApiError::RateLimited { retry_after }.into_response()
        }
    }
}
