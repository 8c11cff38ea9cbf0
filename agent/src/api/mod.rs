use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use governor::{middleware::NoOpMiddleware, DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{config::RateLimits, payment::PaymentConfig, Agent, PaymentGate};

mod http;
mod paywall;


pub const SPIN_PATH: &str = "/spinWith1USDC";
pub const CLAIM_PATH: &str = "/claim";

const REQUEST_BODY_LIMIT_BYTES: usize = 16 * 1024;

pub(crate) const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";
pub(crate) const X_PAYMENT_HEADER: &str = "x-payment";
pub(crate) const X_PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";
const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct Api {
    agent: Arc<Agent>,
    gate: Arc<dyn PaymentGate>,
    payment: PaymentConfig,
    limits: RateLimits,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub agent: Arc<Agent>,
    pub gate: Arc<dyn PaymentGate>,
    pub payment: Arc<PaymentConfig>,
    /// Per-IP limiter for paid routes called without a payment header.
    pub unpaid: Option<Arc<DefaultKeyedRateLimiter<IpAddr>>>,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

fn per_minute_governor(rate_per_minute: u64) -> Option<Arc<IpGovernorConfig>> {
    if rate_per_minute == 0 {
        return None;
    }
    let nanos_per_request = (60_000_000_000u64 / rate_per_minute).max(1);
    let burst_size = u32::try_from(rate_per_minute).unwrap_or(u32::MAX);
    GovernorConfigBuilder::default()
        .period(Duration::from_nanos(nanos_per_request))
        .burst_size(burst_size)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .map(Arc::new)
}

fn keyed_limiter(rate_per_minute: u64) -> Option<Arc<DefaultKeyedRateLimiter<IpAddr>>> {
    let rate = NonZeroU32::new(u32::try_from(rate_per_minute).unwrap_or(u32::MAX))?;
    Some(Arc::new(RateLimiter::keyed(Quota::per_minute(rate))))
}

impl Api {
    pub fn new(
        agent: Arc<Agent>,
        gate: Arc<dyn PaymentGate>,
        payment: PaymentConfig,
        limits: RateLimits,
    ) -> Self {
        Self {
            agent,
            gate,
            payment,
            limits,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            agent: self.agent.clone(),
            gate: self.gate.clone(),
            payment: Arc::new(self.payment.clone()),
            unpaid: keyed_limiter(self.limits.no_payment_per_min),
        };

        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static(REQUEST_ID_HEADER),
                header::HeaderName::from_static(X_PAYMENT_HEADER),
                header::HeaderName::from_static(PAYMENT_SIGNATURE_HEADER),
            ])
            .expose_headers([
                header::HeaderName::from_static(REQUEST_ID_HEADER),
                header::HeaderName::from_static(X_PAYMENT_RESPONSE_HEADER),
            ]);

        let reads = Router::new()
            .route("/", get(http::service_info))
            .route("/round/:request_id", get(http::round))
            .route("/player/:address/balances", get(http::balances))
            .route("/player/:address/claimable", get(http::claimable))
            .route("/contract/health", get(http::contract_health))
            .route("/cron/health", get(http::cron_health));
        let reads = match per_minute_governor(self.limits.per_min) {
            Some(config) => {
                tracing::info!(rate_per_minute = self.limits.per_min, "read rate limit configured");
                reads.layer(GovernorLayer { config })
            }
            None => reads,
        };

        // Paid routes are limited inside the paywall, and only while unpaid.
        let paid = Router::new()
            .route(SPIN_PATH, post(http::spin))
            .route(CLAIM_PATH, post(http::claim));

        reads
            .merge(paid)
            .layer(cors)
            .layer(DefaultBodyLimit::max(REQUEST_BODY_LIMIT_BYTES))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Client address as seen by the paid-route limiter: forwarding headers first, then
/// the socket peer.
pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    };
    forwarded
        .or_else(real_ip)
        .or(peer.map(|addr| addr.ip()))
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static(REQUEST_ID_HEADER))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        tracing::debug!(request_id = %request_id, path = %path, "rate limited");
    }
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
