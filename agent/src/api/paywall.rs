//! x402 flow for paid routes: quote, verify, run, settle.

use axum::{
    http::{header::HOST, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use lotero_types::api::ErrorResponse;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{future::Future, net::IpAddr};
use tracing::{error, warn};

use super::{
    http::ApiError, AppState, PAYMENT_SIGNATURE_HEADER, X_PAYMENT_HEADER,
    X_PAYMENT_RESPONSE_HEADER,
};
use crate::payment::{PaymentRequired, PaymentRequirements};

/// A route that costs `price` to call.
pub(super) struct PaidRoute {
    pub path: &'static str,
    pub price: Decimal,
    pub description: &'static str,
}

fn payment_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(PAYMENT_SIGNATURE_HEADER)
        .or_else(|| headers.get(X_PAYMENT_HEADER))
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Origin the client used to reach us, honouring a fronting proxy.
fn request_origin(headers: &HeaderMap) -> Option<String> {
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, HOST.as_str()))?;
    let proto = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    Some(format!("{proto}://{host}"))
}

fn route_requirements(
    state: &AppState,
    headers: &HeaderMap,
    route: &PaidRoute,
) -> PaymentRequirements {
    let resource = state
        .payment
        .resource_url(request_origin(headers).as_deref(), route.path);
    state
        .payment
        .requirements(&resource, route.price, route.description)
}

fn payment_required(
    error: impl Into<String>,
    state: &AppState,
    headers: &HeaderMap,
    route: &PaidRoute,
) -> Response {
    let requirements = route_requirements(state, headers, route);
    (
        StatusCode::PAYMENT_REQUIRED,
        Json(PaymentRequired::new(error, requirements)),
    )
        .into_response()
}

/// Runs `service` only after the payment header verifies, and settles only after
/// the service succeeded. A failed service is never charged.
pub(super) async fn paid<T, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    ip: IpAddr,
    route: PaidRoute,
    service: impl FnOnce() -> Fut,
) -> Response
where
    T: Serialize,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let Some(header) = payment_header(headers) else {
        if let Some(limiter) = &state.unpaid {
            if limiter.check_key(&ip).is_err() {
                warn!(%ip, path = route.path, "unpaid request rate limited");
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorResponse::new("Too many requests without payment")),
                )
                    .into_response();
            }
        }
        return payment_required("X-PAYMENT header is required", state, headers, &route);
    };

    let requirements = route_requirements(state, headers, &route);
    if let Err(err) = state.gate.verify(header, &requirements).await {
        warn!(%ip, path = route.path, %err, "payment verification failed");
        return payment_required(err.to_string(), state, headers, &route);
    }

    let body = match service().await {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };

    match state.gate.settle(header, &requirements).await {
        Ok(settlement) => {
            let mut response = Json(body).into_response();
            match settlement.to_header().map(HeaderValue::try_from) {
                Ok(Ok(value)) => {
                    response
                        .headers_mut()
                        .insert(HeaderName::from_static(X_PAYMENT_RESPONSE_HEADER), value);
                }
                _ => warn!(path = route.path, "could not encode settlement header"),
            }
            response
        }
        Err(err) => {
            error!(%ip, path = route.path, %err, "payment settlement failed after execution");
            payment_required(err.to_string(), state, headers, &route)
        }
    }
}
