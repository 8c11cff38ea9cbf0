use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State as AxumState},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ethers::types::U256;
use lotero_types::{
    api::{
        BalancesResponse, ClaimableResponse, ContractHealth, ContractSnapshot, Endpoint,
        ErrorResponse, ExecutorSnapshot, RoundResponse, RoundView, ServiceInfo,
    },
    format_amount,
};
use serde::{de::DeserializeOwned, Deserialize};
use std::net::SocketAddr;
use tracing::{error, warn};

use super::{
    client_ip,
    paywall::{paid, PaidRoute},
    AppState, CLAIM_PATH, SPIN_PATH,
};
use crate::{
    chain::{format_address, parse_address},
    claim::{execute_claim, ClaimError},
    gate::{assess_claim, assess_spin, BlockReason},
    spin::{execute_spin, SpinError},
    treasury::reconcile,
};

/// A non-2xx response with a JSON error body.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse::new(error),
        }
    }

    fn with_details(status: StatusCode, error: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            status,
            body: ErrorResponse::with_details(error, details),
        }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SpinError> for ApiError {
    fn from(err: SpinError) -> Self {
        match err {
            SpinError::InvalidPlayer => Self::bad_request("Invalid player address"),
            SpinError::Unhealthy(reasons) => Self::with_details(
                StatusCode::SERVICE_UNAVAILABLE,
                "Contract unhealthy",
                reasons,
            ),
            SpinError::Unreachable(reason) => Self::with_details(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Chain unreachable",
                vec![reason],
            ),
            err @ SpinError::MissingRequestId(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            SpinError::Chain(err) => {
                error!(%err, "spin transaction failed");
                Self::with_details(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Spin failed",
                    vec![err.to_string()],
                )
            }
        }
    }
}

impl From<ClaimError> for ApiError {
    fn from(err: ClaimError) -> Self {
        match err {
            ClaimError::InvalidUser => Self::bad_request("Invalid user address"),
            err @ ClaimError::NothingToClaim => Self::bad_request(err.to_string()),
            err @ ClaimError::ExecutorInsufficient { .. } => Self::with_details(
                StatusCode::SERVICE_UNAVAILABLE,
                "Executor insufficient",
                vec![err.to_string()],
            ),
            ClaimError::Unreachable(err) => Self::with_details(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Chain unreachable",
                vec![err.to_string()],
            ),
            ClaimError::Chain(err) => {
                error!(%err, "claim transaction failed");
                Self::with_details(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Claim failed",
                    vec![err.to_string()],
                )
            }
        }
    }
}

#[derive(Deserialize)]
pub(super) struct SpinRequest {
    player: String,
    #[serde(default)]
    referral: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct ClaimRequest {
    user: String,
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| {
        ApiError::with_details(
            StatusCode::BAD_REQUEST,
            "Invalid request body",
            vec![err.to_string()],
        )
    })
}

pub(super) async fn spin(
    AxumState(state): AxumState<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let route = PaidRoute {
        path: SPIN_PATH,
        price: state.payment.spin_price,
        description: "One slot machine spin with a 1 USDC bet",
    };
    let agent = state.agent.clone();
    paid(&state, &headers, ip, route, || async move {
        let request: SpinRequest = parse_body(&body)?;
        Ok::<_, ApiError>(
            execute_spin(&agent, &request.player, request.referral.as_deref()).await?,
        )
    })
    .await
}

pub(super) async fn claim(
    AxumState(state): AxumState<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let route = PaidRoute {
        path: CLAIM_PATH,
        price: state.payment.claim_price,
        description: "Gasless claim of all unclaimed earnings",
    };
    let agent = state.agent.clone();
    paid(&state, &headers, ip, route, || async move {
        let request: ClaimRequest = parse_body(&body)?;
        Ok::<_, ApiError>(execute_claim(&agent, &request.user).await?)
    })
    .await
}

pub(super) async fn service_info(AxumState(state): AxumState<AppState>) -> Response {
    let endpoint = |method, path, price: Option<String>, description| Endpoint {
        method,
        path,
        price,
        description,
    };
    Json(ServiceInfo {
        name: "lotero-agent",
        version: env!("CARGO_PKG_VERSION"),
        network: state.payment.network.clone(),
        slot_machine: format_address(state.agent.chain.slot_machine()),
        endpoints: vec![
            endpoint(
                "POST",
                SPIN_PATH,
                Some(format_amount(state.payment.spin_price)),
                "Spin the slot machine for a player",
            ),
            endpoint(
                "POST",
                CLAIM_PATH,
                Some(format_amount(state.payment.claim_price)),
                "Claim a player's earnings without gas",
            ),
            endpoint("GET", "/round/:requestId", None, "Round result by request id"),
            endpoint("GET", "/player/:address/balances", None, "Player account record"),
            endpoint("GET", "/player/:address/claimable", None, "Claim eligibility"),
            endpoint("GET", "/contract/health", None, "Spin eligibility and balances"),
            endpoint("GET", "/cron/health", None, "Run one treasury reconciliation pass"),
        ],
    })
    .into_response()
}

pub(super) async fn round(
    AxumState(state): AxumState<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    let Ok(id) = U256::from_dec_str(request_id.trim()) else {
        return ApiError::bad_request("Invalid request id").into_response();
    };
    match state.agent.chain.round(id).await {
        Ok((resolved, round)) => Json(RoundResponse {
            request_id: id.to_string(),
            resolved,
            round: RoundView::from(&round),
        })
        .into_response(),
        Err(err) => {
            warn!(request_id = %id, %err, "round read failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

pub(super) async fn balances(
    AxumState(state): AxumState<AppState>,
    Path(address): Path<String>,
) -> Response {
    let Some(user) = parse_address(&address) else {
        return ApiError::bad_request("Invalid address").into_response();
    };
    match state.agent.chain.user_account(user).await {
        Ok(account) => Json(BalancesResponse::new(format_address(user), &account)).into_response(),
        Err(err) => {
            warn!(user = %format_address(user), %err, "account read failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Reports every claim check, closure included. Only a missing gas float is a 503:
/// claims still go through while spins are paused, and an empty balance is the
/// player's state, not ours.
pub(super) async fn claimable(
    AxumState(state): AxumState<AppState>,
    Path(address): Path<String>,
) -> Response {
    let Some(user) = parse_address(&address) else {
        return ApiError::bad_request("Invalid address").into_response();
    };
    let assessment = assess_claim(&state.agent, user).await;
    let eligibility = &assessment.eligibility;
    let status = if eligibility.is_unreachable() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else if eligibility
        .reasons
        .iter()
        .any(|reason| matches!(reason, BlockReason::GasTooLow { .. }))
    {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = ClaimableResponse {
        user: format_address(user),
        ok: eligibility.ok(),
        reasons: eligibility.messages(),
        claimable: assessment
            .account
            .as_ref()
            .map(|account| format_amount(account.claimable())),
    };
    (status, Json(body)).into_response()
}

pub(super) async fn contract_health(AxumState(state): AxumState<AppState>) -> Response {
    let chain = state.agent.chain.as_ref();
    let assessment = assess_spin(&state.agent).await;
    let eligibility = &assessment.eligibility;
    let status = if eligibility.ok() {
        StatusCode::OK
    } else if eligibility.is_unreachable() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ContractHealth {
        ok: eligibility.ok(),
        reasons: eligibility.messages(),
        contract: assessment.contract.map(|contract| ContractSnapshot {
            address: format_address(chain.slot_machine()),
            is_closed: contract.is_closed,
            bankroll: format_amount(contract.available_bankroll()),
            current_debt: format_amount(contract.outstanding_debt),
            max_bet: format_amount(contract.max_single_bet),
            payment_mode: contract.payment_mode(),
        }),
        executor: assessment.executor.map(|wallet| ExecutorSnapshot {
            address: format_address(chain.executor()),
            native: format_amount(wallet.native_balance),
            stable: format_amount(wallet.stable_balance),
        }),
    };
    (status, Json(body)).into_response()
}

pub(super) async fn cron_health(AxumState(state): AxumState<AppState>) -> Response {
    match reconcile(&state.agent).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(%err, "reconciliation pass failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
