//! x402 payment boundary.
//!
//! Paid routes quote [`PaymentRequirements`], verify the client's signed payload
//! with a facilitator before running the service, and settle it only after the
//! service succeeded.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use ethers::types::Address;
use lotero_types::STABLE_DECIMALS;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::chain::format_address;

pub const X402_VERSION: u8 = 1;
pub const PAYMENT_TIMEOUT_SECS: u64 = 300;

/// EIP-712 domain of USDC, needed by clients to sign `transferWithAuthorization`.
const STABLE_TOKEN_NAME: &str = "USD Coin";
const STABLE_TOKEN_VERSION: &str = "2";

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment rejected: {0}")]
    Invalid(String),
    #[error("malformed payment header")]
    Malformed,
    #[error("facilitator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("facilitator returned {status}: {body}")]
    Facilitator { status: u16, body: String },
}

#[derive(Clone, Debug)]
pub struct PaymentConfig {
    pub pay_to: Address,
    /// Token the payment is made in.
    pub asset: Address,
    /// CAIP-2 network id, e.g. `eip155:8453`.
    pub network: String,
    pub facilitator_url: String,
    pub facilitator_auth_token: Option<String>,
    /// Upper bound on one verify or settle round trip.
    pub facilitator_timeout: Duration,
    /// Externally visible origin, e.g. `https://agent.example.com`. When unset the
    /// origin is taken from the request's host headers.
    pub public_url: Option<String>,
    pub spin_price: Decimal,
    pub claim_price: Decimal,
}

impl PaymentConfig {
    /// Absolute URL of `path`, or the bare path when no origin is known.
    pub fn resource_url(&self, request_origin: Option<&str>, path: &str) -> String {
        match self.public_url.as_deref().or(request_origin) {
            Some(origin) => format!("{}{path}", origin.trim_end_matches('/')),
            None => path.to_string(),
        }
    }

    pub fn requirements(
        &self,
        resource: &str,
        price: Decimal,
        description: &str,
    ) -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".to_string(),
            network: self.network.clone(),
            max_amount_required: atomic_amount(price),
            resource: resource.to_string(),
            description: description.to_string(),
            mime_type: "application/json".to_string(),
            pay_to: format_address(self.pay_to),
            max_timeout_seconds: PAYMENT_TIMEOUT_SECS,
            asset: format_address(self.asset),
            extra: TokenDomain {
                name: STABLE_TOKEN_NAME.to_string(),
                version: STABLE_TOKEN_VERSION.to_string(),
            },
        }
    }
}

/// Price in stable token base units, e.g. `1.05` -> `"1050000"`.
pub fn atomic_amount(price: Decimal) -> String {
    let scale = Decimal::from(10u64.pow(STABLE_DECIMALS));
    (price * scale).trunc().normalize().to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDomain {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
    pub extra: TokenDomain,
}

/// Body of a 402 response.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: u8,
    pub error: String,
    pub accepts: Vec<PaymentRequirements>,
}

impl PaymentRequired {
    pub fn new(error: impl Into<String>, requirements: PaymentRequirements) -> Self {
        Self {
            x402_version: X402_VERSION,
            error: error.into(),
            accepts: vec![requirements],
        }
    }
}

/// Facilitator settlement result, echoed to the client in `x-payment-response`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl Settlement {
    /// Base64 JSON form used in the response header.
    pub fn to_header(&self) -> Result<String, serde_json::Error> {
        Ok(general_purpose::STANDARD.encode(serde_json::to_vec(self)?))
    }
}

#[async_trait]
pub trait PaymentGate: Send + Sync + 'static {
    /// Checks the payment header against the requirements without moving funds.
    async fn verify(
        &self,
        header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<(), PaymentError>;

    /// Executes the verified payment.
    async fn settle(
        &self,
        header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement, PaymentError>;
}

/// Decodes the base64 JSON payment payload carried in the request header.
pub fn decode_payment_header(header: &str) -> Result<Value, PaymentError> {
    let raw = general_purpose::STANDARD
        .decode(header.trim())
        .map_err(|_| PaymentError::Malformed)?;
    let payload: Value = serde_json::from_slice(&raw).map_err(|_| PaymentError::Malformed)?;
    if !payload.is_object() {
        return Err(PaymentError::Malformed);
    }
    Ok(payload)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FacilitatorRequest<'a> {
    x402_version: u64,
    payment_payload: Value,
    payment_requirements: &'a PaymentRequirements,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    is_valid: bool,
    #[serde(default)]
    invalid_reason: Option<String>,
    #[serde(default)]
    payer: Option<String>,
}

/// Verifies and settles through an x402 facilitator over HTTP.
pub struct FacilitatorGate {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl FacilitatorGate {
    pub fn new(config: &PaymentConfig) -> Result<Self, PaymentError> {
        let client = reqwest::Client::builder()
            .timeout(config.facilitator_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.facilitator_url.trim_end_matches('/').to_string(),
            auth_token: config.facilitator_auth_token.clone(),
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<T, PaymentError> {
        let payment_payload = decode_payment_header(header)?;
        let x402_version = payment_payload
            .get("x402Version")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(X402_VERSION));
        let mut request = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .json(&FacilitatorRequest {
                x402_version,
                payment_payload,
                payment_requirements: requirements,
            });
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Facilitator {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentGate for FacilitatorGate {
    async fn verify(
        &self,
        header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<(), PaymentError> {
        let response: VerifyResponse = self.post("verify", header, requirements).await?;
        if !response.is_valid {
            return Err(PaymentError::Invalid(
                response
                    .invalid_reason
                    .unwrap_or_else(|| "invalid payment".to_string()),
            ));
        }
        debug!(
            payer = response.payer.as_deref().unwrap_or("unknown"),
            resource = %requirements.resource,
            "payment verified"
        );
        Ok(())
    }

    async fn settle(
        &self,
        header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement, PaymentError> {
        let settlement: Settlement = self.post("settle", header, requirements).await?;
        if !settlement.success {
            return Err(PaymentError::Invalid(
                settlement
                    .error_reason
                    .unwrap_or_else(|| "settlement failed".to_string()),
            ));
        }
        Ok(settlement)
    }
}
