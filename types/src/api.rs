//! JSON payloads returned by the agent's HTTP surface.
//!
//! Amounts are rendered with [`format_amount`](crate::format_amount) so clients see
//! `"3.0"` rather than the raw decimal scale.

use crate::{amount::format_amount, Alert, PaymentMode, RoundInfo, Severity, UserAccount};
use serde::Serialize;

/// Status reported for a submitted spin whose outcome resolves later on-chain.
pub const SPIN_STATUS_PENDING: &str = "pending";

/// Status reported for a confirmed claim.
pub const CLAIM_STATUS_CLAIMED: &str = "claimed";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpinReceipt {
    pub request_id: String,
    pub tx_hash: String,
    pub status: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    pub user: String,
    pub amount: String,
    pub tx_hash: String,
    pub status: &'static str,
}

/// Body of every non-2xx response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details),
        }
    }
}

/// A balance compared against a floor and a refill target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Level {
    pub value: String,
    pub ok: bool,
    pub min: String,
    pub target: String,
}

/// The wallet's stable balance compared against its safety buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferLevel {
    pub value: String,
    pub ok: bool,
    pub min_buffer: String,
    pub target_buffer: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WalletReport {
    pub address: String,
    pub native: Level,
    pub stable: BufferLevel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractReport {
    pub address: String,
    pub is_closed: bool,
    pub total_deposited: String,
    pub current_debt: String,
    pub bankroll: String,
    pub max_bet: String,
    pub min_trigger: String,
    pub target: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VrfReport {
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_mode: Option<PaymentMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<Level>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<Level>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    /// Emergency funding of a closed or under-trigger contract.
    TopUp,
    /// Opportunistic funding of a bankroll below target.
    Reinforce,
    /// Developer fee sweep into the wallet.
    DevClaim,
}

/// A write attempted during a reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreasuryAction {
    pub kind: ActionKind,
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AlertDigest {
    pub severity: Severity,
    pub key: &'static str,
}

impl From<&Alert> for AlertDigest {
    fn from(alert: &Alert) -> Self {
        Self {
            severity: alert.severity,
            key: alert.key,
        }
    }
}

/// Snapshot returned by one reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreasuryReport {
    pub timestamp: String,
    pub network: String,
    pub wallet: WalletReport,
    pub contract: ContractReport,
    pub vrf: VrfReport,
    pub actions: Vec<TreasuryAction>,
    pub alerts: Vec<AlertDigest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesResponse {
    pub address: String,
    pub total_deposited: String,
    pub total_earned: String,
    pub total_claimed: String,
    pub is_active: bool,
    pub referrer: String,
    pub referral_earned: String,
    pub referral_claimed: String,
    pub claimable: String,
}

impl BalancesResponse {
    pub fn new(address: String, account: &UserAccount) -> Self {
        Self {
            address,
            total_deposited: format_amount(account.total_deposited),
            total_earned: format_amount(account.total_earned),
            total_claimed: format_amount(account.total_claimed),
            is_active: account.is_active,
            referrer: account.referrer.clone(),
            referral_earned: format_amount(account.referral_earned),
            referral_claimed: format_amount(account.referral_claimed),
            claimable: format_amount(account.claimable()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundView {
    pub user_address: String,
    pub numbers: [u8; 3],
    pub value: String,
    pub has_won: bool,
    pub prize: String,
}

impl From<&RoundInfo> for RoundView {
    fn from(round: &RoundInfo) -> Self {
        Self {
            user_address: round.user_address.clone(),
            numbers: [round.number1, round.number2, round.number3],
            value: format_amount(round.value),
            has_won: round.has_won,
            prize: format_amount(round.prize),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResponse {
    pub request_id: String,
    pub resolved: bool,
    pub round: RoundView,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClaimableResponse {
    pub user: String,
    pub ok: bool,
    pub reasons: Vec<String>,
    pub claimable: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSnapshot {
    pub address: String,
    pub is_closed: bool,
    pub bankroll: String,
    pub current_debt: String,
    pub max_bet: String,
    pub payment_mode: PaymentMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutorSnapshot {
    pub address: String,
    pub native: String,
    pub stable: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContractHealth {
    pub ok: bool,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract: Option<ContractSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub method: &'static str,
    pub path: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub description: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub network: String,
    pub slot_machine: String,
    pub endpoints: Vec<Endpoint>,
}
