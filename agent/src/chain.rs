//! Chain client boundary.
//!
//! Every read returns a typed snapshot in human units; every write is awaited to a
//! receipt before returning. Implementations must serialize writes from one signer.

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use ethers::utils::to_checksum;
use lotero_types::{ContractState, DevFees, RoundInfo, SubscriptionState, UserAccount, WalletState};
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("{call} timed out after {}s", .after.as_secs())]
    Timeout { call: &'static str, after: Duration },
    #[error("transaction {0:#x} reverted")]
    Reverted(H256),
    #[error("transaction {0:#x} dropped before inclusion")]
    MissingReceipt(H256),
    #[error("value out of range: {0}")]
    Conversion(String),
}

/// Result of a submitted play-for transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpinSubmission {
    pub tx_hash: H256,
    /// Request id from the `SpinRequested` event, if the receipt carried one.
    pub request_id: Option<U256>,
}

#[async_trait]
pub trait Chain: Send + Sync + 'static {
    /// Signing account that pays gas, fronts bets and holds the treasury.
    fn executor(&self) -> Address;

    fn slot_machine(&self) -> Address;

    async fn native_balance(&self, who: Address) -> Result<Decimal, ChainError>;

    async fn stable_balance(&self, who: Address) -> Result<Decimal, ChainError>;

    async fn stable_allowance(&self, owner: Address, spender: Address)
        -> Result<Decimal, ChainError>;

    async fn contract_state(&self) -> Result<ContractState, ChainError>;

    async fn is_closed(&self) -> Result<bool, ChainError>;

    async fn uses_native_payment(&self) -> Result<bool, ChainError>;

    async fn user_account(&self, user: Address) -> Result<UserAccount, ChainError>;

    async fn dev_fees(&self) -> Result<DevFees, ChainError>;

    async fn subscription(&self, id: U256) -> Result<SubscriptionState, ChainError>;

    /// Resolved flag and stored round for a spin request.
    async fn round(&self, request_id: U256) -> Result<(bool, RoundInfo), ChainError>;

    async fn approve_stable_max(&self, spender: Address) -> Result<H256, ChainError>;

    /// Moves `amount` stable tokens from the executor into the slot machine bankroll.
    async fn deposit(&self, amount: Decimal) -> Result<H256, ChainError>;

    async fn spin_for(
        &self,
        player: Address,
        referral: Address,
        amount: Decimal,
    ) -> Result<SpinSubmission, ChainError>;

    async fn claim_player_earnings(&self, user: Address) -> Result<H256, ChainError>;

    async fn claim_dev_earnings(&self) -> Result<H256, ChainError>;
}

/// Reads both executor balances concurrently.
pub async fn wallet_state(chain: &dyn Chain, who: Address) -> Result<WalletState, ChainError> {
    let (native_balance, stable_balance) =
        futures::try_join!(chain.native_balance(who), chain.stable_balance(who))?;
    Ok(WalletState {
        native_balance,
        stable_balance,
    })
}

/// Parses a hex address, accepting an optional `0x` prefix. Mixed-case input must
/// carry a valid EIP-55 checksum.
pub fn parse_address(raw: &str) -> Option<Address> {
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let address: Address = format!("0x{hex}").parse().ok()?;
    let has_lower = hex.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper && &to_checksum(&address, None)[2..] != hex {
        return None;
    }
    Some(address)
}

pub fn format_hash(hash: H256) -> String {
    format!("{hash:#x}")
}

pub fn format_address(address: Address) -> String {
    to_checksum(&address, None)
}
