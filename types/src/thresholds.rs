//! Static threshold table driving the validation gate and the treasury loop.
//!
//! All values are human units. The table is loaded once at startup (defaults below,
//! optionally overridden from a YAML file) and never mutated afterwards.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Price in USD for one spin, charged through x402.
pub const SPIN_PRICE_USD: Decimal = dec!(1.05);

/// Price in USD for a gasless claim, charged through x402.
pub const CLAIM_PRICE_USD: Decimal = dec!(0.5);

/// Bet the executor advances for the player on every spin.
pub const SPIN_BET_USDC: Decimal = dec!(1);

/// Available bankroll needed to cover the maximum prize (30x the bet).
pub const CONTRACT_MIN_AVAILABLE_BANKROLL_USDC: Decimal = dec!(30);

/// Bankroll below this means the contract needs funding.
pub const CONTRACT_TOPUP_TRIGGER_BANKROLL_USDC: Decimal = dec!(60);

/// Transfers are capped so the bankroll never exceeds this.
pub const CONTRACT_TARGET_BANKROLL_USDC: Decimal = dec!(90);

pub const EXECUTOR_MIN_USDC_FOR_SPIN: Decimal = dec!(1);

/// Gas floor for spin and claim transactions.
pub const EXECUTOR_MIN_ETH: Decimal = dec!(0.001);

pub const WALLET_MIN_ETH_TRIGGER: Decimal = dec!(0.01);
pub const WALLET_TARGET_ETH: Decimal = dec!(0.05);

/// Stable balance the wallet always keeps when topping up the contract.
pub const WALLET_MIN_USDC_BUFFER: Decimal = dec!(10);
pub const WALLET_TARGET_USDC_BUFFER: Decimal = dec!(20);

/// Minimum wallet excess over the buffer before reinforcing a below-target bankroll.
pub const WALLET_EXCESS_MIN_FOR_CONTRACT_USDC: Decimal = dec!(5);

pub const VRF_MIN_LINK_FOR_SPIN: Decimal = dec!(0.3);
pub const VRF_MIN_NATIVE_FOR_SPIN: Decimal = dec!(0.001);
pub const VRF_MIN_LINK_TRIGGER: Decimal = dec!(0.31);
pub const VRF_TARGET_LINK: Decimal = dec!(1);
pub const VRF_MIN_NATIVE_TRIGGER: Decimal = dec!(0.01);
pub const VRF_TARGET_NATIVE: Decimal = dec!(0.05);

/// Pending dev fees needed before sweeping them to the wallet.
pub const DEV_CLAIM_MIN_USDC: Decimal = dec!(5);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    pub spin_price_usd: Decimal,
    pub claim_price_usd: Decimal,
    pub spin_bet: Decimal,
    pub contract_min_available_bankroll: Decimal,
    pub contract_topup_trigger_bankroll: Decimal,
    pub contract_target_bankroll: Decimal,
    pub executor_min_stable_for_spin: Decimal,
    pub executor_min_native: Decimal,
    pub wallet_min_native_trigger: Decimal,
    pub wallet_target_native: Decimal,
    pub wallet_min_stable_buffer: Decimal,
    pub wallet_target_stable_buffer: Decimal,
    pub wallet_excess_min_for_contract: Decimal,
    pub vrf_min_link_for_spin: Decimal,
    pub vrf_min_native_for_spin: Decimal,
    pub vrf_min_link_trigger: Decimal,
    pub vrf_target_link: Decimal,
    pub vrf_min_native_trigger: Decimal,
    pub vrf_target_native: Decimal,
    pub dev_claim_min: Decimal,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            spin_price_usd: SPIN_PRICE_USD,
            claim_price_usd: CLAIM_PRICE_USD,
            spin_bet: SPIN_BET_USDC,
            contract_min_available_bankroll: CONTRACT_MIN_AVAILABLE_BANKROLL_USDC,
            contract_topup_trigger_bankroll: CONTRACT_TOPUP_TRIGGER_BANKROLL_USDC,
            contract_target_bankroll: CONTRACT_TARGET_BANKROLL_USDC,
            executor_min_stable_for_spin: EXECUTOR_MIN_USDC_FOR_SPIN,
            executor_min_native: EXECUTOR_MIN_ETH,
            wallet_min_native_trigger: WALLET_MIN_ETH_TRIGGER,
            wallet_target_native: WALLET_TARGET_ETH,
            wallet_min_stable_buffer: WALLET_MIN_USDC_BUFFER,
            wallet_target_stable_buffer: WALLET_TARGET_USDC_BUFFER,
            wallet_excess_min_for_contract: WALLET_EXCESS_MIN_FOR_CONTRACT_USDC,
            vrf_min_link_for_spin: VRF_MIN_LINK_FOR_SPIN,
            vrf_min_native_for_spin: VRF_MIN_NATIVE_FOR_SPIN,
            vrf_min_link_trigger: VRF_MIN_LINK_TRIGGER,
            vrf_target_link: VRF_TARGET_LINK,
            vrf_min_native_trigger: VRF_MIN_NATIVE_TRIGGER,
            vrf_target_native: VRF_TARGET_NATIVE,
            dev_claim_min: DEV_CLAIM_MIN_USDC,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThresholdError {
    #[error("threshold {0} must not be negative")]
    Negative(&'static str),
    #[error("threshold {low} ({low_value}) must not exceed {high} ({high_value})")]
    Inverted {
        low: &'static str,
        low_value: Decimal,
        high: &'static str,
        high_value: Decimal,
    },
}

impl Thresholds {
    /// Rejects tables the treasury loop cannot act on sensibly.
    pub fn validate(&self) -> Result<(), ThresholdError> {
        let named = [
            ("spin_price_usd", self.spin_price_usd),
            ("claim_price_usd", self.claim_price_usd),
            ("spin_bet", self.spin_bet),
            ("contract_min_available_bankroll", self.contract_min_available_bankroll),
            ("contract_topup_trigger_bankroll", self.contract_topup_trigger_bankroll),
            ("contract_target_bankroll", self.contract_target_bankroll),
            ("executor_min_stable_for_spin", self.executor_min_stable_for_spin),
            ("executor_min_native", self.executor_min_native),
            ("wallet_min_native_trigger", self.wallet_min_native_trigger),
            ("wallet_target_native", self.wallet_target_native),
            ("wallet_min_stable_buffer", self.wallet_min_stable_buffer),
            ("wallet_target_stable_buffer", self.wallet_target_stable_buffer),
            ("wallet_excess_min_for_contract", self.wallet_excess_min_for_contract),
            ("vrf_min_link_for_spin", self.vrf_min_link_for_spin),
            ("vrf_min_native_for_spin", self.vrf_min_native_for_spin),
            ("vrf_min_link_trigger", self.vrf_min_link_trigger),
            ("vrf_target_link", self.vrf_target_link),
            ("vrf_min_native_trigger", self.vrf_min_native_trigger),
            ("vrf_target_native", self.vrf_target_native),
            ("dev_claim_min", self.dev_claim_min),
        ];
        if let Some((name, _)) = named.iter().find(|(_, value)| value.is_sign_negative()) {
            return Err(ThresholdError::Negative(*name));
        }

        let ordered = [
            (
                ("contract_topup_trigger_bankroll", self.contract_topup_trigger_bankroll),
                ("contract_target_bankroll", self.contract_target_bankroll),
            ),
            (
                ("wallet_min_stable_buffer", self.wallet_min_stable_buffer),
                ("wallet_target_stable_buffer", self.wallet_target_stable_buffer),
            ),
            (
                ("wallet_min_native_trigger", self.wallet_min_native_trigger),
                ("wallet_target_native", self.wallet_target_native),
            ),
            (
                ("vrf_min_link_trigger", self.vrf_min_link_trigger),
                ("vrf_target_link", self.vrf_target_link),
            ),
            (
                ("vrf_min_native_trigger", self.vrf_min_native_trigger),
                ("vrf_target_native", self.vrf_target_native),
            ),
        ];
        for ((low, low_value), (high, high_value)) in ordered {
            if low_value > high_value {
                return Err(ThresholdError::Inverted {
                    low,
                    low_value,
                    high,
                    high_value,
                });
            }
        }
        Ok(())
    }
}
