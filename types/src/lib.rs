//! Common types used throughout the lotero relay agent.
//!
//! Everything here is a read-derived snapshot: the chain is the source of truth and
//! nothing in this crate is persisted. Monetary values are [`rust_decimal::Decimal`]
//! in human units (USDC, ETH, LINK), never floating point.

pub mod alert;
pub mod amount;
pub mod api;
pub mod state;
pub mod thresholds;

pub use alert::{Alert, Severity};
pub use amount::format_amount;
pub use state::{
    ContractState, DevFees, PaymentMode, RoundInfo, SubscriptionState, UserAccount, WalletState,
};
pub use thresholds::{ThresholdError, Thresholds};

/// Decimals of the stable token (USDC).
pub const STABLE_DECIMALS: u32 = 6;

/// Decimals of the chain's native currency (ETH).
pub const NATIVE_DECIMALS: u32 = 18;

/// Decimals of the LINK token funding the randomness subscription.
pub const LINK_DECIMALS: u32 = 18;
