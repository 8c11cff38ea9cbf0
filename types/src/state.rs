use rust_decimal::Decimal;
use serde::Serialize;

/// Balances of the executor wallet. Fetched fresh at the start of every pass and
/// after every mutating action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    pub native_balance: Decimal,
    pub stable_balance: Decimal,
}

/// Slot machine state as reported by the contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractState {
    pub total_deposited: Decimal,
    pub outstanding_debt: Decimal,
    pub is_closed: bool,
    pub uses_native_randomness_payment: bool,
    pub max_single_bet: Decimal,
}

impl ContractState {
    /// Money in the contract not already owed to players, floored at zero.
    pub fn available_bankroll(&self) -> Decimal {
        (self.total_deposited - self.outstanding_debt).max(Decimal::ZERO)
    }

    pub fn payment_mode(&self) -> PaymentMode {
        if self.uses_native_randomness_payment {
            PaymentMode::Native
        } else {
            PaymentMode::Link
        }
    }
}

/// Currency the randomness subscription is billed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    Link,
    Native,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Link => "link",
            PaymentMode::Native => "native",
        }
    }
}

/// Balances of the randomness subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionState {
    pub link_balance: Decimal,
    pub native_balance: Decimal,
}

impl SubscriptionState {
    pub fn balance_for(&self, mode: PaymentMode) -> Decimal {
        match mode {
            PaymentMode::Link => self.link_balance,
            PaymentMode::Native => self.native_balance,
        }
    }
}

/// Per-user record kept by the slot machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub total_deposited: Decimal,
    pub total_earned: Decimal,
    pub total_claimed: Decimal,
    pub is_active: bool,
    pub referrer: String,
    pub referral_earned: Decimal,
    pub referral_claimed: Decimal,
}

impl UserAccount {
    /// Unclaimed play winnings plus unclaimed referral earnings.
    pub fn claimable(&self) -> Decimal {
        (self.total_earned - self.total_claimed) + (self.referral_earned - self.referral_claimed)
    }
}

/// Developer fee counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DevFees {
    pub earned: Decimal,
    pub claimed: Decimal,
}

impl DevFees {
    pub fn pending(&self) -> Decimal {
        (self.earned - self.claimed).max(Decimal::ZERO)
    }
}

/// A spin round as stored by the slot machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundInfo {
    pub user_address: String,
    pub number1: u8,
    pub number2: u8,
    pub number3: u8,
    pub value: Decimal,
    pub has_won: bool,
    pub prize: Decimal,
}
