//! Pre-flight solvency checks shared by spin and claim.
//!
//! The `check_*` functions are pure over a snapshot and report every failing
//! condition in a fixed order. The `assess_*` functions gather that snapshot and
//! fail closed: when a required read errors, the result carries a single
//! [`BlockReason::Unreachable`] and no write may follow.

use crate::{chain::wallet_state, Agent};
use ethers::types::Address;
use lotero_types::{
    ContractState, PaymentMode, SubscriptionState, Thresholds, UserAccount, WalletState,
};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BlockReason {
    #[error("Contract is closed")]
    ContractClosed,
    #[error("Available bankroll too low (need >= {min} USDC to pay max prize)")]
    BankrollTooLow { min: Decimal },
    #[error("Executor ETH too low for gas (need >= {min} ETH)")]
    GasTooLow { min: Decimal },
    #[error("Executor USDC too low (need >= {min} USDC to execute spin)")]
    StableTooLow { min: Decimal },
    #[error("VRF subscription native balance too low (need >= {min} ETH)")]
    SubscriptionNativeLow { min: Decimal },
    #[error("VRF subscription LINK balance too low (need >= {min} LINK)")]
    SubscriptionLinkLow { min: Decimal },
    #[error("VRF subscription check failed: {0}")]
    SubscriptionUnreadable(String),
    #[error("Nothing to claim; user has already claimed all earnings")]
    NothingToClaim,
    #[error("Chain unreachable: {0}")]
    Unreachable(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Eligibility {
    pub reasons: Vec<BlockReason>,
}

impl Eligibility {
    pub fn ok(&self) -> bool {
        self.reasons.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }

    /// True when the verdict came from a failed read rather than from chain state.
    pub fn is_unreachable(&self) -> bool {
        self.reasons
            .iter()
            .any(|reason| matches!(reason, BlockReason::Unreachable(_)))
    }

    fn unreachable(err: impl ToString) -> Self {
        Self {
            reasons: vec![BlockReason::Unreachable(err.to_string())],
        }
    }
}

/// Spin checks, in order: contract open, bankroll, executor gas, executor stable
/// balance, randomness subscription (only when one is configured).
pub fn check_spin(
    thresholds: &Thresholds,
    contract: &ContractState,
    executor: &WalletState,
    subscription: Option<&Result<SubscriptionState, String>>,
) -> Eligibility {
    let mut reasons = Vec::new();
    if contract.is_closed {
        reasons.push(BlockReason::ContractClosed);
    }
    if contract.available_bankroll() < thresholds.contract_min_available_bankroll {
        reasons.push(BlockReason::BankrollTooLow {
            min: thresholds.contract_min_available_bankroll,
        });
    }
    if executor.native_balance < thresholds.executor_min_native {
        reasons.push(BlockReason::GasTooLow {
            min: thresholds.executor_min_native,
        });
    }
    if executor.stable_balance < thresholds.executor_min_stable_for_spin {
        reasons.push(BlockReason::StableTooLow {
            min: thresholds.executor_min_stable_for_spin,
        });
    }
    match subscription {
        None => {}
        Some(Err(err)) => reasons.push(BlockReason::SubscriptionUnreadable(err.clone())),
        Some(Ok(balances)) => match contract.payment_mode() {
            PaymentMode::Native if balances.native_balance < thresholds.vrf_min_native_for_spin => {
                reasons.push(BlockReason::SubscriptionNativeLow {
                    min: thresholds.vrf_min_native_for_spin,
                })
            }
            PaymentMode::Link if balances.link_balance < thresholds.vrf_min_link_for_spin => {
                reasons.push(BlockReason::SubscriptionLinkLow {
                    min: thresholds.vrf_min_link_for_spin,
                })
            }
            _ => {}
        },
    }
    Eligibility { reasons }
}

/// Claim checks, in order: contract open, executor gas, something to claim.
pub fn check_claim(
    thresholds: &Thresholds,
    account: &UserAccount,
    contract_closed: bool,
    executor_native: Decimal,
) -> Eligibility {
    let mut reasons = Vec::new();
    if contract_closed {
        reasons.push(BlockReason::ContractClosed);
    }
    if executor_native < thresholds.executor_min_native {
        reasons.push(BlockReason::GasTooLow {
            min: thresholds.executor_min_native,
        });
    }
    if account.claimable() <= Decimal::ZERO {
        reasons.push(BlockReason::NothingToClaim);
    }
    Eligibility { reasons }
}

/// Snapshot gathered for a spin verdict. The states are absent when the verdict is
/// unreachable.
#[derive(Clone, Debug)]
pub struct SpinAssessment {
    pub eligibility: Eligibility,
    pub contract: Option<ContractState>,
    pub executor: Option<WalletState>,
}

pub async fn assess_spin(agent: &Agent) -> SpinAssessment {
    let chain = agent.chain.as_ref();
    let subscription = async {
        match agent.settings.subscription_id {
            Some(id) => Some(chain.subscription(id).await.map_err(|err| err.to_string())),
            None => None,
        }
    };
    let (contract, executor, subscription) = futures::join!(
        chain.contract_state(),
        wallet_state(chain, chain.executor()),
        subscription
    );
    let (contract, executor) = match (contract, executor) {
        (Ok(contract), Ok(executor)) => (contract, executor),
        (Err(err), _) | (_, Err(err)) => {
            return SpinAssessment {
                eligibility: Eligibility::unreachable(err),
                contract: None,
                executor: None,
            }
        }
    };
    SpinAssessment {
        eligibility: check_spin(
            &agent.settings.thresholds,
            &contract,
            &executor,
            subscription.as_ref(),
        ),
        contract: Some(contract),
        executor: Some(executor),
    }
}

#[derive(Clone, Debug)]
pub struct ClaimAssessment {
    pub eligibility: Eligibility,
    pub account: Option<UserAccount>,
}

pub async fn assess_claim(agent: &Agent, user: Address) -> ClaimAssessment {
    let chain = agent.chain.as_ref();
    let read = futures::try_join!(
        chain.is_closed(),
        chain.native_balance(chain.executor()),
        chain.user_account(user)
    );
    match read {
        Ok((closed, native, account)) => ClaimAssessment {
            eligibility: check_claim(&agent.settings.thresholds, &account, closed, native),
            account: Some(account),
        },
        Err(err) => ClaimAssessment {
            eligibility: Eligibility::unreachable(err),
            account: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{test_agent, MockChain, Read};
    use ethers::types::U256;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn healthy_contract() -> ContractState {
        ContractState {
            total_deposited: dec!(90),
            outstanding_debt: dec!(0),
            is_closed: false,
            uses_native_randomness_payment: false,
            max_single_bet: dec!(3),
        }
    }

    fn healthy_executor() -> WalletState {
        WalletState {
            native_balance: dec!(0.05),
            stable_balance: dec!(50),
        }
    }

    fn funded_subscription() -> Result<SubscriptionState, String> {
        Ok(SubscriptionState {
            link_balance: dec!(1),
            native_balance: dec!(0.05),
        })
    }

    #[test]
    fn healthy_snapshot_passes() {
        let thresholds = Thresholds::default();
        let sub = funded_subscription();
        let verdict = check_spin(&thresholds, &healthy_contract(), &healthy_executor(), Some(&sub));
        assert!(verdict.ok());
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn every_violation_is_reported_once_in_check_order() {
        let thresholds = Thresholds::default();
        // Each bit of the mask violates one of the five conditions.
        for mask in 0u8..32 {
            let mut contract = healthy_contract();
            let mut executor = healthy_executor();
            let mut sub = funded_subscription();
            let mut expected = Vec::new();
            if mask & 1 != 0 {
                contract.is_closed = true;
                expected.push(BlockReason::ContractClosed);
            }
            if mask & 2 != 0 {
                contract.outstanding_debt = dec!(60.000001);
                expected.push(BlockReason::BankrollTooLow { min: dec!(30) });
            }
            if mask & 4 != 0 {
                executor.native_balance = dec!(0.000999);
                expected.push(BlockReason::GasTooLow { min: dec!(0.001) });
            }
            if mask & 8 != 0 {
                executor.stable_balance = dec!(0.999999);
                expected.push(BlockReason::StableTooLow { min: dec!(1) });
            }
            if mask & 16 != 0 {
                sub = Ok(SubscriptionState {
                    link_balance: dec!(0.29),
                    native_balance: dec!(0.05),
                });
                expected.push(BlockReason::SubscriptionLinkLow { min: dec!(0.3) });
            }
            let verdict = check_spin(&thresholds, &contract, &executor, Some(&sub));
            assert_eq!(verdict.ok(), mask == 0, "mask {mask:05b}");
            assert_eq!(verdict.reasons, expected, "mask {mask:05b}");
        }
    }

    #[test]
    fn thresholds_are_inclusive() {
        let thresholds = Thresholds::default();
        let contract = ContractState {
            total_deposited: dec!(30),
            ..healthy_contract()
        };
        let executor = WalletState {
            native_balance: dec!(0.001),
            stable_balance: dec!(1),
        };
        let sub = Ok(SubscriptionState {
            link_balance: dec!(0.3),
            native_balance: Decimal::ZERO,
        });
        assert!(check_spin(&thresholds, &contract, &executor, Some(&sub)).ok());
    }

    #[test]
    fn bankroll_shortfall_is_the_only_reason() {
        let thresholds = Thresholds::default();
        let contract = ContractState {
            total_deposited: dec!(25),
            ..healthy_contract()
        };
        let verdict = check_spin(&thresholds, &contract, &healthy_executor(), None);
        assert!(!verdict.ok());
        assert_eq!(
            verdict.messages(),
            vec!["Available bankroll too low (need >= 30 USDC to pay max prize)".to_string()]
        );
    }

    #[test]
    fn subscription_currency_follows_payment_mode() {
        let thresholds = Thresholds::default();
        let contract = ContractState {
            uses_native_randomness_payment: true,
            ..healthy_contract()
        };
        let sub = Ok(SubscriptionState {
            link_balance: Decimal::ZERO,
            native_balance: dec!(0.0005),
        });
        let verdict = check_spin(&thresholds, &contract, &healthy_executor(), Some(&sub));
        assert_eq!(
            verdict.reasons,
            vec![BlockReason::SubscriptionNativeLow { min: dec!(0.001) }]
        );
    }

    #[test]
    fn unreadable_subscription_fails_closed() {
        let thresholds = Thresholds::default();
        let sub = Err("execution reverted".to_string());
        let verdict = check_spin(&thresholds, &healthy_contract(), &healthy_executor(), Some(&sub));
        assert_eq!(
            verdict.messages(),
            vec!["VRF subscription check failed: execution reverted".to_string()]
        );
    }

    #[test]
    fn claim_with_nothing_earned_is_rejected() {
        let thresholds = Thresholds::default();
        let account = UserAccount {
            total_earned: dec!(7),
            total_claimed: dec!(7),
            referral_earned: dec!(2),
            referral_claimed: dec!(2),
            ..Default::default()
        };
        let verdict = check_claim(&thresholds, &account, false, dec!(1));
        assert_eq!(verdict.reasons, vec![BlockReason::NothingToClaim]);
    }

    #[test]
    fn claim_reasons_follow_check_order() {
        let thresholds = Thresholds::default();
        let verdict = check_claim(&thresholds, &UserAccount::default(), true, Decimal::ZERO);
        assert_eq!(
            verdict.reasons,
            vec![
                BlockReason::ContractClosed,
                BlockReason::GasTooLow { min: dec!(0.001) },
                BlockReason::NothingToClaim,
            ]
        );
    }

    #[tokio::test]
    async fn failed_required_read_is_unreachable() {
        for read in [Read::ContractState, Read::NativeBalance, Read::StableBalance] {
            let chain = Arc::new(MockChain::default());
            chain.fail_read(read);
            let agent = test_agent(chain.clone());
            let assessment = assess_spin(&agent).await;
            assert!(!assessment.eligibility.ok());
            assert!(assessment.eligibility.is_unreachable(), "{read:?}");
            assert!(chain.writes().is_empty());
        }
    }

    #[tokio::test]
    async fn configured_subscription_is_read() {
        let chain = Arc::new(MockChain::default());
        chain.update(|state| state.subscription.link_balance = dec!(0.1));
        let mut agent = test_agent(chain.clone());
        agent.settings.subscription_id = Some(U256::from(7u64));
        let assessment = assess_spin(&agent).await;
        assert_eq!(
            assessment.eligibility.reasons,
            vec![BlockReason::SubscriptionLinkLow { min: dec!(0.3) }]
        );

        chain.fail_read(Read::Subscription);
        let assessment = assess_spin(&agent).await;
        assert!(!assessment.eligibility.ok());
        assert!(!assessment.eligibility.is_unreachable());
        assert!(assessment.contract.is_some());
    }

    #[tokio::test]
    async fn claim_assessment_fails_closed() {
        let chain = Arc::new(MockChain::default());
        chain.fail_read(Read::UserAccount);
        let agent = test_agent(chain.clone());
        let assessment = assess_claim(&agent, Address::repeat_byte(0x11)).await;
        assert!(assessment.eligibility.is_unreachable());
        assert!(assessment.account.is_none());
    }
}
