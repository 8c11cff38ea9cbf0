//! Gasless claim execution: the executor pays gas to release a player's earnings.

use crate::{
    chain::{format_address, format_hash, parse_address, ChainError},
    Agent,
};
use lotero_types::{
    api::{ClaimReceipt, CLAIM_STATUS_CLAIMED},
    format_amount,
};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("invalid user address")]
    InvalidUser,
    #[error("Nothing to claim; user has already claimed all earnings")]
    NothingToClaim,
    #[error("Executor ETH too low for gas (need >= {min} ETH)")]
    ExecutorInsufficient { min: Decimal },
    #[error("chain unreachable: {0}")]
    Unreachable(ChainError),
    #[error(transparent)]
    Chain(ChainError),
}

/// Releases everything the user has earned and not yet claimed. A repeated claim
/// after a successful one sees zero claimable and is rejected.
pub async fn execute_claim(agent: &Agent, user: &str) -> Result<ClaimReceipt, ClaimError> {
    let user = parse_address(user).ok_or(ClaimError::InvalidUser)?;
    let chain = agent.chain.as_ref();

    let account = chain
        .user_account(user)
        .await
        .map_err(ClaimError::Unreachable)?;
    let amount = account.claimable();
    if amount <= Decimal::ZERO {
        return Err(ClaimError::NothingToClaim);
    }

    let min = agent.settings.thresholds.executor_min_native;
    let native = chain
        .native_balance(chain.executor())
        .await
        .map_err(ClaimError::Unreachable)?;
    if native < min {
        warn!(%native, %min, "executor cannot cover claim gas");
        return Err(ClaimError::ExecutorInsufficient { min });
    }

    let tx_hash = chain
        .claim_player_earnings(user)
        .await
        .map_err(ClaimError::Chain)?;
    let tx_hash = format_hash(tx_hash);
    info!(user = %format_address(user), %amount, %tx_hash, "earnings claimed");
    Ok(ClaimReceipt {
        user: format_address(user),
        amount: format_amount(amount),
        tx_hash,
        status: CLAIM_STATUS_CLAIMED,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{test_agent, MockChain, Read, Write, WriteKind};
    use lotero_types::UserAccount;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const USER: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";

    fn earner(chain: &MockChain) {
        chain.set_account(
            parse_address(USER).unwrap(),
            UserAccount {
                total_earned: dec!(5),
                total_claimed: dec!(2),
                is_active: true,
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn claim_pays_out_the_claimable_amount() {
        let chain = Arc::new(MockChain::default());
        earner(&chain);
        let agent = test_agent(chain.clone());
        let receipt = execute_claim(&agent, USER).await.unwrap();
        assert_eq!(receipt.amount, "3.0");
        assert_eq!(receipt.status, "claimed");
        assert_eq!(receipt.user, format_address(parse_address(USER).unwrap()));
        assert_eq!(
            chain.writes(),
            vec![Write::ClaimPlayer {
                user: parse_address(USER).unwrap(),
                amount: dec!(3),
            }]
        );
    }

    #[tokio::test]
    async fn second_claim_finds_nothing() {
        let chain = Arc::new(MockChain::default());
        earner(&chain);
        let agent = test_agent(chain.clone());
        execute_claim(&agent, USER).await.unwrap();
        let err = execute_claim(&agent, USER).await.unwrap_err();
        assert!(matches!(err, ClaimError::NothingToClaim));
        assert_eq!(chain.writes().len(), 1);
    }

    #[tokio::test]
    async fn referral_earnings_count_toward_claimable() {
        let chain = Arc::new(MockChain::default());
        chain.set_account(
            parse_address(USER).unwrap(),
            UserAccount {
                referral_earned: dec!(0.25),
                ..Default::default()
            },
        );
        let agent = test_agent(chain);
        let receipt = execute_claim(&agent, USER).await.unwrap();
        assert_eq!(receipt.amount, "0.25");
    }

    #[tokio::test]
    async fn low_gas_is_a_capacity_failure() {
        let chain = Arc::new(MockChain::default());
        earner(&chain);
        chain.update(|state| state.executor_native = dec!(0.0009));
        let agent = test_agent(chain.clone());
        let err = execute_claim(&agent, USER).await.unwrap_err();
        assert!(matches!(err, ClaimError::ExecutorInsufficient { .. }));
        assert!(chain.writes().is_empty());
    }

    #[tokio::test]
    async fn nothing_to_claim_is_checked_before_gas() {
        let chain = Arc::new(MockChain::default());
        chain.update(|state| state.executor_native = Decimal::ZERO);
        let agent = test_agent(chain);
        let err = execute_claim(&agent, USER).await.unwrap_err();
        assert!(matches!(err, ClaimError::NothingToClaim));
    }

    #[tokio::test]
    async fn invalid_address_and_read_failures() {
        let chain = Arc::new(MockChain::default());
        chain.fail_read(Read::UserAccount);
        let agent = test_agent(chain);
        assert!(matches!(
            execute_claim(&agent, "abc").await.unwrap_err(),
            ClaimError::InvalidUser
        ));
        assert!(matches!(
            execute_claim(&agent, USER).await.unwrap_err(),
            ClaimError::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn reverted_claim_is_a_chain_error() {
        let chain = Arc::new(MockChain::default());
        earner(&chain);
        chain.fail_write(WriteKind::ClaimPlayer, "execution reverted");
        let agent = test_agent(chain);
        assert!(matches!(
            execute_claim(&agent, USER).await.unwrap_err(),
            ClaimError::Chain(_)
        ));
    }
}
