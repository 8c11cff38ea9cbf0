//! Paid spin execution: the executor fronts a fixed bet on the player's behalf.

use crate::{
    chain::{format_address, format_hash, parse_address, ChainError},
    gate::assess_spin,
    Agent,
};
use ethers::types::Address;
use lotero_types::api::{SpinReceipt, SPIN_STATUS_PENDING};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SpinError {
    #[error("invalid player address")]
    InvalidPlayer,
    /// The gate refused the spin because of chain state.
    #[error("contract unhealthy")]
    Unhealthy(Vec<String>),
    /// The gate could not read the state it needs.
    #[error("chain unreachable: {0}")]
    Unreachable(String),
    /// The transaction was mined but carried no `SpinRequested` event.
    #[error("could not extract request id from transaction {0}")]
    MissingRequestId(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Validates, gates and submits one spin. A malformed referral is treated as no
/// referral rather than rejected.
pub async fn execute_spin(
    agent: &Agent,
    player: &str,
    referral: Option<&str>,
) -> Result<SpinReceipt, SpinError> {
    let player = parse_address(player).ok_or(SpinError::InvalidPlayer)?;
    let referral = referral
        .and_then(|raw| {
            let parsed = parse_address(raw);
            if parsed.is_none() {
                warn!(referral = raw, "ignoring malformed referral");
            }
            parsed
        })
        .unwrap_or_else(Address::zero);

    let assessment = assess_spin(agent).await;
    if assessment.eligibility.is_unreachable() {
        let reason = assessment.eligibility.messages().join("; ");
        warn!(player = %format_address(player), %reason, "spin gate could not read chain");
        return Err(SpinError::Unreachable(reason));
    }
    if !assessment.eligibility.ok() {
        let reasons = assessment.eligibility.messages();
        warn!(player = %format_address(player), ?reasons, "spin blocked");
        return Err(SpinError::Unhealthy(reasons));
    }

    let bet = agent.settings.thresholds.spin_bet;
    let submission = agent.chain.spin_for(player, referral, bet).await?;
    let tx_hash = format_hash(submission.tx_hash);
    let Some(request_id) = submission.request_id else {
        error!(player = %format_address(player), %tx_hash, "spin receipt missing SpinRequested event");
        return Err(SpinError::MissingRequestId(tx_hash));
    };

    info!(
        player = %format_address(player),
        referral = %format_address(referral),
        request_id = %request_id,
        %tx_hash,
        bet = %bet,
        "spin submitted"
    );
    Ok(SpinReceipt {
        request_id: request_id.to_string(),
        tx_hash,
        status: SPIN_STATUS_PENDING,
    })
}
