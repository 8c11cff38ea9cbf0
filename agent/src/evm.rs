//! Production [`Chain`] over an EVM JSON-RPC endpoint.

use crate::chain::{format_address, format_hash, Chain, ChainError, SpinSubmission};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::Detokenize;
use ethers::contract::{parse_log, ContractCall};
use ethers::prelude::*;
use lotero_types::{
    ContractState, DevFees, RoundInfo, SubscriptionState, UserAccount, LINK_DECIMALS,
    NATIVE_DECIMALS, STABLE_DECIMALS,
};
use rust_decimal::Decimal;
use std::{future::Future, str::FromStr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

abigen!(
    SlotMachine,
    r#"[
        event SpinRequested(uint256 indexed requestId, address indexed payer, address indexed player, uint256 amount)
        function playFor(address player, address referringUserAddress, uint256 amountToPlay) external payable returns (uint256)
        function getRoundInfo(uint256 roundId) external view returns ((address,uint8,uint8,uint8,uint256,bool,uint256))
        function isResolved(uint256 requestId) external view returns (bool)
        function infoPerUser(address user) external view returns (uint256 moneyAdded, uint256 moneyEarned, uint256 moneyClaimed, bool active, address referringUserAddress, uint256 earnedByReferrals, uint256 claimedByReferrals)
        function claimPlayerEarnings(address userAddress) external
        function getMoneyInContract() external view returns (uint256)
        function getCurrentDebt() external view returns (uint256)
        function getMaxValueToPlay() external view returns (uint256)
        function isClosed() external view returns (bool)
        function useNativePayment() external view returns (bool)
        function depositTokens(address to, uint256 amount) external
        function totalMoneyEarnedByDevs() external view returns (uint256)
        function totalMoneyClaimedByDevs() external view returns (uint256)
        function claimDevEarnings() external
    ]"#
);

abigen!(
    VrfCoordinator,
    r#"[
        function getSubscription(uint256 subId) external view returns (uint96 balance, uint96 nativeBalance, uint64 reqCount, address subOwner, address[] consumers)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function balanceOf(address owner) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function approve(address spender, uint256 amount) external returns (bool)
    ]"#
);

/// Gas limit for play-for transactions.
pub const SPIN_GAS_LIMIT: u64 = 350_000;

/// Gas limit for player claim transactions.
pub const CLAIM_GAS_LIMIT: u64 = 150_000;

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

#[derive(Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub private_key: String,
    pub chain_id: u64,
    pub slot_machine: String,
    pub stable_token: String,
    pub vrf_coordinator: String,
    pub read_timeout: Duration,
    /// Budget for one write, from submission until the receipt is in.
    pub write_timeout: Duration,
}

impl std::fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url)
            .field("private_key", &"<redacted>")
            .field("chain_id", &self.chain_id)
            .field("slot_machine", &self.slot_machine)
            .field("stable_token", &self.stable_token)
            .field("vrf_coordinator", &self.vrf_coordinator)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

pub struct EvmChain {
    provider: Provider<Http>,
    slot_machine: SlotMachine<SignerClient>,
    stable: Erc20<SignerClient>,
    coordinator: VrfCoordinator<Provider<Http>>,
    executor: Address,
    read_timeout: Duration,
    write_timeout: Duration,
    // One hot wallet signs spins, claims and treasury transfers.
    write_lock: Mutex<()>,
}

impl EvmChain {
    pub fn connect(config: &EvmConfig) -> Result<Self> {
        let provider =
            Provider::<Http>::try_from(config.rpc_url.as_str()).context("Invalid EVM RPC URL")?;

        let wallet: LocalWallet = config
            .private_key
            .trim_start_matches("0x")
            .parse()
            .context("Invalid executor private key")?;
        let wallet = wallet.with_chain_id(config.chain_id);
        let executor = wallet.address();

        let slot_machine_address =
            Address::from_str(&config.slot_machine).context("Invalid slot machine address")?;
        let stable_address =
            Address::from_str(&config.stable_token).context("Invalid stable token address")?;
        let coordinator_address =
            Address::from_str(&config.vrf_coordinator).context("Invalid VRF coordinator address")?;

        let client = Arc::new(SignerMiddleware::new(provider.clone(), wallet));
        let slot_machine = SlotMachine::new(slot_machine_address, client.clone());
        let stable = Erc20::new(stable_address, client);
        let coordinator = VrfCoordinator::new(coordinator_address, Arc::new(provider.clone()));

        Ok(Self {
            provider,
            slot_machine,
            stable,
            coordinator,
            executor,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            write_lock: Mutex::new(()),
        })
    }

    async fn read<T, E, F>(&self, call: &'static str, future: F) -> Result<T, ChainError>
    where
        F: Future<Output = std::result::Result<T, E>> + Send,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.read_timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ChainError::Rpc(format!("{call}: {err}"))),
            Err(_) => Err(ChainError::Timeout {
                call,
                after: self.read_timeout,
            }),
        }
    }

    async fn submit<D>(
        &self,
        what: &'static str,
        call: ContractCall<SignerClient, D>,
    ) -> Result<TransactionReceipt, ChainError>
    where
        D: Detokenize + Send + Sync,
    {
        // Nonces come from the pending count, so the next send must wait for inclusion.
        let _guard = self.write_lock.lock().await;
        let deadline = tokio::time::Instant::now() + self.write_timeout;
        let expired = ChainError::Timeout {
            call: what,
            after: self.write_timeout,
        };
        let pending = match tokio::time::timeout_at(deadline, call.send()).await {
            Ok(sent) => {
                sent.map_err(|err| ChainError::Rpc(format!("{what}: {}", revert_text(&err))))?
            }
            Err(_) => return Err(expired),
        };
        let tx_hash = pending.tx_hash();
        info!(call = what, tx_hash = %format_hash(tx_hash), "transaction submitted");

        let receipt = match tokio::time::timeout_at(deadline, pending).await {
            Ok(included) => included
                .map_err(|err| ChainError::Rpc(format!("{what}: {err}")))?
                .ok_or(ChainError::MissingReceipt(tx_hash))?,
            Err(_) => {
                warn!(
                    call = what,
                    tx_hash = %format_hash(tx_hash),
                    "transaction not included in time; releasing signer"
                );
                return Err(expired);
            }
        };
        if receipt.status == Some(U64::zero()) {
            return Err(ChainError::Reverted(tx_hash));
        }
        debug!(
            call = what,
            tx_hash = %format_hash(tx_hash),
            block = ?receipt.block_number,
            gas_used = ?receipt.gas_used,
            "transaction included"
        );
        Ok(receipt)
    }
}

/// Surfaces the decoded revert string when the node returned one.
fn revert_text(err: &ContractError<SignerClient>) -> String {
    match err.decode_revert::<String>() {
        Some(reason) => format!("execution reverted: {reason}"),
        None => err.to_string(),
    }
}

fn to_decimal(raw: U256, decimals: u32) -> Result<Decimal, ChainError> {
    if raw > U256::from(u128::MAX) {
        return Err(ChainError::Conversion(raw.to_string()));
    }
    let mantissa =
        i128::try_from(raw.as_u128()).map_err(|_| ChainError::Conversion(raw.to_string()))?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map_err(|_| ChainError::Conversion(raw.to_string()))
}

/// Like [`to_decimal`] but clamps oversized values, so an infinite approval reads as
/// [`Decimal::MAX`].
fn to_decimal_saturating(raw: U256, decimals: u32) -> Decimal {
    to_decimal(raw, decimals).unwrap_or(Decimal::MAX)
}

fn to_units(amount: Decimal, decimals: u32) -> Result<U256, ChainError> {
    let mut scaled = amount.normalize();
    if scaled.is_sign_negative() || scaled.scale() > decimals {
        return Err(ChainError::Conversion(amount.to_string()));
    }
    scaled.rescale(decimals);
    let mantissa =
        u128::try_from(scaled.mantissa()).map_err(|_| ChainError::Conversion(amount.to_string()))?;
    Ok(U256::from(mantissa))
}

#[async_trait]
impl Chain for EvmChain {
    fn executor(&self) -> Address {
        self.executor
    }

    fn slot_machine(&self) -> Address {
        self.slot_machine.address()
    }

    async fn native_balance(&self, who: Address) -> Result<Decimal, ChainError> {
        let raw = self
            .read("eth_getBalance", self.provider.get_balance(who, None))
            .await?;
        to_decimal(raw, NATIVE_DECIMALS)
    }

    async fn stable_balance(&self, who: Address) -> Result<Decimal, ChainError> {
        let raw = self
            .read("balanceOf", self.stable.balance_of(who).call())
            .await?;
        to_decimal(raw, STABLE_DECIMALS)
    }

    async fn stable_allowance(
        &self,
        owner: Address,
        spender: Address,
    ) -> Result<Decimal, ChainError> {
        let raw = self
            .read("allowance", self.stable.allowance(owner, spender).call())
            .await?;
        Ok(to_decimal_saturating(raw, STABLE_DECIMALS))
    }

    async fn contract_state(&self) -> Result<ContractState, ChainError> {
        let money = self.slot_machine.get_money_in_contract();
        let debt = self.slot_machine.get_current_debt();
        let closed = self.slot_machine.is_closed();
        let native = self.slot_machine.use_native_payment();
        let max_bet = self.slot_machine.get_max_value_to_play();
        let (money, debt, is_closed, uses_native, max_bet) = futures::try_join!(
            self.read("getMoneyInContract", money.call()),
            self.read("getCurrentDebt", debt.call()),
            self.read("isClosed", closed.call()),
            self.read("useNativePayment", native.call()),
            self.read("getMaxValueToPlay", max_bet.call()),
        )?;
        Ok(ContractState {
            total_deposited: to_decimal(money, STABLE_DECIMALS)?,
            outstanding_debt: to_decimal(debt, STABLE_DECIMALS)?,
            is_closed,
            uses_native_randomness_payment: uses_native,
            max_single_bet: to_decimal(max_bet, STABLE_DECIMALS)?,
        })
    }

    async fn is_closed(&self) -> Result<bool, ChainError> {
        self.read("isClosed", self.slot_machine.is_closed().call())
            .await
    }

    async fn uses_native_payment(&self) -> Result<bool, ChainError> {
        self.read(
            "useNativePayment",
            self.slot_machine.use_native_payment().call(),
        )
        .await
    }

    async fn user_account(&self, user: Address) -> Result<UserAccount, ChainError> {
        let (added, earned, claimed, active, referrer, referral_earned, referral_claimed) = self
            .read("infoPerUser", self.slot_machine.info_per_user(user).call())
            .await?;
        Ok(UserAccount {
            total_deposited: to_decimal(added, STABLE_DECIMALS)?,
            total_earned: to_decimal(earned, STABLE_DECIMALS)?,
            total_claimed: to_decimal(claimed, STABLE_DECIMALS)?,
            is_active: active,
            referrer: format_address(referrer),
            referral_earned: to_decimal(referral_earned, STABLE_DECIMALS)?,
            referral_claimed: to_decimal(referral_claimed, STABLE_DECIMALS)?,
        })
    }

    async fn dev_fees(&self) -> Result<DevFees, ChainError> {
        let earned = self.slot_machine.total_money_earned_by_devs();
        let claimed = self.slot_machine.total_money_claimed_by_devs();
        let (earned, claimed) = futures::try_join!(
            self.read("totalMoneyEarnedByDevs", earned.call()),
            self.read("totalMoneyClaimedByDevs", claimed.call()),
        )?;
        Ok(DevFees {
            earned: to_decimal(earned, STABLE_DECIMALS)?,
            claimed: to_decimal(claimed, STABLE_DECIMALS)?,
        })
    }

    async fn subscription(&self, id: U256) -> Result<SubscriptionState, ChainError> {
        let (link, native, _, _, _) = self
            .read("getSubscription", self.coordinator.get_subscription(id).call())
            .await?;
        Ok(SubscriptionState {
            link_balance: to_decimal(U256::from(link), LINK_DECIMALS)?,
            native_balance: to_decimal(U256::from(native), NATIVE_DECIMALS)?,
        })
    }

    async fn round(&self, request_id: U256) -> Result<(bool, RoundInfo), ChainError> {
        let resolved = self.slot_machine.is_resolved(request_id);
        let info = self.slot_machine.get_round_info(request_id);
        let (resolved, (user, number1, number2, number3, value, has_won, prize)) = futures::try_join!(
            self.read("isResolved", resolved.call()),
            self.read("getRoundInfo", info.call()),
        )?;
        Ok((
            resolved,
            RoundInfo {
                user_address: format_address(user),
                number1,
                number2,
                number3,
                value: to_decimal(value, STABLE_DECIMALS)?,
                has_won,
                prize: to_decimal(prize, STABLE_DECIMALS)?,
            },
        ))
    }

    async fn approve_stable_max(&self, spender: Address) -> Result<H256, ChainError> {
        let call = self.stable.approve(spender, U256::MAX);
        let receipt = self.submit("approve", call).await?;
        Ok(receipt.transaction_hash)
    }

    async fn deposit(&self, amount: Decimal) -> Result<H256, ChainError> {
        let raw = to_units(amount, STABLE_DECIMALS)?;
        let call = self
            .slot_machine
            .deposit_tokens(self.slot_machine.address(), raw);
        let receipt = self.submit("depositTokens", call).await?;
        Ok(receipt.transaction_hash)
    }

    async fn spin_for(
        &self,
        player: Address,
        referral: Address,
        amount: Decimal,
    ) -> Result<SpinSubmission, ChainError> {
        let raw = to_units(amount, STABLE_DECIMALS)?;
        let call = self
            .slot_machine
            .play_for(player, referral, raw)
            .gas(SPIN_GAS_LIMIT);
        let receipt = self.submit("playFor", call).await?;
        let slot_machine = self.slot_machine.address();
        let request_id = receipt
            .logs
            .iter()
            .filter(|log| log.address == slot_machine)
            .find_map(|log| parse_log::<SpinRequestedFilter>(log.clone()).ok())
            .map(|event| event.request_id);
        Ok(SpinSubmission {
            tx_hash: receipt.transaction_hash,
            request_id,
        })
    }

    async fn claim_player_earnings(&self, user: Address) -> Result<H256, ChainError> {
        let call = self
            .slot_machine
            .claim_player_earnings(user)
            .gas(CLAIM_GAS_LIMIT);
        let receipt = self.submit("claimPlayerEarnings", call).await?;
        Ok(receipt.transaction_hash)
    }

    async fn claim_dev_earnings(&self) -> Result<H256, ChainError> {
        let call = self.slot_machine.claim_dev_earnings();
        let receipt = self.submit("claimDevEarnings", call).await?;
        Ok(receipt.transaction_hash)
    }
}
