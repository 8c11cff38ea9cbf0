//! Treasury reconciliation loop.
//!
//! A pass runs its steps in a fixed order because later steps consume state the
//! earlier ones changed:
//!
//! 1. read wallet and contract state
//! 2. queue passive wallet alerts
//! 3. fund a closed or under-trigger contract, capped at the target bankroll and
//!    never drawing the wallet below its buffer
//! 4. sweep developer fees into the wallet
//! 5. reinforce a below-target bankroll from wallet excess
//! 6. check the randomness subscription
//! 7. deliver queued alerts, critical first
//!
//! The pass keeps no state between runs. Alerts are level-triggered: a condition
//! that persists is reported again on every pass.

use crate::{
    chain::{format_address, format_hash, wallet_state, Chain, ChainError},
    notify::{deliver, notify_detached},
    Agent,
};
use chrono::{SecondsFormat, Utc};
use ethers::types::{Address, H256};
use lotero_types::{
    api::{
        ActionKind, AlertDigest, BufferLevel, ContractReport, Level, TreasuryAction,
        TreasuryReport, VrfReport, WalletReport,
    },
    format_amount, Alert, ContractState, PaymentMode, Thresholds, WalletState,
};
use rust_decimal::Decimal;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TreasuryError {
    #[error("wallet read failed: {0}")]
    Wallet(ChainError),
    #[error("contract read failed: {0}")]
    Contract(ChainError),
}

/// State threaded through one pass.
struct Pass<'a> {
    chain: &'a dyn Chain,
    thresholds: &'a Thresholds,
    treasury: Address,
    wallet: WalletState,
    contract: ContractState,
    alerts: Vec<Alert>,
    actions: Vec<TreasuryAction>,
    // Set once a transfer or its refresh failed; the snapshot is no longer trusted
    // and no further transfer runs in this pass.
    stale: bool,
}

enum Funding {
    TopUp,
    Reinforce,
}

impl Funding {
    fn kind(&self) -> ActionKind {
        match self {
            Funding::TopUp => ActionKind::TopUp,
            Funding::Reinforce => ActionKind::Reinforce,
        }
    }
}

/// Runs one reconciliation pass and returns its snapshot. Fails only when the
/// initial wallet or contract read fails; every later failure is isolated to its
/// step and reported through alerts and the returned actions.
pub async fn reconcile(agent: &Agent) -> Result<TreasuryReport, TreasuryError> {
    let _pass = agent.reconcile_lock.lock().await;
    let chain = agent.chain.as_ref();
    let thresholds = &agent.settings.thresholds;
    let treasury = chain.executor();

    let (wallet, contract) = futures::join!(wallet_state(chain, treasury), chain.contract_state());
    let wallet = wallet.map_err(TreasuryError::Wallet)?;
    let contract = contract.map_err(TreasuryError::Contract)?;
    debug!(
        native = %wallet.native_balance,
        stable = %wallet.stable_balance,
        bankroll = %contract.available_bankroll(),
        closed = contract.is_closed,
        "treasury snapshot"
    );

    let mut pass = Pass {
        chain,
        thresholds,
        treasury,
        wallet,
        contract,
        alerts: Vec::new(),
        actions: Vec::new(),
        stale: false,
    };

    pass.passive_alerts();
    pass.fund_contract(agent).await;
    pass.sweep_dev_fees().await;
    pass.reinforce(agent).await;
    let vrf = pass.check_subscription(agent).await;

    let sent = deliver(agent.notifier.as_ref(), &pass.alerts).await;
    info!(
        actions = pass.actions.len(),
        alerts = pass.alerts.len(),
        sent,
        bankroll = %pass.contract.available_bankroll(),
        closed = pass.contract.is_closed,
        "reconciliation pass complete"
    );

    Ok(pass.report(agent, vrf))
}

impl Pass<'_> {
    fn passive_alerts(&mut self) {
        let t = self.thresholds;
        let wallet = self.wallet;
        if wallet.native_balance < t.wallet_min_native_trigger {
            let topup = (t.wallet_target_native - wallet.native_balance).max(Decimal::ZERO);
            self.alerts.push(Alert::critical(
                "eth_low",
                format!(
                    "<b>CRITICAL: Executor ETH Low</b>\n\n\
                     Current ETH balance: {} ETH\n\
                     Minimum required: {} ETH\n\
                     Target balance: {} ETH\n\n\
                     The agent cannot safely execute transactions.\n\n\
                     <b>Action required:</b> send ETH to the executor wallet\n{}\n\n\
                     <b>Recommended top-up:</b> {} ETH",
                    format_amount(wallet.native_balance),
                    format_amount(t.wallet_min_native_trigger),
                    format_amount(t.wallet_target_native),
                    format_address(self.treasury),
                    format_amount(topup),
                ),
            ));
        }
        if wallet.stable_balance < t.wallet_min_stable_buffer {
            let topup = (t.wallet_target_stable_buffer - wallet.stable_balance).max(Decimal::ZERO);
            self.alerts.push(Alert::info(
                "wallet_usdc_low",
                format!(
                    "<b>INFO: Wallet USDC Buffer Low</b>\n\n\
                     Current wallet USDC: {} USDC\n\
                     Minimum buffer: {} USDC\n\
                     Target buffer: {} USDC\n\n\
                     Spins still run, but liquidity is tight.\n\n\
                     <b>Recommended action:</b> send USDC to the executor wallet\n{}\n\n\
                     <b>Recommended top-up:</b> {} USDC",
                    format_amount(wallet.stable_balance),
                    format_amount(t.wallet_min_stable_buffer),
                    format_amount(t.wallet_target_stable_buffer),
                    format_address(self.treasury),
                    format_amount(topup),
                ),
            ));
        }
    }

    async fn fund_contract(&mut self, agent: &Agent) {
        let t = self.thresholds;
        let bankroll = self.contract.available_bankroll();
        let needs_funding = self.contract.is_closed || bankroll < t.contract_topup_trigger_bankroll;
        if !needs_funding {
            return;
        }

        let stable = self.wallet.stable_balance;
        if stable < t.wallet_min_stable_buffer {
            let wallet_needed = t.wallet_min_stable_buffer - stable;
            let contract_needed = (t.contract_target_bankroll - bankroll).max(Decimal::ZERO);
            warn!(
                %bankroll,
                %stable,
                "contract needs funding but wallet is below its buffer"
            );
            self.alerts.push(Alert::critical(
                "contract_wallet_critical",
                format!(
                    "<b>CRITICAL: Contract Requires Funding, Wallet Below Minimum Buffer</b>\n\n\
                     Current contract bankroll: {} USDC\n\
                     Target bankroll: {} USDC\n\n\
                     Current wallet USDC: {} USDC\n\
                     Minimum wallet buffer: {} USDC\n\n\
                     The wallet cannot refill the contract without dropping below its buffer.\n\n\
                     <b>Action required:</b> send USDC to the executor wallet\n{}\n\n\
                     <b>Mandatory top-up:</b> {} USDC\n\
                     For wallet: {} USDC\n\
                     For contract: {} USDC",
                    format_amount(bankroll),
                    format_amount(t.contract_target_bankroll),
                    format_amount(stable),
                    format_amount(t.wallet_min_stable_buffer),
                    format_address(self.treasury),
                    format_amount(wallet_needed + contract_needed),
                    format_amount(wallet_needed),
                    format_amount(contract_needed),
                ),
            ));
            return;
        }

        let excess = stable - t.wallet_min_stable_buffer;
        let needed = t.contract_target_bankroll - bankroll;
        let amount = excess.min(needed);
        if amount <= Decimal::ZERO {
            return;
        }

        let mut reasons = Vec::new();
        if self.contract.is_closed {
            reasons.push("Contract Closed");
        }
        if bankroll < t.contract_target_bankroll {
            reasons.push("Below Target");
        }
        let still_needed = (t.contract_target_bankroll - (bankroll + amount)).max(Decimal::ZERO);
        notify_detached(
            agent.notifier.clone(),
            Alert::info(
                "auto_topup_pre",
                format!(
                    "<b>AUTO TOP-UP: Initiating Transfer</b>\n\n\
                     <b>Reason:</b> contract needs funding ({})\n\n\
                     Sending wallet USDC above buffer to the contract.\n\n\
                     <b>Amount to send:</b> {} USDC\n\
                     <b>Bankroll after transfer:</b> {} USDC\n\
                     <b>Still needed after transfer:</b> {} USDC (target {})",
                    reasons.join(" and "),
                    format_amount(amount),
                    format_amount(bankroll + amount),
                    format_amount(still_needed),
                    format_amount(t.contract_target_bankroll),
                ),
            ),
        );

        self.transfer(Funding::TopUp, amount).await;
    }

    async fn reinforce(&mut self, agent: &Agent) {
        if self.stale {
            return;
        }
        let t = self.thresholds;
        let bankroll = self.contract.available_bankroll();
        let excess = self.wallet.stable_balance - t.wallet_min_stable_buffer;
        if bankroll >= t.contract_target_bankroll || excess < t.wallet_excess_min_for_contract {
            return;
        }
        let amount = excess.min(t.contract_target_bankroll - bankroll);
        if amount <= Decimal::ZERO {
            return;
        }

        notify_detached(
            agent.notifier.clone(),
            Alert::info(
                "auto_topup_pre",
                format!(
                    "<b>AUTO TOP-UP: Initiating Transfer</b>\n\n\
                     Contract bankroll below target. Sending excess wallet USDC to the contract.\n\n\
                     <b>Amount to send:</b> {} USDC\n\
                     <b>Bankroll after transfer:</b> {} USDC",
                    format_amount(amount),
                    format_amount(bankroll + amount),
                ),
            ),
        );

        self.transfer(Funding::Reinforce, amount).await;
    }

    /// Approves if needed, deposits, then re-reads wallet and contract. Any failure
    /// is reported as a critical alert and ends this step only.
    async fn transfer(&mut self, funding: Funding, amount: Decimal) {
        let bankroll_before = self.contract.available_bankroll();
        let tx_hash = match self.deposit(amount).await {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                self.transfer_failed(&funding, amount, None, &err);
                return;
            }
        };
        info!(
            kind = ?funding.kind(),
            %amount,
            tx_hash = %format_hash(tx_hash),
            "bankroll transfer confirmed"
        );

        let refreshed = futures::try_join!(
            wallet_state(self.chain, self.treasury),
            self.chain.contract_state()
        );
        let (wallet, contract) = match refreshed {
            Ok(state) => state,
            Err(err) => {
                self.transfer_failed(&funding, amount, Some(tx_hash), &err);
                return;
            }
        };
        self.wallet = wallet;
        self.contract = contract;
        self.actions.push(TreasuryAction {
            kind: funding.kind(),
            amount: format_amount(amount),
            tx_hash: Some(format_hash(tx_hash)),
            ok: true,
            error: None,
        });

        let t = self.thresholds;
        let bankroll_after = contract.available_bankroll();
        let alert = match (funding, contract.is_closed) {
            (Funding::TopUp, false) => Alert::info(
                "auto_topup_success",
                format!(
                    "<b>AUTO TOP-UP SUCCESS: Contract Reopened</b>\n\n\
                     Contract bankroll: {} -> {} USDC\n\
                     <b>Top-up sent:</b> {} USDC\n\
                     <b>Wallet USDC (after):</b> {} USDC\n\n\
                     Contract is OPEN. Spins can resume.",
                    format_amount(bankroll_before),
                    format_amount(bankroll_after),
                    format_amount(amount),
                    format_amount(wallet.stable_balance),
                ),
            ),
            (Funding::TopUp, true) => {
                let remaining = (t.contract_target_bankroll - bankroll_after).max(Decimal::ZERO);
                Alert::warning(
                    "auto_topup_partial",
                    format!(
                        "<b>AUTO TOP-UP PARTIAL: Contract Still Closed</b>\n\n\
                         A top-up was executed but did not reopen the contract.\n\n\
                         Contract bankroll: {} -> {} USDC\n\
                         Target bankroll: {} USDC\n\
                         <b>Top-up sent:</b> {} USDC\n\
                         <b>Wallet USDC (after):</b> {} USDC\n\n\
                         <b>Action required:</b> send additional USDC to the executor wallet\n{}\n\n\
                         <b>Required top-up (minimum):</b> {} USDC",
                        format_amount(bankroll_before),
                        format_amount(bankroll_after),
                        format_amount(t.contract_target_bankroll),
                        format_amount(amount),
                        format_amount(wallet.stable_balance),
                        format_address(self.treasury),
                        format_amount(remaining),
                    ),
                )
            }
            (Funding::Reinforce, _) => Alert::info(
                "auto_topup_success",
                format!(
                    "<b>AUTO TOP-UP SUCCESS: Bankroll Reinforced</b>\n\n\
                     <b>Amount sent:</b> {} USDC\n\
                     <b>Contract bankroll:</b> {} -> {} USDC\n\
                     <b>Wallet USDC (after):</b> {} USDC",
                    format_amount(amount),
                    format_amount(bankroll_before),
                    format_amount(bankroll_after),
                    format_amount(wallet.stable_balance),
                ),
            ),
        };
        self.alerts.push(alert);
    }

    async fn deposit(&self, amount: Decimal) -> Result<H256, ChainError> {
        let spender = self.chain.slot_machine();
        let allowance = self.chain.stable_allowance(self.treasury, spender).await?;
        if allowance < amount {
            let approval = self.chain.approve_stable_max(spender).await?;
            info!(tx_hash = %format_hash(approval), "stable allowance approved");
        }
        self.chain.deposit(amount).await
    }

    fn transfer_failed(
        &mut self,
        funding: &Funding,
        amount: Decimal,
        tx_hash: Option<H256>,
        err: &ChainError,
    ) {
        warn!(kind = ?funding.kind(), %amount, %err, "bankroll transfer failed");
        self.stale = true;
        self.actions.push(TreasuryAction {
            kind: funding.kind(),
            amount: format_amount(amount),
            tx_hash: tx_hash.map(format_hash),
            ok: false,
            error: Some(err.to_string()),
        });
        self.alerts.push(Alert::critical(
            "auto_topup_error",
            format!(
                "<b>AUTO TOP-UP FAILED</b>\n\n\
                 <b>Reason:</b> transfer to contract failed.\n\n\
                 <b>Error:</b> {}\n\
                 <b>Executor wallet:</b> {}\n\
                 <b>Intended top-up:</b> {} USDC\n\n\
                 If this persists, top up ETH for gas and retry.",
                err,
                format_address(self.treasury),
                format_amount(amount),
            ),
        ));
    }

    /// Never fails the pass. Contract-side no-ops are detected through the wallet
    /// balance delta rather than the pending figure.
    async fn sweep_dev_fees(&mut self) {
        let fees = match self.chain.dev_fees().await {
            Ok(fees) => fees,
            Err(err) => {
                warn!(%err, "dev fee read failed");
                return;
            }
        };
        let pending = fees.pending();
        if pending < self.thresholds.dev_claim_min {
            debug!(%pending, "dev fees below sweep minimum");
            return;
        }

        match self.claim_dev_fees().await {
            Ok((tx_hash, received, after)) => {
                self.wallet.stable_balance = after;
                self.actions.push(TreasuryAction {
                    kind: ActionKind::DevClaim,
                    amount: format_amount(received),
                    tx_hash: Some(format_hash(tx_hash)),
                    ok: true,
                    error: None,
                });
                if received > Decimal::ZERO {
                    info!(%received, tx_hash = %format_hash(tx_hash), "dev fees swept");
                    self.alerts.push(Alert::info(
                        "dev_claim",
                        format!(
                            "<b>DEV FEES WITHDRAWN</b>\n\n\
                             Dev fees were claimed into the executor wallet.\n\n\
                             <b>Amount withdrawn:</b> {} USDC\n\
                             <b>Wallet address:</b> {}\n\
                             <b>Wallet USDC (after):</b> {} USDC",
                            format_amount(received),
                            format_address(self.treasury),
                            format_amount(after),
                        ),
                    ));
                } else {
                    debug!(%pending, "dev fee claim moved nothing");
                }
            }
            Err(err) => {
                let message = err.to_string();
                // Non-recipients revert with a team-membership error; that is expected.
                if message.contains("team") {
                    debug!(%err, "dev fee claim not permitted for executor");
                } else {
                    warn!(%err, "dev fee claim failed");
                }
                self.actions.push(TreasuryAction {
                    kind: ActionKind::DevClaim,
                    amount: format_amount(pending),
                    tx_hash: None,
                    ok: false,
                    error: Some(message),
                });
            }
        }
    }

    async fn claim_dev_fees(&self) -> Result<(H256, Decimal, Decimal), ChainError> {
        let before = self.chain.stable_balance(self.treasury).await?;
        let tx_hash = self.chain.claim_dev_earnings().await?;
        let after = self.chain.stable_balance(self.treasury).await?;
        Ok((tx_hash, (after - before).max(Decimal::ZERO), after))
    }

    async fn check_subscription(&mut self, agent: &Agent) -> VrfReport {
        let t = self.thresholds;
        let mode = self.contract.payment_mode();
        let mut report = VrfReport {
            subscription_id: agent.settings.subscription_id.map(|id| id.to_string()),
            payment_mode: Some(mode),
            ..Default::default()
        };
        let Some(id) = agent.settings.subscription_id else {
            return report;
        };
        let balances = match self.chain.subscription(id).await {
            Ok(balances) => balances,
            Err(err) => {
                warn!(subscription = %id, %err, "subscription read failed");
                report.error = Some(err.to_string());
                return report;
            }
        };

        match mode {
            PaymentMode::Link => {
                let value = balances.link_balance;
                report.link = Some(level(value, t.vrf_min_link_trigger, t.vrf_target_link));
                if value < t.vrf_min_link_trigger {
                    self.alerts.push(subscription_alert(
                        "vrf_link_low",
                        "LINK",
                        id.to_string(),
                        value,
                        t.vrf_min_link_trigger,
                        t.vrf_target_link,
                    ));
                }
            }
            PaymentMode::Native => {
                let value = balances.native_balance;
                report.native = Some(level(value, t.vrf_min_native_trigger, t.vrf_target_native));
                if value < t.vrf_min_native_trigger {
                    self.alerts.push(subscription_alert(
                        "vrf_native_low",
                        "ETH",
                        id.to_string(),
                        value,
                        t.vrf_min_native_trigger,
                        t.vrf_target_native,
                    ));
                }
            }
        }
        report
    }

    fn report(self, agent: &Agent, vrf: VrfReport) -> TreasuryReport {
        let t = self.thresholds;
        let wallet = self.wallet;
        let contract = self.contract;
        TreasuryReport {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            network: agent.settings.network.clone(),
            wallet: WalletReport {
                address: format_address(self.treasury),
                native: level(
                    wallet.native_balance,
                    t.wallet_min_native_trigger,
                    t.wallet_target_native,
                ),
                stable: BufferLevel {
                    value: format_amount(wallet.stable_balance),
                    ok: wallet.stable_balance >= t.wallet_min_stable_buffer,
                    min_buffer: format_amount(t.wallet_min_stable_buffer),
                    target_buffer: format_amount(t.wallet_target_stable_buffer),
                },
            },
            contract: ContractReport {
                address: format_address(self.chain.slot_machine()),
                is_closed: contract.is_closed,
                total_deposited: format_amount(contract.total_deposited),
                current_debt: format_amount(contract.outstanding_debt),
                bankroll: format_amount(contract.available_bankroll()),
                max_bet: format_amount(contract.max_single_bet),
                min_trigger: format_amount(t.contract_topup_trigger_bankroll),
                target: format_amount(t.contract_target_bankroll),
            },
            vrf,
            actions: self.actions,
            alerts: self.alerts.iter().map(AlertDigest::from).collect(),
        }
    }
}

fn level(value: Decimal, min: Decimal, target: Decimal) -> Level {
    Level {
        value: format_amount(value),
        ok: value >= min,
        min: format_amount(min),
        target: format_amount(target),
    }
}

fn subscription_alert(
    key: &'static str,
    unit: &str,
    id: String,
    value: Decimal,
    min: Decimal,
    target: Decimal,
) -> Alert {
    let topup = (target - value).max(Decimal::ZERO);
    Alert::warning(
        key,
        format!(
            "<b>WARNING: VRF Subscription {unit} Low</b>\n\n\
             Current {unit} balance: {} {unit}\n\
             Minimum threshold: {} {unit}\n\
             Target balance: {} {unit}\n\n\
             If the subscription runs dry, new spins will fail.\n\n\
             <b>Action required:</b> top up the VRF subscription\n\
             Subscription ID: {id}\n\n\
             <b>Recommended top-up:</b> {} {unit}",
            format_amount(value),
            format_amount(min),
            format_amount(target),
            format_amount(topup),
        ),
    )
}

/// Grants the slot machine an unlimited stable allowance if it has none, so later
/// deposits skip the approval.
pub async fn ensure_allowance(chain: &dyn Chain) -> Result<(), ChainError> {
    let spender = chain.slot_machine();
    let allowance = chain.stable_allowance(chain.executor(), spender).await?;
    if allowance > Decimal::ZERO {
        info!(%allowance, "stable allowance already granted");
        return Ok(());
    }
    let tx_hash = chain.approve_stable_max(spender).await?;
    info!(tx_hash = %format_hash(tx_hash), "stable allowance approved");
    Ok(())
}

/// Runs a pass every `period` until the task is aborted. Missed ticks are skipped.
pub fn spawn_scheduler(agent: Arc<Agent>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = period.as_secs(), "reconciliation scheduler started");
        loop {
            interval.tick().await;
            if let Err(err) = reconcile(&agent).await {
                warn!(%err, "scheduled reconciliation failed");
            }
        }
    })
}
