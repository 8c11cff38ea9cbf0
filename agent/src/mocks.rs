//! In-memory collaborators for tests.

use crate::{
    chain::{Chain, ChainError, SpinSubmission},
    config::Settings,
    notify::{Delivery, Notifier, NotifyError},
    payment::{PaymentError, PaymentGate, PaymentRequirements, Settlement},
    Agent,
};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use lotero_types::{
    Alert, ContractState, DevFees, RoundInfo, SubscriptionState, Thresholds, UserAccount,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

/// Reads that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Read {
    NativeBalance,
    StableBalance,
    Allowance,
    ContractState,
    IsClosed,
    UsesNativePayment,
    UserAccount,
    DevFees,
    Subscription,
    Round,
}

/// Writes that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Approve,
    Deposit,
    Spin,
    ClaimPlayer,
    ClaimDev,
}

/// A write accepted by the mock, in submission order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Approve,
    Deposit(Decimal),
    Spin {
        player: Address,
        referral: Address,
        amount: Decimal,
    },
    ClaimPlayer {
        user: Address,
        amount: Decimal,
    },
    ClaimDev,
}

#[derive(Clone, Debug)]
pub struct MockState {
    pub executor_native: Decimal,
    pub executor_stable: Decimal,
    pub allowance: Decimal,
    pub total_deposited: Decimal,
    pub outstanding_debt: Decimal,
    pub closed: bool,
    /// The contract is open exactly when its available bankroll reaches this value.
    pub reopen_at: Decimal,
    pub uses_native_payment: bool,
    pub max_single_bet: Decimal,
    pub accounts: HashMap<Address, UserAccount>,
    pub dev_fees: DevFees,
    /// When false, dev claims succeed but move nothing (caller not a fee recipient).
    pub dev_claim_pays: bool,
    pub subscription: SubscriptionState,
    pub rounds: HashMap<U256, (bool, RoundInfo)>,
    pub emit_spin_event: bool,
    pub next_request_id: u64,
    pub failing_reads: HashSet<Read>,
    pub failing_writes: HashMap<WriteKind, String>,
    pub writes: Vec<Write>,
    tx_counter: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            executor_native: dec!(0.05),
            executor_stable: dec!(50),
            allowance: Decimal::ZERO,
            total_deposited: dec!(90),
            outstanding_debt: Decimal::ZERO,
            closed: false,
            reopen_at: dec!(30),
            uses_native_payment: false,
            max_single_bet: dec!(3),
            accounts: HashMap::new(),
            dev_fees: DevFees::default(),
            dev_claim_pays: true,
            subscription: SubscriptionState {
                link_balance: dec!(1),
                native_balance: dec!(0.05),
            },
            rounds: HashMap::new(),
            emit_spin_event: true,
            next_request_id: 1,
            failing_reads: HashSet::new(),
            failing_writes: HashMap::new(),
            writes: Vec::new(),
            tx_counter: 0,
        }
    }
}

impl MockState {
    pub fn bankroll(&self) -> Decimal {
        (self.total_deposited - self.outstanding_debt).max(Decimal::ZERO)
    }

    fn read(&self, read: Read) -> Result<(), ChainError> {
        if self.failing_reads.contains(&read) {
            return Err(ChainError::Rpc(format!("{read:?}: connection refused")));
        }
        Ok(())
    }

    fn write(&mut self, kind: WriteKind) -> Result<H256, ChainError> {
        if let Some(reason) = self.failing_writes.get(&kind) {
            return Err(ChainError::Rpc(reason.clone()));
        }
        self.tx_counter += 1;
        Ok(H256::from_low_u64_be(self.tx_counter))
    }

    fn apply_open_rule(&mut self) {
        self.closed = self.bankroll() < self.reopen_at;
    }
}

/// Model of the executor wallet, stable token allowance, slot machine and
/// randomness subscription.
pub struct MockChain {
    executor: Address,
    slot_machine: Address,
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new(MockState::default())
    }
}

impl MockChain {
    pub fn new(state: MockState) -> Self {
        Self {
            executor: Address::repeat_byte(0xe0),
            slot_machine: Address::repeat_byte(0x5a),
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn update(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.lock());
    }

    pub fn snapshot(&self) -> MockState {
        self.lock().clone()
    }

    pub fn fail_read(&self, read: Read) {
        self.lock().failing_reads.insert(read);
    }

    pub fn fail_write(&self, kind: WriteKind, reason: &str) {
        self.lock().failing_writes.insert(kind, reason.to_string());
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    /// Amounts deposited into the slot machine, in order.
    pub fn deposits(&self) -> Vec<Decimal> {
        self.lock()
            .writes
            .iter()
            .filter_map(|write| match write {
                Write::Deposit(amount) => Some(*amount),
                _ => None,
            })
            .collect()
    }

    pub fn set_account(&self, user: Address, account: UserAccount) {
        self.lock().accounts.insert(user, account);
    }
}

#[async_trait]
impl Chain for MockChain {
    fn executor(&self) -> Address {
        self.executor
    }

    fn slot_machine(&self) -> Address {
        self.slot_machine
    }

    async fn native_balance(&self, who: Address) -> Result<Decimal, ChainError> {
        let state = self.lock();
        state.read(Read::NativeBalance)?;
        Ok(if who == self.executor {
            state.executor_native
        } else {
            Decimal::ZERO
        })
    }

    async fn stable_balance(&self, who: Address) -> Result<Decimal, ChainError> {
        let state = self.lock();
        state.read(Read::StableBalance)?;
        Ok(if who == self.executor {
            state.executor_stable
        } else {
            Decimal::ZERO
        })
    }

    async fn stable_allowance(
        &self,
        owner: Address,
        spender: Address,
    ) -> Result<Decimal, ChainError> {
        let state = self.lock();
        state.read(Read::Allowance)?;
        Ok(if owner == self.executor && spender == self.slot_machine {
            state.allowance
        } else {
            Decimal::ZERO
        })
    }

    async fn contract_state(&self) -> Result<ContractState, ChainError> {
        let state = self.lock();
        state.read(Read::ContractState)?;
        Ok(ContractState {
            total_deposited: state.total_deposited,
            outstanding_debt: state.outstanding_debt,
            is_closed: state.closed,
            uses_native_randomness_payment: state.uses_native_payment,
            max_single_bet: state.max_single_bet,
        })
    }

    async fn is_closed(&self) -> Result<bool, ChainError> {
        let state = self.lock();
        state.read(Read::IsClosed)?;
        Ok(state.closed)
    }

    async fn uses_native_payment(&self) -> Result<bool, ChainError> {
        let state = self.lock();
        state.read(Read::UsesNativePayment)?;
        Ok(state.uses_native_payment)
    }

    async fn user_account(&self, user: Address) -> Result<UserAccount, ChainError> {
        let state = self.lock();
        state.read(Read::UserAccount)?;
        Ok(state.accounts.get(&user).cloned().unwrap_or_default())
    }

    async fn dev_fees(&self) -> Result<DevFees, ChainError> {
        let state = self.lock();
        state.read(Read::DevFees)?;
        Ok(state.dev_fees)
    }

    async fn subscription(&self, _id: U256) -> Result<SubscriptionState, ChainError> {
        let state = self.lock();
        state.read(Read::Subscription)?;
        Ok(state.subscription)
    }

    async fn round(&self, request_id: U256) -> Result<(bool, RoundInfo), ChainError> {
        let state = self.lock();
        state.read(Read::Round)?;
        Ok(state.rounds.get(&request_id).cloned().unwrap_or_default())
    }

    async fn approve_stable_max(&self, spender: Address) -> Result<H256, ChainError> {
        let mut state = self.lock();
        let hash = state.write(WriteKind::Approve)?;
        if spender == self.slot_machine {
            state.allowance = Decimal::MAX;
        }
        state.writes.push(Write::Approve);
        Ok(hash)
    }

    async fn deposit(&self, amount: Decimal) -> Result<H256, ChainError> {
        let mut state = self.lock();
        if state.allowance < amount {
            return Err(ChainError::Rpc(
                "execution reverted: ERC20: insufficient allowance".to_string(),
            ));
        }
        if state.executor_stable < amount {
            return Err(ChainError::Rpc(
                "execution reverted: ERC20: transfer amount exceeds balance".to_string(),
            ));
        }
        let hash = state.write(WriteKind::Deposit)?;
        if state.allowance != Decimal::MAX {
            state.allowance -= amount;
        }
        state.executor_stable -= amount;
        state.total_deposited += amount;
        state.apply_open_rule();
        state.writes.push(Write::Deposit(amount));
        Ok(hash)
    }

    async fn spin_for(
        &self,
        player: Address,
        referral: Address,
        amount: Decimal,
    ) -> Result<SpinSubmission, ChainError> {
        let mut state = self.lock();
        let tx_hash = state.write(WriteKind::Spin)?;
        state.executor_stable -= amount;
        state.total_deposited += amount;
        state.writes.push(Write::Spin {
            player,
            referral,
            amount,
        });
        let request_id = if state.emit_spin_event {
            let id = U256::from(state.next_request_id);
            state.next_request_id += 1;
            Some(id)
        } else {
            None
        };
        Ok(SpinSubmission {
            tx_hash,
            request_id,
        })
    }

    async fn claim_player_earnings(&self, user: Address) -> Result<H256, ChainError> {
        let mut state = self.lock();
        let hash = state.write(WriteKind::ClaimPlayer)?;
        let account = state.accounts.entry(user).or_default();
        let amount = account.claimable();
        account.total_claimed = account.total_earned;
        account.referral_claimed = account.referral_earned;
        state.total_deposited -= amount;
        state.writes.push(Write::ClaimPlayer { user, amount });
        Ok(hash)
    }

    async fn claim_dev_earnings(&self) -> Result<H256, ChainError> {
        let mut state = self.lock();
        let hash = state.write(WriteKind::ClaimDev)?;
        if state.dev_claim_pays {
            let pending = state.dev_fees.pending();
            state.dev_fees.claimed = state.dev_fees.earned;
            state.executor_stable += pending;
        }
        state.writes.push(Write::ClaimDev);
        Ok(hash)
    }
}

/// Records every alert it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Alert>>,
    failing: bool,
}

impl RecordingNotifier {
    /// A notifier whose sends all fail after being recorded.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<Alert> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.sent().iter().map(|alert| alert.key).collect()
    }

    /// First recorded alert with `key`.
    pub fn find(&self, key: &str) -> Option<Alert> {
        self.sent().into_iter().find(|alert| alert.key == key)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, alert: &Alert) -> Result<Delivery, NotifyError> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(alert.clone());
        if self.failing {
            return Err(NotifyError::Rejected {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        Ok(Delivery::Sent)
    }
}

/// Payment gate with a fixed verdict.
pub struct StaticPaymentGate {
    accept: bool,
    settle_ok: bool,
    settled: Mutex<Vec<String>>,
}

impl StaticPaymentGate {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            settle_ok: true,
            settled: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            accept: false,
            settle_ok: true,
            settled: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_settlement() -> Self {
        Self {
            accept: true,
            settle_ok: false,
            settled: Mutex::new(Vec::new()),
        }
    }

    /// Resources settled so far.
    pub fn settled(&self) -> Vec<String> {
        self.settled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl PaymentGate for StaticPaymentGate {
    async fn verify(
        &self,
        _header: &str,
        _requirements: &PaymentRequirements,
    ) -> Result<(), PaymentError> {
        if self.accept {
            Ok(())
        } else {
            Err(PaymentError::Invalid("invalid_exact_evm_payload_signature".to_string()))
        }
    }

    async fn settle(
        &self,
        _header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement, PaymentError> {
        if !self.settle_ok {
            return Err(PaymentError::Invalid("settlement_failed".to_string()));
        }
        self.settled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(requirements.resource.clone());
        Ok(Settlement {
            success: true,
            transaction: Some(format!("{:#x}", H256::repeat_byte(0xab))),
            network: requirements.network.clone(),
            payer: None,
            error_reason: None,
        })
    }
}

/// Agent over a mock chain with default thresholds and a recording notifier.
pub fn test_agent(chain: Arc<MockChain>) -> Agent {
    test_agent_with(chain, Arc::new(RecordingNotifier::default()), Thresholds::default())
}

pub fn test_agent_with(
    chain: Arc<MockChain>,
    notifier: Arc<dyn Notifier>,
    thresholds: Thresholds,
) -> Agent {
    Agent::new(
        chain,
        notifier,
        Settings {
            thresholds,
            subscription_id: None,
            network: "base".to_string(),
        },
    )
}

/// Base URL of a local listener that accepts connections and never answers.
pub async fn silent_endpoint() -> std::io::Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    Ok(format!("http://{address}"))
}
