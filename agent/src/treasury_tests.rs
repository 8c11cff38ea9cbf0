use crate::{
    config::{Settings, TelegramConfig},
    mocks::{
        silent_endpoint, test_agent, test_agent_with, MockChain, MockState, Read,
        RecordingNotifier, Write, WriteKind,
    },
    notify::TelegramNotifier,
    treasury::{ensure_allowance, reconcile, TreasuryError},
    Agent,
};
use ethers::types::U256;
use lotero_types::{api::ActionKind, Severity, Thresholds};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{sync::Arc, time::Duration};

fn chain_with(f: impl FnOnce(&mut MockState)) -> Arc<MockChain> {
    let chain = Arc::new(MockChain::default());
    chain.update(f);
    chain
}

fn recording_agent(chain: Arc<MockChain>) -> (Agent, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let agent = test_agent_with(chain, notifier.clone(), Thresholds::default());
    (agent, notifier)
}

/// Lets detached pre-transfer notices reach the notifier.
async fn flush_notices() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn queued_keys(report: &lotero_types::api::TreasuryReport) -> Vec<&'static str> {
    report.alerts.iter().map(|alert| alert.key).collect()
}

fn agent_with_subscription(chain: Arc<MockChain>) -> (Agent, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let agent = Agent::new(
        chain,
        notifier.clone(),
        Settings {
            thresholds: Thresholds::default(),
            subscription_id: Some(U256::from(42u64)),
            network: "base".to_string(),
        },
    );
    (agent, notifier)
}

#[tokio::test]
async fn closed_contract_gets_partial_top_up_within_wallet_buffer() {
    let chain = chain_with(|state| {
        state.executor_stable = dec!(50);
        state.total_deposited = dec!(20);
        state.closed = true;
        state.reopen_at = dec!(90);
    });
    let (agent, notifier) = recording_agent(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert_eq!(chain.writes(), vec![Write::Approve, Write::Deposit(dec!(40))]);
    let state = chain.snapshot();
    assert_eq!(state.bankroll(), dec!(60));
    assert_eq!(state.executor_stable, dec!(10));
    assert!(state.closed);

    assert_eq!(queued_keys(&report), vec!["auto_topup_partial"]);
    flush_notices().await;
    assert!(notifier.find("auto_topup_pre").is_some());
    let partial = notifier.find("auto_topup_partial").unwrap();
    assert_eq!(partial.severity, Severity::Warning);
    assert!(partial.message.contains("30.0 USDC"));

    assert_eq!(report.contract.bankroll, "60.0");
    assert!(report.contract.is_closed);
    assert_eq!(report.wallet.stable.value, "10.0");
    assert_eq!(report.actions.len(), 1);
    assert_eq!(report.actions[0].kind, ActionKind::TopUp);
    assert_eq!(report.actions[0].amount, "40.0");
    assert!(report.actions[0].ok);
}

#[tokio::test]
async fn top_up_that_reopens_the_contract_reports_success() {
    let chain = chain_with(|state| {
        state.total_deposited = dec!(20);
        state.closed = true;
    });
    let (agent, notifier) = recording_agent(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert_eq!(chain.deposits(), vec![dec!(40)]);
    assert!(!chain.snapshot().closed);
    assert_eq!(queued_keys(&report), vec!["auto_topup_success"]);
    flush_notices().await;
    let pre = notifier.find("auto_topup_pre").unwrap();
    assert!(pre.message.contains("Bankroll after transfer:</b> 60.0 USDC"));
    assert!(notifier
        .find("auto_topup_success")
        .unwrap()
        .message
        .contains("Contract Reopened"));
}

#[tokio::test]
async fn wallet_below_buffer_alerts_instead_of_transferring() {
    let chain = chain_with(|state| {
        state.executor_stable = dec!(5);
        state.total_deposited = dec!(20);
        state.closed = true;
    });
    let (agent, notifier) = recording_agent(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert!(chain.writes().is_empty());
    assert!(report.actions.is_empty());
    assert_eq!(notifier.keys(), vec!["contract_wallet_critical", "wallet_usdc_low"]);
    let critical = &notifier.sent()[0];
    assert_eq!(critical.severity, Severity::Critical);
    // 5 to restore the wallet buffer plus 70 to reach the target bankroll.
    assert!(critical.message.contains("75.0 USDC"));
}

#[tokio::test]
async fn funding_never_overshoots_target_or_drains_buffer() {
    let thresholds = Thresholds::default();
    let stables = [
        dec!(0),
        dec!(9.999999),
        dec!(10),
        dec!(10.5),
        dec!(14.999999),
        dec!(15),
        dec!(30),
        dec!(50),
        dec!(200),
    ];
    let bankrolls = [
        dec!(0),
        dec!(20),
        dec!(59.999999),
        dec!(60),
        dec!(85),
        dec!(89.5),
        dec!(90),
        dec!(120),
    ];
    for stable in stables {
        for bankroll in bankrolls {
            for closed in [false, true] {
                let chain = chain_with(|state| {
                    state.executor_stable = stable;
                    state.total_deposited = bankroll;
                    state.closed = closed;
                });
                let agent = test_agent(chain.clone());
                reconcile(&agent).await.unwrap();

                let sent: Decimal = chain.deposits().iter().copied().sum();
                let headroom = (thresholds.contract_target_bankroll - bankroll).max(Decimal::ZERO);
                let context = format!("stable={stable} bankroll={bankroll} closed={closed}");
                assert!(sent <= headroom, "overshoot: {context} sent={sent}");
                if stable < thresholds.wallet_min_stable_buffer {
                    assert_eq!(sent, Decimal::ZERO, "drained wallet: {context}");
                } else {
                    assert!(
                        stable - sent >= thresholds.wallet_min_stable_buffer,
                        "below buffer: {context} sent={sent}"
                    );
                }
                assert!(chain.snapshot().bankroll() <= thresholds.contract_target_bankroll.max(bankroll));
            }
        }
    }
}

#[tokio::test]
async fn repeated_passes_transfer_at_most_once() {
    // Open and above trigger, but below target with spare wallet funds.
    let chain = chain_with(|state| state.total_deposited = dec!(70));
    let agent = test_agent(chain.clone());

    let first = reconcile(&agent).await.unwrap();
    let second = reconcile(&agent).await.unwrap();
    let third = reconcile(&agent).await.unwrap();

    assert_eq!(chain.deposits(), vec![dec!(20)]);
    assert_eq!(first.actions[0].kind, ActionKind::Reinforce);
    assert!(second.actions.is_empty());
    assert!(third.actions.is_empty());
    assert_eq!(third.contract.bankroll, "90.0");
}

#[tokio::test]
async fn repeated_passes_after_partial_top_up_do_not_drain_wallet() {
    let chain = chain_with(|state| {
        state.total_deposited = dec!(20);
        state.closed = true;
        state.reopen_at = dec!(90);
    });
    let agent = test_agent(chain.clone());

    for _ in 0..3 {
        reconcile(&agent).await.unwrap();
    }

    assert_eq!(chain.deposits(), vec![dec!(40)]);
    assert_eq!(chain.snapshot().executor_stable, dec!(10));
}

#[tokio::test]
async fn concurrent_passes_do_not_overlap() {
    let chain = chain_with(|state| state.total_deposited = dec!(70));
    let agent = test_agent(chain.clone());

    let (first, second) = tokio::join!(reconcile(&agent), reconcile(&agent));
    first.unwrap();
    second.unwrap();

    assert_eq!(chain.deposits(), vec![dec!(20)]);
}

#[tokio::test]
async fn reinforcement_requires_minimum_excess() {
    let chain = chain_with(|state| {
        state.executor_stable = dec!(14.99);
        state.total_deposited = dec!(70);
    });
    let agent = test_agent(chain.clone());
    reconcile(&agent).await.unwrap();
    assert!(chain.deposits().is_empty());

    chain.update(|state| state.executor_stable = dec!(15));
    reconcile(&agent).await.unwrap();
    assert_eq!(chain.deposits(), vec![dec!(5)]);
}

#[tokio::test]
async fn existing_allowance_skips_approval() {
    let chain = chain_with(|state| {
        state.allowance = Decimal::MAX;
        state.total_deposited = dec!(70);
    });
    let agent = test_agent(chain.clone());
    reconcile(&agent).await.unwrap();
    assert_eq!(chain.writes(), vec![Write::Deposit(dec!(20))]);
}

#[tokio::test]
async fn dev_fees_below_minimum_are_left_alone() {
    let chain = chain_with(|state| {
        state.dev_fees.earned = dec!(4.99);
    });
    let (agent, notifier) = recording_agent(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert!(chain.writes().is_empty());
    assert!(report.actions.is_empty());
    assert!(notifier.sent().is_empty());
}

#[tokio::test]
async fn dev_fees_are_swept_into_the_wallet() {
    let chain = chain_with(|state| {
        state.dev_fees.earned = dec!(12);
        state.dev_fees.claimed = dec!(2);
    });
    let (agent, notifier) = recording_agent(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert_eq!(chain.writes(), vec![Write::ClaimDev]);
    assert_eq!(chain.snapshot().executor_stable, dec!(60));
    assert_eq!(notifier.keys(), vec!["dev_claim"]);
    assert!(notifier.sent()[0].message.contains("10.0 USDC"));
    assert_eq!(report.actions[0].kind, ActionKind::DevClaim);
    assert_eq!(report.actions[0].amount, "10.0");
    assert_eq!(report.wallet.stable.value, "60.0");
}

#[tokio::test]
async fn swept_fees_feed_reinforcement_in_the_same_pass() {
    let chain = chain_with(|state| {
        state.executor_stable = dec!(10);
        state.total_deposited = dec!(70);
        state.dev_fees.earned = dec!(8);
    });
    let agent = test_agent(chain.clone());

    reconcile(&agent).await.unwrap();

    assert_eq!(
        chain.writes(),
        vec![Write::ClaimDev, Write::Approve, Write::Deposit(dec!(8))]
    );
}

#[tokio::test]
async fn dev_claim_that_moves_nothing_raises_no_alert() {
    let chain = chain_with(|state| {
        state.dev_fees.earned = dec!(10);
        state.dev_claim_pays = false;
    });
    let (agent, notifier) = recording_agent(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert_eq!(chain.writes(), vec![Write::ClaimDev]);
    assert!(notifier.sent().is_empty());
    assert_eq!(report.actions[0].amount, "0.0");
    assert!(report.actions[0].ok);
}

#[tokio::test]
async fn dev_claim_errors_never_abort_the_pass() {
    for reason in ["execution reverted: Not a team member", "nonce too low"] {
        let chain = chain_with(|state| {
            state.dev_fees.earned = dec!(10);
            state.subscription.link_balance = dec!(0.1);
        });
        chain.fail_write(WriteKind::ClaimDev, reason);
        let (agent, notifier) = agent_with_subscription(chain.clone());

        let report = reconcile(&agent).await.unwrap();

        let action = &report.actions[0];
        assert_eq!(action.kind, ActionKind::DevClaim);
        assert!(!action.ok);
        assert!(action.error.as_deref().unwrap().contains(reason));
        // Later steps still ran.
        assert_eq!(notifier.keys(), vec!["vrf_link_low"]);
    }
}

#[tokio::test]
async fn dev_fee_read_failure_is_skipped() {
    let chain = chain_with(|state| state.dev_fees.earned = dec!(10));
    chain.fail_read(Read::DevFees);
    let agent = test_agent(chain.clone());
    let report = reconcile(&agent).await.unwrap();
    assert!(chain.writes().is_empty());
    assert!(report.actions.is_empty());
}

#[tokio::test]
async fn failed_transfer_is_isolated_to_its_step() {
    let chain = chain_with(|state| {
        state.total_deposited = dec!(20);
        state.closed = true;
        state.dev_fees.earned = dec!(6);
    });
    chain.fail_write(WriteKind::Deposit, "insufficient funds for gas");
    let (agent, notifier) = recording_agent(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert_eq!(chain.deposits(), Vec::<Decimal>::new());
    assert!(chain.writes().contains(&Write::ClaimDev));
    let top_up = &report.actions[0];
    assert_eq!(top_up.kind, ActionKind::TopUp);
    assert!(!top_up.ok);
    assert_eq!(report.actions[1].kind, ActionKind::DevClaim);
    // No reinforcement attempt after the failed transfer.
    assert_eq!(report.actions.len(), 2);

    assert_eq!(queued_keys(&report), vec!["auto_topup_error", "dev_claim"]);
    flush_notices().await;
    assert!(notifier.find("auto_topup_pre").is_some());
    let error = notifier.find("auto_topup_error").unwrap();
    assert_eq!(error.severity, Severity::Critical);
    assert!(error.message.contains("insufficient funds for gas"));
    assert!(error.message.contains("40.0 USDC"));
}

#[tokio::test]
async fn stalled_alert_channel_does_not_hold_up_transfers() {
    let chain = chain_with(|state| {
        state.executor_stable = dec!(50);
        state.total_deposited = dec!(20);
        state.closed = true;
        state.reopen_at = dec!(90);
    });
    let config = TelegramConfig {
        bot_token: "123:abc".to_string(),
        chat_id: "-100".to_string(),
    };
    let notifier = TelegramNotifier::with_api_base(&config, &silent_endpoint().await.unwrap())
        .with_timeout(Duration::from_millis(200));
    let agent = test_agent_with(chain.clone(), Arc::new(notifier), Thresholds::default());

    let report = tokio::time::timeout(Duration::from_secs(5), reconcile(&agent))
        .await
        .expect("pass must finish while the alert channel hangs")
        .unwrap();

    assert_eq!(chain.deposits(), vec![dec!(40)]);
    assert_eq!(report.actions.len(), 1);
    assert!(report.actions[0].ok);
    // The next pass is not stuck behind the first one.
    tokio::time::timeout(Duration::from_secs(5), reconcile(&agent))
        .await
        .expect("second pass must not wait on the first")
        .unwrap();
}

#[tokio::test]
async fn failed_approval_aborts_the_transfer() {
    let chain = chain_with(|state| {
        state.total_deposited = dec!(20);
        state.closed = true;
    });
    chain.fail_write(WriteKind::Approve, "execution reverted");
    let (agent, notifier) = recording_agent(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert!(chain.writes().is_empty());
    assert!(!report.actions[0].ok);
    assert!(notifier.keys().contains(&"auto_topup_error"));
}

#[tokio::test]
async fn initial_read_failures_fail_the_pass() {
    let chain = Arc::new(MockChain::default());
    chain.fail_read(Read::StableBalance);
    let agent = test_agent(chain);
    assert!(matches!(
        reconcile(&agent).await.unwrap_err(),
        TreasuryError::Wallet(_)
    ));

    let chain = Arc::new(MockChain::default());
    chain.fail_read(Read::ContractState);
    let agent = test_agent(chain);
    assert!(matches!(
        reconcile(&agent).await.unwrap_err(),
        TreasuryError::Contract(_)
    ));
}

#[tokio::test]
async fn subscription_read_failure_is_recorded_without_alert() {
    let chain = Arc::new(MockChain::default());
    chain.fail_read(Read::Subscription);
    let (agent, notifier) = agent_with_subscription(chain);

    let report = reconcile(&agent).await.unwrap();

    assert_eq!(report.vrf.subscription_id.as_deref(), Some("42"));
    assert!(report.vrf.error.is_some());
    assert!(report.vrf.link.is_none());
    assert!(notifier.sent().is_empty());
}

#[tokio::test]
async fn subscription_checked_in_the_contract_payment_currency() {
    let chain = chain_with(|state| {
        state.uses_native_payment = true;
        state.subscription.native_balance = dec!(0.005);
        state.subscription.link_balance = dec!(0);
    });
    let (agent, notifier) = agent_with_subscription(chain.clone());

    let report = reconcile(&agent).await.unwrap();

    assert_eq!(notifier.keys(), vec!["vrf_native_low"]);
    assert!(notifier.sent()[0].message.contains("Subscription ID: 42"));
    let native = report.vrf.native.unwrap();
    assert!(!native.ok);
    assert_eq!(native.value, "0.005");
    assert!(report.vrf.link.is_none());

    chain.update(|state| state.uses_native_payment = false);
    let report = reconcile(&agent).await.unwrap();
    assert!(!report.vrf.link.unwrap().ok);
    assert_eq!(notifier.keys(), vec!["vrf_native_low", "vrf_link_low"]);
}

#[tokio::test]
async fn alerts_are_delivered_critical_first() {
    let chain = chain_with(|state| {
        state.executor_native = dec!(0.001);
        state.executor_stable = dec!(5);
        state.subscription.link_balance = dec!(0.2);
    });
    let (agent, notifier) = agent_with_subscription(chain);

    let report = reconcile(&agent).await.unwrap();

    assert_eq!(notifier.keys(), vec!["eth_low", "vrf_link_low", "wallet_usdc_low"]);
    let queued: Vec<&str> = report.alerts.iter().map(|alert| alert.key).collect();
    assert_eq!(queued, vec!["eth_low", "wallet_usdc_low", "vrf_link_low"]);
    // Recommended top-up is target minus current.
    assert!(notifier.sent()[0].message.contains("0.049 ETH"));
}

#[tokio::test]
async fn persistent_conditions_alert_on_every_pass() {
    let chain = chain_with(|state| state.executor_native = dec!(0.001));
    let (agent, notifier) = recording_agent(chain);
    reconcile(&agent).await.unwrap();
    reconcile(&agent).await.unwrap();
    assert_eq!(notifier.keys(), vec!["eth_low", "eth_low"]);
}

#[tokio::test]
async fn failing_notifier_does_not_fail_the_pass() {
    let chain = chain_with(|state| {
        state.executor_native = dec!(0.001);
        state.total_deposited = dec!(20);
        state.closed = true;
    });
    let agent = test_agent_with(
        chain.clone(),
        Arc::new(RecordingNotifier::failing()),
        Thresholds::default(),
    );
    let report = reconcile(&agent).await.unwrap();
    assert_eq!(chain.deposits(), vec![dec!(40)]);
    assert_eq!(report.alerts.len(), 2);
}

#[tokio::test]
async fn report_serializes_in_client_shape() {
    let chain = chain_with(|state| state.total_deposited = dec!(70));
    let agent = test_agent(chain);

    let report = reconcile(&agent).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["network"], "base");
    assert_eq!(json["wallet"]["native"]["min"], "0.01");
    assert_eq!(json["wallet"]["stable"]["minBuffer"], "10.0");
    assert_eq!(json["contract"]["minTrigger"], "60.0");
    assert_eq!(json["contract"]["bankroll"], "90.0");
    assert_eq!(json["vrf"]["paymentMode"], "link");
    assert_eq!(json["actions"][0]["kind"], "reinforce");
    assert_eq!(json["actions"][0]["amount"], "20.0");
    assert_eq!(json["alerts"][0]["severity"], "info");
    assert_eq!(json["alerts"][0]["key"], "auto_topup_success");
    assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn startup_approval_runs_once() {
    let chain = Arc::new(MockChain::default());
    ensure_allowance(chain.as_ref()).await.unwrap();
    ensure_allowance(chain.as_ref()).await.unwrap();
    assert_eq!(chain.writes(), vec![Write::Approve]);

    let chain = Arc::new(MockChain::default());
    chain.fail_write(WriteKind::Approve, "execution reverted");
    assert!(ensure_allowance(chain.as_ref()).await.is_err());
}
