//! Lotero relay agent.
//!
//! Sells slot machine spins and gasless claims over x402 and keeps the contract
//! funded from a single executor wallet.
//!
//! ## Components
//! - [`gate`]: fail-closed solvency checks run before any spin or claim.
//! - [`spin`] / [`claim`]: stateless execution services; idempotence is left to the
//!   contract.
//! - [`treasury`]: one reconciliation pass (auto top-up, dev-fee sweep, alerts).
//!   Safe to run repeatedly; with nothing changing externally it converges after one
//!   transfer.
//!
//! All chain access goes through [`Chain`], so every component runs against
//! [`mocks::MockChain`] in tests.

pub mod api;
pub mod chain;
pub mod claim;
pub mod config;
pub mod evm;
pub mod gate;
pub mod notify;
pub mod payment;
pub mod spin;
pub mod treasury;

#[cfg(test)]
mod treasury_tests;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use api::Api;
pub use chain::{Chain, ChainError};
pub use config::Settings;
pub use notify::{Notifier, NoopNotifier, TelegramNotifier};
pub use payment::{FacilitatorGate, PaymentGate};

use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything the gate, the execution services and the treasury loop need. Built
/// once at startup and shared read-only.
pub struct Agent {
    pub chain: Arc<dyn Chain>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: Settings,
    // Reconciliation passes never overlap.
    reconcile_lock: Mutex<()>,
}

impl Agent {
    pub fn new(chain: Arc<dyn Chain>, notifier: Arc<dyn Notifier>, settings: Settings) -> Self {
        Self {
            chain,
            notifier,
            settings,
            reconcile_lock: Mutex::new(()),
        }
    }
}
