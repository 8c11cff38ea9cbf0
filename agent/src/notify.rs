//! Operator alert sink.
//!
//! Delivery is best-effort: a failed send is logged and never retried or escalated.

use crate::config::TelegramConfig;
use async_trait::async_trait;
use lotero_types::Alert;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Upper bound on one Telegram send, response body included.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram rejected message: {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("telegram did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No channel is configured.
    Skipped,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, alert: &Alert) -> Result<Delivery, NotifyError>;
}

/// Used when no alert channel is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, alert: &Alert) -> Result<Delivery, NotifyError> {
        debug!(key = alert.key, severity = alert.severity.as_str(), "alert skipped");
        Ok(Delivery::Skipped)
    }
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    url: String,
    chat_id: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        Self::with_api_base(config, TELEGRAM_API_BASE)
    }

    pub fn with_api_base(config: &TelegramConfig, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!(
                "{}/bot{}/sendMessage",
                api_base.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
            timeout: SEND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post(&self, alert: &Alert) -> Result<Delivery, NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text: &alert.message,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Delivery::Sent)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, alert: &Alert) -> Result<Delivery, NotifyError> {
        tokio::time::timeout(self.timeout, self.post(alert))
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))?
    }
}

/// Telegram when configured, otherwise a notifier that skips every alert.
pub fn from_config(telegram: Option<&TelegramConfig>) -> Arc<dyn Notifier> {
    match telegram {
        Some(config) => {
            info!(chat_id = %config.chat_id, "telegram alerts enabled");
            Arc::new(TelegramNotifier::new(config))
        }
        None => {
            info!("telegram not configured; alerts will be skipped");
            Arc::new(NoopNotifier)
        }
    }
}

/// Sends one alert immediately, swallowing failures.
pub async fn notify_now(notifier: &dyn Notifier, alert: &Alert) -> Option<Delivery> {
    match notifier.send(alert).await {
        Ok(delivery) => Some(delivery),
        Err(err) => {
            warn!(key = alert.key, severity = alert.severity.as_str(), %err, "alert delivery failed");
            None
        }
    }
}

/// Sends one alert on its own task so the caller never waits on the channel.
pub fn notify_detached(notifier: Arc<dyn Notifier>, alert: Alert) {
    tokio::spawn(async move {
        notify_now(notifier.as_ref(), &alert).await;
    });
}

/// Sends queued alerts critical first, then warning, then info. Alerts of equal
/// severity keep their queue order.
pub async fn deliver(notifier: &dyn Notifier, alerts: &[Alert]) -> usize {
    let mut ordered: Vec<&Alert> = alerts.iter().collect();
    ordered.sort_by_key(|alert| alert.severity);
    let mut sent = 0;
    for alert in ordered {
        if let Some(Delivery::Sent) = notify_now(notifier, alert).await {
            sent += 1;
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{silent_endpoint, RecordingNotifier};

    #[tokio::test]
    async fn delivers_in_severity_order() {
        let notifier = RecordingNotifier::default();
        let alerts = vec![
            Alert::info("wallet_usdc_low", "info one"),
            Alert::critical("eth_low", "critical"),
            Alert::warning("vrf_link_low", "warning"),
            Alert::info("dev_claim", "info two"),
        ];
        let sent = deliver(&notifier, &alerts).await;
        assert_eq!(sent, 4);
        assert_eq!(
            notifier.keys(),
            vec!["eth_low", "vrf_link_low", "wallet_usdc_low", "dev_claim"]
        );
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_not_retried() {
        let notifier = RecordingNotifier::failing();
        let alerts = vec![
            Alert::critical("eth_low", "critical"),
            Alert::info("dev_claim", "info"),
        ];
        assert_eq!(deliver(&notifier, &alerts).await, 0);
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn noop_always_skips() {
        let delivery = NoopNotifier
            .send(&Alert::critical("eth_low", "critical"))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Skipped);
    }

    #[tokio::test]
    async fn telegram_transport_errors_surface_to_the_caller() {
        let config = TelegramConfig {
            bot_token: "123:abc".to_string(),
            chat_id: "-100".to_string(),
        };
        // Nothing listens on port 9 locally.
        let notifier = TelegramNotifier::with_api_base(&config, "http://127.0.0.1:9");
        let alert = Alert::warning("vrf_link_low", "warning");
        assert!(notifier.send(&alert).await.is_err());
        assert_eq!(notify_now(&notifier, &alert).await, None);
    }

    #[tokio::test]
    async fn telegram_send_gives_up_on_a_silent_endpoint() {
        let config = TelegramConfig {
            bot_token: "123:abc".to_string(),
            chat_id: "-100".to_string(),
        };
        let base = silent_endpoint().await.unwrap();
        let notifier = TelegramNotifier::with_api_base(&config, &base)
            .with_timeout(Duration::from_millis(100));
        let alert = Alert::critical("eth_low", "critical");

        let result = tokio::time::timeout(Duration::from_secs(5), notifier.send(&alert))
            .await
            .expect("send must be bounded by its own timeout");
        assert!(matches!(result, Err(NotifyError::Timeout(_))));
        assert_eq!(deliver(&notifier, &[alert]).await, 0);
    }

    #[tokio::test]
    async fn detached_notices_are_delivered() {
        let notifier = Arc::new(RecordingNotifier::default());
        notify_detached(notifier.clone(), Alert::info("auto_topup_pre", "sending"));
        assert!(notifier.sent().is_empty());
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(notifier.keys(), vec!["auto_topup_pre"]);
    }
}
