//! Startup configuration: CLI flags, environment fallbacks and the threshold table.
//!
//! Flags win over environment variables, which win over defaults. Everything is
//! read once; there is no runtime reconfiguration.

use crate::{evm::EvmConfig, payment::PaymentConfig};
use clap::Parser;
use ethers::types::{Address, U256};
use lotero_types::{ThresholdError, Thresholds};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 4021;
pub const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";
pub const DEFAULT_CHAIN_ID: u64 = 8453;

/// Native USDC on Base.
pub const DEFAULT_USDC_ADDRESS: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

/// Chainlink VRF v2.5 coordinator on Base.
pub const DEFAULT_VRF_COORDINATOR: &str = "0xd5D517aBE5cF79B7e95eC98dB0f0277788aFF634";

pub const DEFAULT_FACILITATOR_URL: &str = "https://x402.org/facilitator";
pub const DEFAULT_RATE_LIMIT_PER_MIN: u64 = 60;
pub const DEFAULT_RATE_LIMIT_NO_PAYMENT_PER_MIN: u64 = 10;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_TX_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_FACILITATOR_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0} (flag or env var)")]
    Missing(&'static str),
    #[error("invalid {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("failed to read thresholds file {path}: {source}")]
    ThresholdFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse thresholds file: {0}")]
    ThresholdParse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Thresholds(#[from] ThresholdError),
}

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Paid relay agent and treasury loop for the lotero slot machine")]
pub struct Args {
    /// Host interface to bind (default: 0.0.0.0)
    #[arg(long)]
    pub host: Option<IpAddr>,

    #[arg(short, long)]
    pub port: Option<u16>,

    /// EVM JSON-RPC endpoint URL
    #[arg(long)]
    pub rpc_url: Option<String>,

    #[arg(long)]
    pub chain_id: Option<u64>,

    /// Slot machine contract address
    #[arg(long)]
    pub slot_machine: Option<String>,

    /// Executor private key (pays gas, fronts bets, holds the treasury)
    #[arg(long)]
    pub executor_private_key: Option<String>,

    /// Address receiving x402 payments
    #[arg(long)]
    pub pay_to: Option<String>,

    #[arg(long)]
    pub usdc_address: Option<String>,

    #[arg(long)]
    pub vrf_coordinator: Option<String>,

    /// Randomness subscription id (decimal); enables the subscription checks
    #[arg(long)]
    pub vrf_subscription_id: Option<String>,

    #[arg(long)]
    pub facilitator_url: Option<String>,

    /// YAML file overriding any subset of the threshold table
    #[arg(long)]
    pub thresholds: Option<PathBuf>,

    /// Run a reconciliation pass every N seconds (0 disables)
    #[arg(long)]
    pub reconcile_interval_secs: Option<u64>,
}

/// Settings consumed by the gate, the execution services and the treasury loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub thresholds: Thresholds,
    pub subscription_id: Option<U256>,
    /// Human network name reported in treasury snapshots.
    pub network: String,
}

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimits {
    /// Per-IP limit on read-only routes.
    pub per_min: u64,
    /// Per-IP limit on paid routes called without a payment header.
    pub no_payment_per_min: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub evm: EvmConfig,
    pub settings: Settings,
    pub payment: PaymentConfig,
    pub telegram: Option<TelegramConfig>,
    pub rate_limits: RateLimits,
    pub reconcile_interval: Option<Duration>,
}

impl Config {
    /// Resolves flags against environment variables, as seen through `env`.
    pub fn load(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let slot_machine = require_arg_or_env(args.slot_machine, "SLOT_MACHINE_ADDRESS", &lookup)?;
        let private_key =
            require_arg_or_env(args.executor_private_key, "EXECUTOR_PRIVATE_KEY", &lookup)?;
        let pay_to = require_arg_or_env(args.pay_to, "PAY_TO", &lookup)?;
        let pay_to = parse_address("PAY_TO", &pay_to)?;

        let host = match args.host {
            Some(host) => host,
            None => parse_or("HOST", lookup("HOST"), IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
        };
        let port = match args.port {
            Some(port) => port,
            None => parse_or("PORT", lookup("PORT"), DEFAULT_PORT)?,
        };
        let chain_id = match args.chain_id {
            Some(chain_id) => chain_id,
            None => parse_or("CHAIN_ID", lookup("CHAIN_ID"), DEFAULT_CHAIN_ID)?,
        };
        let rpc_url = args
            .rpc_url
            .or_else(|| lookup("BASE_RPC"))
            .unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
        let usdc_address = args
            .usdc_address
            .or_else(|| lookup("USDC_ADDRESS"))
            .unwrap_or_else(|| DEFAULT_USDC_ADDRESS.to_string());
        let asset = parse_address("USDC_ADDRESS", &usdc_address)?;
        let vrf_coordinator = args
            .vrf_coordinator
            .or_else(|| lookup("VRF_COORDINATOR"))
            .unwrap_or_else(|| DEFAULT_VRF_COORDINATOR.to_string());
        let subscription_id = args
            .vrf_subscription_id
            .or_else(|| lookup("VRF_SUBSCRIPTION_ID"))
            .map(|raw| {
                U256::from_dec_str(raw.trim()).map_err(|_| ConfigError::Invalid {
                    key: "VRF_SUBSCRIPTION_ID",
                    value: raw,
                })
            })
            .transpose()?;
        let facilitator_url = args
            .facilitator_url
            .or_else(|| lookup("FACILITATOR_URL"))
            .unwrap_or_else(|| DEFAULT_FACILITATOR_URL.to_string());
        url::Url::parse(&facilitator_url).map_err(|_| ConfigError::Invalid {
            key: "FACILITATOR_URL",
            value: facilitator_url.clone(),
        })?;

        let thresholds = match args.thresholds.or_else(|| lookup("THRESHOLDS_PATH").map(PathBuf::from)) {
            Some(path) => load_thresholds(&path)?,
            None => Thresholds::default(),
        };
        thresholds.validate()?;

        let rpc_timeout = env_u64("RPC_TIMEOUT_SECS", &lookup)?.unwrap_or(DEFAULT_RPC_TIMEOUT_SECS);
        let tx_timeout = env_u64("TX_TIMEOUT_SECS", &lookup)?.unwrap_or(DEFAULT_TX_TIMEOUT_SECS);
        let facilitator_timeout = env_u64("FACILITATOR_TIMEOUT_SECS", &lookup)?
            .unwrap_or(DEFAULT_FACILITATOR_TIMEOUT_SECS);
        let public_url = lookup("PUBLIC_URL")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());
        if let Some(raw) = &public_url {
            url::Url::parse(raw).map_err(|_| ConfigError::Invalid {
                key: "PUBLIC_URL",
                value: raw.clone(),
            })?;
        }
        let reconcile_secs = match args.reconcile_interval_secs {
            Some(secs) => secs,
            None => env_u64("RECONCILE_INTERVAL_SECS", &lookup)?.unwrap_or(0),
        };
        let rate_limits = RateLimits {
            per_min: env_u64("RATE_LIMIT_PER_MIN", &lookup)?.unwrap_or(DEFAULT_RATE_LIMIT_PER_MIN),
            no_payment_per_min: env_u64("RATE_LIMIT_NO_PAYMENT_PER_MIN", &lookup)?
                .unwrap_or(DEFAULT_RATE_LIMIT_NO_PAYMENT_PER_MIN),
        };
        let telegram = match (lookup("TELEGRAM_BOT_TOKEN"), lookup("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig { bot_token, chat_id }),
            _ => None,
        };

        Ok(Self {
            bind: SocketAddr::new(host, port),
            evm: EvmConfig {
                rpc_url,
                private_key,
                chain_id,
                slot_machine,
                stable_token: usdc_address,
                vrf_coordinator,
                read_timeout: Duration::from_secs(rpc_timeout.max(1)),
                write_timeout: Duration::from_secs(tx_timeout.max(1)),
            },
            payment: PaymentConfig {
                pay_to,
                asset,
                network: format!("eip155:{chain_id}"),
                facilitator_url,
                facilitator_auth_token: lookup("FACILITATOR_AUTH_TOKEN"),
                facilitator_timeout: Duration::from_secs(facilitator_timeout.max(1)),
                public_url,
                spin_price: thresholds.spin_price_usd,
                claim_price: thresholds.claim_price_usd,
            },
            settings: Settings {
                thresholds,
                subscription_id,
                network: network_name(chain_id),
            },
            telegram,
            rate_limits,
            reconcile_interval: (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs)),
        })
    }
}

pub fn load_thresholds(path: &Path) -> Result<Thresholds, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ThresholdFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&raw)?)
}

pub fn network_name(chain_id: u64) -> String {
    match chain_id {
        8453 => "base".to_string(),
        84532 => "base-sepolia".to_string(),
        other => format!("eip155:{other}"),
    }
}

fn require_arg_or_env(
    value: Option<String>,
    env_key: &'static str,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    if let Some(value) = value {
        return Ok(value);
    }
    env(env_key).ok_or(ConfigError::Missing(env_key))
}

fn env_u64(key: &'static str, env: &impl Fn(&str) -> Option<String>) -> Result<Option<u64>, ConfigError> {
    env(key)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}

fn parse_or<T: FromStr>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn parse_address(key: &'static str, value: &str) -> Result<Address, ConfigError> {
    crate::chain::parse_address(value.trim()).ok_or_else(|| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
