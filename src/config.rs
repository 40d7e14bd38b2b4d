//! Feed configuration.
//!
//! Every section has a `Default`; [`FeedConfig::from_env`] overlays the `TB_*` environment
//! variables on top of those defaults.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::core::{BackoffPolicy, ReconnectPolicy, WebSocketBufferConfig};

pub const DEFAULT_WS_URL: &str = "ws://localhost:9944";
pub const DEFAULT_RPC_URL: &str = "http://localhost:8545";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Deployment the feed talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChainMode {
    #[default]
    Localnet,
    Testnet,
    Mainnet,
}

impl ChainMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "localnet" => Some(ChainMode::Localnet),
            "testnet" => Some(ChainMode::Testnet),
            "mainnet" => Some(ChainMode::Mainnet),
            _ => None,
        }
    }
}

/// Connection manager retry schedule.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    /// Consecutive failed attempts before the connection gives up and reports `Failed`.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.3,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: BackoffPolicy::new(self.base_delay, self.max_delay)
                .with_jitter_ratio(self.jitter_ratio),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub pong_timeout: Duration,
    pub max_missed: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(10),
            max_missed: 2,
        }
    }
}

/// Per-call defaults applied when a caller does not override them.
#[derive(Clone, Copy, Debug)]
pub struct RpcDefaults {
    pub retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RpcDefaults {
    fn default() -> Self {
        Self {
            retries: 2,
            timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RpcDefaults {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max)
    }
}

/// One call re-issued on every polling tick.
#[derive(Clone, Debug, PartialEq)]
pub struct PollCall {
    pub method: String,
    pub params: Value,
}

impl PollCall {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PollingConfig {
    pub interval: Duration,
    /// How long the socket must stay down before polling starts.
    pub grace: Duration,
    pub calls: Vec<PollCall>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            grace: Duration::from_secs(3),
            calls: vec![
                PollCall::new("consensus.block_height", Value::Object(Default::default())),
                PollCall::new("governor.status", Value::Object(Default::default())),
                PollCall::new("consensus.tps", Value::Object(Default::default())),
            ],
        }
    }
}

#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub ws_url: String,
    pub rpc_url: String,
    pub chain_mode: ChainMode,
    /// Offline feeds fail every call immediately and never open a transport.
    pub offline: bool,
    pub buffers: WebSocketBufferConfig,
    /// Socket calls buffered while the socket is reconnecting.
    pub outbound_capacity: usize,
    /// Subscribe/unsubscribe requests the node has not acknowledged within this window are
    /// forgotten.
    pub topic_ack_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub keepalive: KeepaliveConfig,
    pub rpc: RpcDefaults,
    pub polling: PollingConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            chain_mode: ChainMode::default(),
            offline: false,
            buffers: WebSocketBufferConfig::default(),
            outbound_capacity: 256,
            topic_ack_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            rpc: RpcDefaults::default(),
            polling: PollingConfig::default(),
        }
    }
}

/// `offline`/`none` or a url with port 0 marks a deliberately absent node.
pub fn is_offline_url(rpc_url: &str) -> bool {
    let trimmed = rpc_url.trim();
    if trimmed.eq_ignore_ascii_case("offline") || trimmed.eq_ignore_ascii_case("none") {
        return true;
    }
    Url::parse(trimmed)
        .ok()
        .and_then(|url| url.port())
        .is_some_and(|port| port == 0)
}

fn parse_var<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

impl FeedConfig {
    /// Defaults overlaid with `TB_WS_URL`, `TB_RPC_URL`, `TB_CHAIN_MODE`, `TB_RPC_TIMEOUT`
    /// (seconds), `TB_RPC_MAX_RETRIES` and `TB_RPC_OFFLINE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = FeedConfig::default();

        if let Some(url) = lookup("TB_WS_URL") {
            Url::parse(url.trim()).map_err(|err| ConfigError::Invalid {
                key: "TB_WS_URL",
                value: url.clone(),
                reason: err.to_string(),
            })?;
            config.ws_url = url.trim().to_string();
        }
        if let Some(url) = lookup("TB_RPC_URL") {
            config.rpc_url = url.trim().to_string();
        }
        if let Some(mode) = lookup("TB_CHAIN_MODE") {
            config.chain_mode = ChainMode::parse(&mode).ok_or_else(|| ConfigError::Invalid {
                key: "TB_CHAIN_MODE",
                value: mode.clone(),
                reason: "expected localnet, testnet or mainnet".to_string(),
            })?;
        }
        if let Some(timeout) = lookup("TB_RPC_TIMEOUT") {
            let secs: f64 = parse_var("TB_RPC_TIMEOUT", &timeout)?;
            config.rpc.timeout =
                Duration::try_from_secs_f64(secs).map_err(|err| ConfigError::Invalid {
                    key: "TB_RPC_TIMEOUT",
                    value: timeout.clone(),
                    reason: err.to_string(),
                })?;
        }
        if let Some(retries) = lookup("TB_RPC_MAX_RETRIES") {
            config.rpc.retries = parse_var("TB_RPC_MAX_RETRIES", &retries)?;
        }

        let offline_flag = lookup("TB_RPC_OFFLINE").is_some_and(|v| v.trim() == "1");
        config.offline = offline_flag || is_offline_url(&config.rpc_url);
        if config.offline {
            config.rpc.retries = 0;
        }

        Ok(config)
    }
}
