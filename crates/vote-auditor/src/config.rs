// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    amount::Amount,
    cache::CacheConfig,
    errors::{impl_coded_debug, CodedError},
    gateway::{GatewayTimeouts, RetryPolicy},
    locator::LocatorConfig,
    monitor::MonitorConfig,
    scanner::{ScanConfig, VoteContracts},
    validator::ValidationConfig,
};

#[derive(Error)]
pub enum ConfigErr {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl_coded_debug!(ConfigErr);

impl CodedError for ConfigErr {
    fn code(&self) -> &str {
        match self {
            ConfigErr::Read { .. } => "[VA-CON-001]",
            ConfigErr::Parse(_) => "[VA-CON-002]",
            ConfigErr::Invalid(_) => "[VA-CON-003]",
        }
    }
}

/// Voting period and the balance every voter must hold throughout it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub min_balance: Amount,
}

fn default_denom() -> String {
    "usei".to_string()
}

fn default_ledger_decimals() -> u8 {
    6
}

fn default_evm_decimals() -> u8 {
    crate::gateway::EVM_BALANCE_DECIMALS
}

fn default_forward_method() -> String {
    crate::gateway::DEFAULT_FORWARD_METHOD.to_string()
}

fn default_reverse_method() -> String {
    crate::gateway::DEFAULT_REVERSE_METHOD.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// EVM JSON-RPC
    pub rpc_url: Url,
    pub rpc_fallback_url: Option<Url>,
    /// Websocket endpoint for new-head subscriptions
    pub ws_url: Option<Url>,
    /// Bank module REST API
    pub ledger_url: Url,
    pub ledger_fallback_url: Option<Url>,
    /// JSON-RPC endpoint serving address translation
    pub translator_url: Url,
    pub translator_fallback_url: Option<Url>,
    #[serde(default = "default_denom")]
    pub denom: String,
    #[serde(default = "default_ledger_decimals")]
    pub ledger_decimals: u8,
    #[serde(default = "default_evm_decimals")]
    pub evm_decimals: u8,
    #[serde(default = "default_forward_method")]
    pub forward_method: String,
    #[serde(default = "default_reverse_method")]
    pub reverse_method: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            attempts: config.attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub head_secs: u64,
    pub block_secs: u64,
    pub transaction_secs: u64,
    pub receipt_secs: u64,
    pub balance_secs: u64,
    pub translate_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            head_secs: 5,
            block_secs: 15,
            transaction_secs: 10,
            receipt_secs: 10,
            balance_secs: 10,
            translate_secs: 5,
        }
    }
}

impl From<&TimeoutConfig> for GatewayTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        GatewayTimeouts {
            head: Duration::from_secs(config.head_secs),
            block: Duration::from_secs(config.block_secs),
            transaction: Duration::from_secs(config.transaction_secs),
            receipt: Duration::from_secs(config.receipt_secs),
            balance: Duration::from_secs(config.balance_secs),
            translate: Duration::from_secs(config.translate_secs),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Ledger flush interval
    pub flush_interval_secs: u64,
    /// Minimum time between checkpoint writes
    pub checkpoint_interval_secs: u64,
    /// Progress log interval
    pub progress_interval_secs: u64,
    /// Wallets listed in the summary's top-N table
    pub report_top_n: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            flush_interval_secs: 10,
            checkpoint_interval_secs: 30,
            progress_interval_secs: 60,
            report_top_n: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub period: PeriodConfig,
    pub contracts: VoteContracts,
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub locator: LocatorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Config {
    /// Reads and validates a TOML config file.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigErr> {
        let path = path.into();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigErr::Read { path: path.clone(), source })?;
        let config = Self::parse(&contents)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigErr> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigErr> {
        let invalid = |msg: &str| Err(ConfigErr::Invalid(msg.to_string()));

        if self.period.end <= self.period.start {
            return invalid("period.end must be after period.start");
        }
        if self.contracts.proxy.is_zero() {
            return invalid("contracts.proxy must be set");
        }
        if self.scan.backfill_chunk_size == 0 || self.scan.live_chunk_size == 0 {
            return invalid("scan chunk sizes must be non-zero");
        }
        if self.scan.max_concurrent_chunks == 0 || self.scan.group_size == 0 {
            return invalid("scan concurrency must be non-zero");
        }
        if self.validation.finalize_concurrency == 0 {
            return invalid("validation.finalize_concurrency must be non-zero");
        }
        if self.scan.channel_capacity == 0 {
            return invalid("scan.channel_capacity must be non-zero");
        }
        if self.retry.attempts == 0 {
            return invalid("retry.attempts must be at least 1");
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be in [0, 1)");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be at least 1");
        }
        if self.locator.block_time_ms == 0 || self.locator.max_iterations == 0 {
            return invalid("locator.block_time_ms and locator.max_iterations must be non-zero");
        }
        if self.locator.min_window_blocks > self.locator.max_window_blocks {
            return invalid("locator.min_window_blocks exceeds locator.max_window_blocks");
        }
        let memory = &self.cache.memory;
        if !(memory.warn_mb <= memory.high_mb && memory.high_mb <= memory.critical_mb) {
            return invalid("cache.memory thresholds must satisfy warn <= high <= critical");
        }
        if self.store.flush_interval_secs == 0 {
            return invalid("store.flush_interval_secs must be non-zero");
        }
        if self.monitor.poll_interval_ms == 0 {
            return invalid("monitor.poll_interval_ms must be non-zero");
        }
        if self.monitor.restart_delay_ms > self.monitor.max_restart_delay_ms {
            return invalid("monitor.restart_delay_ms exceeds monitor.max_restart_delay_ms");
        }
        Ok(())
    }
}
