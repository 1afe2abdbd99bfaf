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

//! Multi-source access to the chain, the bank ledger and the address translation service.
//!
//! Every call goes to the primary endpoint first, retried with exponential backoff and
//! jitter, and falls over to the secondary endpoint exactly once when the primary is
//! exhausted. Only exhaustion surfaces to callers.

mod ledger;
mod retry;
mod rpc;
mod translator;

pub use ledger::{HttpLedgerClient, BLOCK_HEIGHT_HEADER};
pub use retry::RetryPolicy;
pub use rpc::{RpcChainClient, EVM_BALANCE_DECIMALS};
pub use translator::{JsonRpcTranslator, DEFAULT_FORWARD_METHOD, DEFAULT_REVERSE_METHOD};

use std::{future::Future, sync::Arc, time::Duration};

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    amount::Amount,
    errors::{impl_coded_debug, CodedError},
};

/// Block height and timestamp, enough for time based searches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    /// Unix seconds
    pub timestamp: u64,
}

/// A block with its full transaction bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub number: u64,
    pub timestamp: u64,
    pub transactions: Vec<ChainTransaction>,
}

impl ChainBlock {
    pub fn header(&self) -> BlockHeader {
        BlockHeader { number: self.number, timestamp: self.timestamp }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: B256,
    pub block_number: Option<u64>,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    pub success: bool,
    /// Emitting address of every log in the receipt, in log order.
    pub log_addresses: Vec<Address>,
}

/// Why a single attempt against a single endpoint failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("no response: {0}")]
    NoResponse(String),

    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl SourceError {
    /// Short classification used in logs.
    pub fn reason(&self) -> &'static str {
        match self {
            SourceError::Timeout(_) => "timeout",
            SourceError::HttpStatus(_) => "http-status",
            SourceError::NoResponse(_) => "no-response",
            SourceError::Decode(_) => "decode-error",
            SourceError::Rpc { .. } => "rpc-error",
            SourceError::NotFound(_) => "not-found",
        }
    }

    /// A missing entity is a terminal answer; everything else may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::NotFound(_))
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            SourceError::Timeout(timeout)
        } else if let Some(status) = err.status() {
            SourceError::HttpStatus(status.as_u16())
        } else if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else {
            SourceError::NoResponse(err.to_string())
        }
    }
}

/// A lookup that failed after every configured endpoint was tried.
#[derive(Error)]
pub enum GatewayError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error(
        "{what} failed on every endpoint (primary: {primary}; secondary: {})",
        describe(.secondary)
    )]
    Exhausted { what: String, primary: SourceError, secondary: Option<SourceError> },
}

fn describe(secondary: &Option<SourceError>) -> String {
    match secondary {
        Some(err) => err.to_string(),
        None => "not configured".to_string(),
    }
}

impl CodedError for GatewayError {
    fn code(&self) -> &str {
        match self {
            GatewayError::NotFound { .. } => "[VA-GW-404]",
            GatewayError::Exhausted { .. } => "[VA-GW-500]",
        }
    }
}

impl_coded_debug!(GatewayError);

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }
}

/// Common identity of every upstream source.
pub trait Source: Send + Sync {
    /// Human readable name used in logs, usually the endpoint URL.
    fn name(&self) -> String;
}

/// Read-only access to the EVM side of the chain.
#[async_trait]
pub trait ChainClient: Source {
    async fn head(&self) -> Result<u64, SourceError>;

    async fn header(&self, number: u64) -> Result<Option<BlockHeader>, SourceError>;

    async fn block(&self, number: u64) -> Result<Option<ChainBlock>, SourceError>;

    async fn transaction(&self, hash: B256) -> Result<Option<ChainTransaction>, SourceError>;

    async fn receipt(&self, hash: B256) -> Result<Option<ChainReceipt>, SourceError>;

    /// Account balance as of `height`, canonicalized.
    async fn balance(&self, account: Address, height: u64) -> Result<Amount, SourceError>;
}

/// Bank ledger balances of native accounts at historical heights.
#[async_trait]
pub trait LedgerClient: Source {
    async fn balance(&self, account: &str, height: u64) -> Result<Amount, SourceError>;
}

/// EVM to native address mapping.
#[async_trait]
pub trait AddressTranslator: Source {
    /// Returns [SourceError::NotFound] when the address has no native counterpart.
    async fn to_native(&self, address: Address) -> Result<String, SourceError>;

    /// Returns [SourceError::NotFound] when the native account has no EVM counterpart.
    async fn to_evm(&self, account: &str) -> Result<Address, SourceError>;
}

/// A primary endpoint and an optional fallback.
pub struct Endpoints<T: ?Sized> {
    primary: Arc<T>,
    secondary: Option<Arc<T>>,
}

impl<T: ?Sized> Clone for Endpoints<T> {
    fn clone(&self) -> Self {
        Self { primary: self.primary.clone(), secondary: self.secondary.clone() }
    }
}

impl<T: ?Sized> Endpoints<T> {
    pub fn new(primary: Arc<T>) -> Self {
        Self { primary, secondary: None }
    }

    pub fn with_secondary(mut self, secondary: Arc<T>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_optional_secondary(mut self, secondary: Option<Arc<T>>) -> Self {
        self.secondary = secondary;
        self
    }
}

/// Per call-type timeouts raced against every attempt.
#[derive(Clone, Debug)]
pub struct GatewayTimeouts {
    pub head: Duration,
    pub block: Duration,
    pub transaction: Duration,
    pub receipt: Duration,
    pub balance: Duration,
    pub translate: Duration,
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            head: Duration::from_secs(5),
            block: Duration::from_secs(15),
            transaction: Duration::from_secs(10),
            receipt: Duration::from_secs(10),
            balance: Duration::from_secs(10),
            translate: Duration::from_secs(5),
        }
    }
}

pub struct Gateway {
    chain: Endpoints<dyn ChainClient>,
    ledger: Endpoints<dyn LedgerClient>,
    translator: Endpoints<dyn AddressTranslator>,
    retry: RetryPolicy,
    timeouts: GatewayTimeouts,
}

impl Gateway {
    pub fn new(
        chain: Endpoints<dyn ChainClient>,
        ledger: Endpoints<dyn LedgerClient>,
        translator: Endpoints<dyn AddressTranslator>,
    ) -> Self {
        Self {
            chain,
            ledger,
            translator,
            retry: RetryPolicy::default(),
            timeouts: GatewayTimeouts::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: GatewayTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub async fn head(&self) -> Result<u64, GatewayError> {
        self.call("head block number", &self.chain, self.timeouts.head, |c| async move {
            c.head().await
        })
        .await
    }

    pub async fn fetch_header(&self, number: u64) -> Result<BlockHeader, GatewayError> {
        let what = format!("header {number}");
        self.call(&what, &self.chain, self.timeouts.block, |c| async move {
            c.header(number).await?.ok_or_else(|| SourceError::NotFound(format!("block {number}")))
        })
        .await
    }

    pub async fn fetch_block(&self, number: u64) -> Result<ChainBlock, GatewayError> {
        let what = format!("block {number}");
        self.call(&what, &self.chain, self.timeouts.block, |c| async move {
            c.block(number).await?.ok_or_else(|| SourceError::NotFound(format!("block {number}")))
        })
        .await
    }

    pub async fn fetch_transaction(&self, hash: B256) -> Result<ChainTransaction, GatewayError> {
        let what = format!("transaction {hash}");
        self.call(&what, &self.chain, self.timeouts.transaction, |c| async move {
            c.transaction(hash).await?.ok_or_else(|| SourceError::NotFound(format!("tx {hash}")))
        })
        .await
    }

    pub async fn fetch_receipt(&self, hash: B256) -> Result<ChainReceipt, GatewayError> {
        let what = format!("receipt {hash}");
        self.call(&what, &self.chain, self.timeouts.receipt, |c| async move {
            c.receipt(hash).await?.ok_or_else(|| SourceError::NotFound(format!("receipt {hash}")))
        })
        .await
    }

    /// Balance of an EVM account at `height` from the chain RPC.
    pub async fn fetch_balance(
        &self,
        account: Address,
        height: u64,
    ) -> Result<Amount, GatewayError> {
        let what = format!("balance of {account} at {height}");
        self.call(&what, &self.chain, self.timeouts.balance, |c| async move {
            c.balance(account, height).await
        })
        .await
    }

    /// Balance of a native account at `height` from the bank ledger API.
    pub async fn fetch_ledger_balance(
        &self,
        account: &str,
        height: u64,
    ) -> Result<Amount, GatewayError> {
        let what = format!("ledger balance of {account} at {height}");
        self.call(&what, &self.ledger, self.timeouts.balance, |c| {
            let account = account.to_string();
            async move { c.balance(&account, height).await }
        })
        .await
    }

    pub async fn translate_address(&self, address: Address) -> Result<String, GatewayError> {
        let what = format!("native address of {address}");
        self.call(&what, &self.translator, self.timeouts.translate, |c| async move {
            c.to_native(address).await
        })
        .await
    }

    pub async fn reverse_translate(&self, account: &str) -> Result<Address, GatewayError> {
        let what = format!("evm address of {account}");
        self.call(&what, &self.translator, self.timeouts.translate, |c| {
            let account = account.to_string();
            async move { c.to_evm(&account).await }
        })
        .await
    }

    async fn call<C, T, F, Fut>(
        &self,
        what: &str,
        endpoints: &Endpoints<C>,
        timeout: Duration,
        op: F,
    ) -> Result<T, GatewayError>
    where
        C: Source + ?Sized,
        F: Fn(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let primary_err =
            match self.attempt_with_retries(what, &endpoints.primary, timeout, &op).await {
                Ok(val) => return Ok(val),
                Err(SourceError::NotFound(_)) => {
                    return Err(GatewayError::NotFound { what: what.to_string() })
                }
                Err(err) => err,
            };

        let Some(secondary) = &endpoints.secondary else {
            tracing::error!(
                "{what}: primary {} exhausted: {primary_err}",
                endpoints.primary.name()
            );
            return Err(GatewayError::Exhausted {
                what: what.to_string(),
                primary: primary_err,
                secondary: None,
            });
        };

        tracing::warn!(
            reason = primary_err.reason(),
            "{what}: primary {} exhausted, failing over to {}",
            endpoints.primary.name(),
            secondary.name()
        );

        match attempt(secondary, timeout, &op).await {
            Ok(val) => Ok(val),
            Err(SourceError::NotFound(_)) => Err(GatewayError::NotFound { what: what.to_string() }),
            Err(err) => {
                tracing::error!(
                    reason = err.reason(),
                    "{what}: secondary {} failed: {err}",
                    secondary.name()
                );
                Err(GatewayError::Exhausted {
                    what: what.to_string(),
                    primary: primary_err,
                    secondary: Some(err),
                })
            }
        }
    }

    async fn attempt_with_retries<C, T, F, Fut>(
        &self,
        what: &str,
        client: &Arc<C>,
        timeout: Duration,
        op: &F,
    ) -> Result<T, SourceError>
    where
        C: Source + ?Sized,
        F: Fn(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut retry = 0;
        loop {
            match attempt(client, timeout, op).await {
                Ok(val) => return Ok(val),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    if retry + 1 >= attempts {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(retry);
                    tracing::warn!(
                        reason = err.reason(),
                        "{what}: attempt {}/{attempts} on {} failed: {err}; retrying in {delay:?}",
                        retry + 1,
                        client.name()
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

async fn attempt<C, T, F, Fut>(client: &Arc<C>, timeout: Duration, op: &F) -> Result<T, SourceError>
where
    C: ?Sized,
    F: Fn(Arc<C>) -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(timeout, op(client.clone())).await {
        Ok(res) => res,
        Err(_) => Err(SourceError::Timeout(timeout)),
    }
}
