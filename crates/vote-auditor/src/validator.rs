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

//! Balance resolution and vote validation.
//!
//! A voter's balance at a height is taken from the first source that answers:
//!
//! 1. the account balance on the EVM side, through the chain RPC;
//! 2. the bank balance of the voter's native counterpart, through the ledger REST API.
//!
//! When neither answers the balance is treated as zero, which makes the dependent
//! validity false. Resolved balances are cached; the zero fallback never is.

use std::str::FromStr;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    amount::Amount,
    chain_data::ChainData,
    gateway::GatewayError,
    ledger::{voter_key, LedgerError, Validation, VoteLedger, VoteRecord},
    scanner::VoteCandidate,
};

/// What the translator said about a voter.
enum Link {
    Linked(String),
    Unlinked,
    Unreachable(GatewayError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Wallets whose period-end balance is resolved concurrently during finalization
    pub finalize_concurrency: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { finalize_concurrency: 8 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FinalizeSummary {
    pub wallets: usize,
    pub valid: usize,
    /// Wallets whose period-end balance could not be resolved
    pub failed_lookups: usize,
}

#[derive(Clone)]
pub struct BalanceValidator {
    data: ChainData,
    min_balance: Amount,
    concurrency: usize,
}

impl BalanceValidator {
    pub fn new(data: ChainData, min_balance: Amount) -> Self {
        Self { data, min_balance, concurrency: ValidationConfig::default().finalize_concurrency }
    }

    /// Number of wallets resolved concurrently during finalization.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn min_balance(&self) -> Amount {
        self.min_balance
    }

    /// Balance of `account` at `height`, or zero when every source failed.
    pub async fn resolve_balance(&self, account: Address, height: u64) -> Amount {
        self.try_resolve_balance(account, height).await.unwrap_or(Amount::ZERO)
    }

    /// Balance of `account` at `height`, or `None` when every source failed.
    pub async fn try_resolve_balance(&self, account: Address, height: u64) -> Option<Amount> {
        if let Some(amount) = self.data.cached_balance(account, height) {
            return Some(amount);
        }

        let account_err = match self.data.account_balance(account, height).await {
            Ok(amount) => {
                self.data.store_balance(account, height, amount);
                return Some(amount);
            }
            Err(err) => err,
        };
        tracing::debug!("Account balance of {account:#x} at {height} unavailable: {account_err}");

        let ledger_err = match self.data.native_address(account).await {
            Ok(native) => match self.data.ledger_balance(&native, height).await {
                Ok(amount) => {
                    self.data.store_balance(account, height, amount);
                    return Some(amount);
                }
                Err(err) => err.to_string(),
            },
            Err(err) => format!("no native counterpart: {err}"),
        };

        tracing::error!(
            "Every balance source failed for {account:#x} at block {height} \
             (account: {account_err}; ledger: {ledger_err}), treating as zero"
        );
        None
    }

    async fn link(&self, voter: Address) -> Link {
        match self.data.native_address(voter).await {
            Ok(native) => Link::Linked(native),
            Err(err) if err.is_not_found() => Link::Unlinked,
            Err(err) => Link::Unreachable(err),
        }
    }

    /// Balances at `block` and `block - 1` and the resulting point-in-time verdict.
    ///
    /// If the translator cannot be reached the vote cannot be checked yet, and the
    /// validation comes back with no balances and no verdict.
    pub async fn assess(&self, voter: Address, block: u64) -> Validation {
        let linked_address = match self.link(voter).await {
            Link::Linked(native) => Some(native),
            Link::Unlinked => None,
            Link::Unreachable(err) => {
                tracing::warn!(
                    "Cannot translate voter {voter:#x}, leaving vote unvalidated: {err}"
                );
                return Validation {
                    linked_address: None,
                    balance_at_vote: None,
                    balance_before_vote: None,
                    point_in_time_valid: None,
                };
            }
        };

        let (at, before) = tokio::join!(
            self.resolve_balance(voter, block),
            self.resolve_balance(voter, block.saturating_sub(1))
        );
        Validation {
            linked_address,
            balance_at_vote: Some(at),
            balance_before_vote: Some(before),
            point_in_time_valid: Some(at >= self.min_balance && before >= self.min_balance),
        }
    }

    /// Builds the vote record for a candidate. `final_valid` stays unset.
    pub async fn validate_vote(&self, candidate: &VoteCandidate) -> VoteRecord {
        let validation = self.assess(candidate.voter, candidate.block_number).await;
        VoteRecord {
            tx_hash: candidate.tx_hash,
            voter_address: voter_key(&candidate.voter),
            linked_address: validation.linked_address,
            block_number: candidate.block_number,
            timestamp: DateTime::<Utc>::from_timestamp(candidate.timestamp as i64, 0)
                .unwrap_or_default(),
            value: candidate.value,
            balance_at_vote: validation.balance_at_vote,
            balance_before_vote: validation.balance_before_vote,
            point_in_time_valid: validation.point_in_time_valid,
            final_valid: None,
            detection: candidate.signals.clone(),
        }
    }

    /// Validates and records a candidate unless its hash is already in the ledger.
    pub async fn ingest(
        &self,
        ledger: &VoteLedger,
        candidate: &VoteCandidate,
    ) -> Result<bool, LedgerError> {
        if ledger.contains(&candidate.tx_hash)? {
            tracing::debug!("Vote {:#x} already recorded, skipping", candidate.tx_hash);
            return Ok(false);
        }
        let record = self.validate_vote(candidate).await;
        tracing::info!(
            "Vote {:#x} by {} at block {}: valid={:?} [{}]",
            record.tx_hash,
            record.voter_address,
            record.block_number,
            record.point_in_time_valid,
            record.detection_method()
        );
        ledger.insert_vote(record)
    }

    /// Retries validation of votes recorded while the translator was unreachable.
    /// Returns how many votes were resolved.
    pub async fn revalidate_pending(&self, ledger: &VoteLedger) -> Result<usize, LedgerError> {
        let pending = ledger.pending_votes()?;
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!("Revalidating {} pending votes", pending.len());
        let mut resolved = 0;
        for vote in pending {
            let Ok(voter) = Address::from_str(&vote.voter_address) else {
                tracing::warn!(
                    "Skipping vote {:#x} with malformed voter {}",
                    vote.tx_hash,
                    vote.voter_address
                );
                continue;
            };
            let validation = self.assess(voter, vote.block_number).await;
            if validation.point_in_time_valid.is_none() {
                continue;
            }
            if ledger.update_validation(&vote.tx_hash, validation)? {
                resolved += 1;
            }
        }
        tracing::info!("Revalidated {resolved} pending votes");
        Ok(resolved)
    }

    /// Resolves every unfinalized wallet's balance at `end_height` and sets final validity.
    ///
    /// A wallet whose balance cannot be resolved is finalized as invalid with a zero balance.
    pub async fn finalize_wallets(
        &self,
        ledger: &VoteLedger,
        end_height: u64,
    ) -> Result<FinalizeSummary, LedgerError> {
        let attached = ledger.repair_membership()?;
        if attached > 0 {
            tracing::warn!("Attached {attached} votes to their wallets before finalization");
        }
        let addresses = ledger.unfinalized_wallets()?;
        tracing::info!("Finalizing {} wallets at block {end_height}", addresses.len());

        let lookups: Vec<(String, Option<Amount>)> = stream::iter(addresses)
            .map(|address| async move {
                let balance = match Address::from_str(&address) {
                    Ok(account) => self.try_resolve_balance(account, end_height).await,
                    Err(err) => {
                        tracing::warn!("Wallet {address} is not an EVM address: {err}");
                        None
                    }
                };
                (address, balance)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = FinalizeSummary::default();
        for (address, balance) in lookups {
            if !ledger.finalize_wallet(&address, end_height, balance, self.min_balance)? {
                continue;
            }
            summary.wallets += 1;
            match balance {
                Some(amount) if amount >= self.min_balance => summary.valid += 1,
                Some(_) => {}
                None => summary.failed_lookups += 1,
            }
        }
        tracing::info!(
            "Finalized {} wallets: {} valid, {} failed lookups",
            summary.wallets,
            summary.valid,
            summary.failed_lookups
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc};

    use alloy::primitives::U256;

    use super::*;
    use crate::{
        cache::{CacheKind, CacheSet, EvictionPolicy},
        scanner::DetectionSignal,
        test_utils::{address, mock_gateway, tx_hash, MockChain, MockLedger, MockTranslator},
    };

    struct Fixture {
        chain: Arc<MockChain>,
        ledger_api: Arc<MockLedger>,
        translator: Arc<MockTranslator>,
        validator: BalanceValidator,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MockChain::with_blocks(2_000, 1_700_000_000, 1));
        let ledger_api = Arc::new(MockLedger::default());
        let translator = Arc::new(MockTranslator::default());
        let gateway = mock_gateway(chain.clone(), ledger_api.clone(), translator.clone());
        let data = ChainData::new(Arc::new(gateway), Arc::new(CacheSet::default()));
        let validator = BalanceValidator::new(data, Amount::from_whole(100));
        Fixture { chain, ledger_api, translator, validator }
    }

    fn candidate(voter: Address, block: u64) -> VoteCandidate {
        VoteCandidate {
            tx_hash: tx_hash(block),
            voter,
            block_number: block,
            timestamp: 1_700_000_000 + block,
            value: U256::from(50),
            signals: BTreeSet::from([DetectionSignal::ValueTransfer]),
        }
    }

    #[tokio::test]
    async fn falls_back_to_ledger_through_translation() {
        let f = fixture();
        let voter = address(1);
        f.translator.link(voter, "sei1voter");
        f.ledger_api.set_balance("sei1voter", 0, Amount::from_whole(42));
        f.chain.fail_balances_for(voter);

        assert_eq!(f.validator.resolve_balance(voter, 10).await, Amount::from_whole(42));
    }

    #[tokio::test]
    async fn unresolvable_balance_is_zero_and_not_cached() {
        let f = fixture();
        let voter = address(1);
        f.chain.fail_balances_for(voter);

        assert_eq!(f.validator.try_resolve_balance(voter, 10).await, None);
        assert_eq!(f.validator.resolve_balance(voter, 10).await, Amount::ZERO);
        assert!(f.validator.data.cached_balance(voter, 10).is_none());
    }

    #[tokio::test]
    async fn point_in_time_validity_needs_both_balances() {
        let f = fixture();
        let voter = address(1);
        f.chain.set_balance(voter, 0, Amount::from_whole(150));
        f.chain.set_balance(voter, 1_000, Amount::from_whole(150));
        let record = f.validator.validate_vote(&candidate(voter, 1_000)).await;
        assert_eq!(record.point_in_time_valid, Some(true));
        assert_eq!(record.final_valid, None);

        let late = address(2);
        f.chain.set_balance(late, 1_000, Amount::from_whole(150));
        let record = f.validator.validate_vote(&candidate(late, 1_000)).await;
        assert_eq!(record.balance_before_vote, Some(Amount::ZERO));
        assert_eq!(record.point_in_time_valid, Some(false));
    }

    #[tokio::test]
    async fn failed_resolution_fails_closed() {
        let f = fixture();
        let voter = address(1);
        f.chain.set_balance(voter, 0, Amount::from_whole(1_000));
        f.chain.fail_balances_for(voter);
        let record = f.validator.validate_vote(&candidate(voter, 500)).await;
        assert_eq!(record.point_in_time_valid, Some(false));
        assert_eq!(record.balance_at_vote, Some(Amount::ZERO));
    }

    #[tokio::test]
    async fn unreachable_translator_leaves_vote_pending() {
        let f = fixture();
        let voter = address(1);
        f.chain.set_balance(voter, 0, Amount::from_whole(150));
        f.translator.fail_always(true);

        let ledger = VoteLedger::new();
        f.validator.ingest(&ledger, &candidate(voter, 100)).await.unwrap();
        let record = ledger.vote(&tx_hash(100)).unwrap().unwrap();
        assert!(record.is_pending());
        assert_eq!(record.balance_at_vote, None);

        f.translator.fail_always(false);
        assert_eq!(f.validator.revalidate_pending(&ledger).await.unwrap(), 1);
        let record = ledger.vote(&tx_hash(100)).unwrap().unwrap();
        assert_eq!(record.point_in_time_valid, Some(true));
        assert_eq!(record.linked_address, None);
    }

    #[tokio::test]
    async fn validation_ignores_cache_state() {
        let f = fixture();
        let voter = address(1);
        f.chain.set_balance(voter, 0, Amount::from_whole(90));
        f.chain.set_balance(voter, 700, Amount::from_whole(150));

        let cold = f.validator.validate_vote(&candidate(voter, 700)).await;
        let calls_cold = f.chain.balance_calls();
        let warm = f.validator.validate_vote(&candidate(voter, 700)).await;
        assert_eq!(f.chain.balance_calls(), calls_cold);
        f.validator.data.caches().evict(&EvictionPolicy::Kinds(vec![CacheKind::Balance]));
        let cleared = f.validator.validate_vote(&candidate(voter, 700)).await;

        assert_eq!(cold, warm);
        assert_eq!(cold, cleared);
        assert_eq!(f.chain.balance_calls(), calls_cold * 2);
    }

    #[tokio::test]
    async fn finalization_invalidates_failed_lookups() {
        let f = fixture();
        let rich = address(1);
        let broke = address(2);
        let flaky = address(3);
        for voter in [rich, broke, flaky] {
            f.chain.set_balance(voter, 0, Amount::from_whole(150));
        }
        f.chain.set_balance(broke, 1_500, Amount::from_whole(80));

        let ledger = VoteLedger::new();
        for (i, voter) in [rich, broke, flaky].into_iter().enumerate() {
            f.validator.ingest(&ledger, &candidate(voter, 1_000 + i as u64)).await.unwrap();
        }
        f.chain.fail_balances_for(flaky);

        let summary = f.validator.finalize_wallets(&ledger, 1_999).await.unwrap();
        assert_eq!(summary, FinalizeSummary { wallets: 3, valid: 1, failed_lookups: 1 });

        assert_eq!(ledger.vote(&tx_hash(1_000)).unwrap().unwrap().final_valid, Some(true));
        assert_eq!(ledger.vote(&tx_hash(1_001)).unwrap().unwrap().final_valid, Some(false));
        assert_eq!(ledger.vote(&tx_hash(1_001)).unwrap().unwrap().point_in_time_valid, Some(true));
        assert_eq!(ledger.vote(&tx_hash(1_002)).unwrap().unwrap().final_valid, Some(false));
        let flaky_wallet = ledger.wallet(&voter_key(&flaky)).unwrap().unwrap();
        assert_eq!(flaky_wallet.final_balance, Some(Amount::ZERO));
        assert_eq!(flaky_wallet.final_balance_valid, Some(false));
    }
}
