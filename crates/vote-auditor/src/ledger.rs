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

//! In-memory vote and wallet tables with idempotent ingestion and dirty tracking.
//!
//! Each table sits behind its own mutex. Operations touching both always lock votes first,
//! then wallets. A flush writes both tables as one snapshot, so a crash can never leave a
//! vote on disk without its wallet.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    amount::Amount,
    errors::{impl_coded_debug, CodedError},
    scanner::DetectionSignal,
    store::{SnapshotStore, StoreError, LEDGER_TABLE},
};

#[derive(Error)]
pub enum LedgerError {
    #[error("{0} table lock poisoned")]
    Poisoned(&'static str),

    #[error("snapshot store error: {0}")]
    Store(#[from] StoreError),
}

impl_coded_debug!(LedgerError);

impl CodedError for LedgerError {
    fn code(&self) -> &str {
        match self {
            LedgerError::Poisoned(_) => "[VA-LEDGER-001]",
            LedgerError::Store(_) => "[VA-LEDGER-002]",
        }
    }
}

/// Canonical voter identity: lowercase 0x-prefixed hex.
pub fn voter_key(address: &Address) -> String {
    format!("{address:#x}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub tx_hash: B256,
    pub voter_address: String,
    /// Native counterpart of the voter, when the translator knows one.
    pub linked_address: Option<String>,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub value: U256,
    pub balance_at_vote: Option<Amount>,
    pub balance_before_vote: Option<Amount>,
    pub point_in_time_valid: Option<bool>,
    pub final_valid: Option<bool>,
    pub detection: BTreeSet<DetectionSignal>,
}

impl VoteRecord {
    pub fn detection_method(&self) -> String {
        self.detection.iter().map(DetectionSignal::as_str).collect::<Vec<_>>().join(",")
    }

    /// Validity could not be determined when the vote was recorded.
    pub fn is_pending(&self) -> bool {
        self.point_in_time_valid.is_none() && self.final_valid.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub address: String,
    pub linked_address: Option<String>,
    /// Sparse height to balance map, last write wins.
    pub balances: BTreeMap<u64, Amount>,
    pub vote_tx_hashes: Vec<B256>,
    pub final_balance: Option<Amount>,
    pub final_balance_valid: Option<bool>,
}

impl WalletRecord {
    fn new(address: String) -> Self {
        Self {
            address,
            linked_address: None,
            balances: BTreeMap::new(),
            vote_tx_hashes: Vec::new(),
            final_balance: None,
            final_balance_valid: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.final_balance_valid.is_some()
    }

    fn observe(&mut self, linked: &Option<String>, balances: &[(u64, Option<Amount>)]) {
        if self.linked_address.is_none() {
            self.linked_address.clone_from(linked);
        }
        for (height, amount) in balances {
            if let Some(amount) = amount {
                self.balances.insert(*height, *amount);
            }
        }
    }
}

/// Balances observed for a vote at its block and the block before.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validation {
    pub linked_address: Option<String>,
    pub balance_at_vote: Option<Amount>,
    pub balance_before_vote: Option<Amount>,
    pub point_in_time_valid: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub votes: usize,
    pub wallets: usize,
    pub pending_votes: usize,
    pub finalized_wallets: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub votes_written: Option<usize>,
    pub wallets_written: Option<usize>,
}

/// On-disk form of the ledger: both tables as ordered key/value pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub votes: Vec<(B256, VoteRecord)>,
    pub wallets: Vec<(String, WalletRecord)>,
}

#[derive(Default)]
pub struct VoteLedger {
    votes: Mutex<BTreeMap<B256, VoteRecord>>,
    wallets: Mutex<BTreeMap<String, WalletRecord>>,
    votes_dirty: AtomicBool,
    wallets_dirty: AtomicBool,
}

impl VoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores the ledger from its last snapshot. A missing snapshot starts empty.
    ///
    /// Votes whose wallet does not list them are attached on load, so every stored vote is
    /// reachable from the wallet that finalization walks.
    pub async fn load(store: &SnapshotStore) -> Result<Self, LedgerError> {
        let snapshot: LedgerSnapshot = store.read_table(LEDGER_TABLE).await?.unwrap_or_default();
        tracing::info!(
            "Loaded {} votes and {} wallets from {}",
            snapshot.votes.len(),
            snapshot.wallets.len(),
            store.base_path().display()
        );
        let ledger = Self {
            votes: Mutex::new(snapshot.votes.into_iter().collect()),
            wallets: Mutex::new(snapshot.wallets.into_iter().collect()),
            ..Default::default()
        };
        let repaired = ledger.repair_membership()?;
        if repaired > 0 {
            tracing::warn!("Attached {repaired} stored votes missing from their wallets");
        }
        Ok(ledger)
    }

    fn votes(&self) -> Result<MutexGuard<'_, BTreeMap<B256, VoteRecord>>, LedgerError> {
        self.votes.lock().map_err(|_| LedgerError::Poisoned("votes"))
    }

    fn wallets(&self) -> Result<MutexGuard<'_, BTreeMap<String, WalletRecord>>, LedgerError> {
        self.wallets.lock().map_err(|_| LedgerError::Poisoned("wallets"))
    }

    /// Makes every vote a member of its voter's wallet, creating missing wallets. A vote
    /// joining a finalized wallet takes its verdict. Returns the number of votes attached.
    pub fn repair_membership(&self) -> Result<usize, LedgerError> {
        let mut votes = self.votes()?;
        let mut wallets = self.wallets()?;
        let mut repaired = 0;
        for vote in votes.values_mut() {
            let wallet = wallets
                .entry(vote.voter_address.clone())
                .or_insert_with(|| WalletRecord::new(vote.voter_address.clone()));
            if wallet.vote_tx_hashes.contains(&vote.tx_hash) {
                continue;
            }
            wallet.observe(
                &vote.linked_address,
                &[
                    (vote.block_number.saturating_sub(1), vote.balance_before_vote),
                    (vote.block_number, vote.balance_at_vote),
                ],
            );
            wallet.vote_tx_hashes.push(vote.tx_hash);
            if let (None, Some(final_balance_valid)) =
                (vote.final_valid, wallet.final_balance_valid)
            {
                vote.final_valid =
                    Some(vote.point_in_time_valid == Some(true) && final_balance_valid);
            }
            repaired += 1;
        }
        if repaired > 0 {
            self.votes_dirty.store(true, Ordering::Release);
            self.wallets_dirty.store(true, Ordering::Release);
        }
        Ok(repaired)
    }

    pub fn contains(&self, tx_hash: &B256) -> Result<bool, LedgerError> {
        Ok(self.votes()?.contains_key(tx_hash))
    }

    /// Records a vote and attaches it to its wallet, creating the wallet on first vote.
    ///
    /// Returns `false` without touching anything when the hash is already recorded. A vote
    /// joining an already finalized wallet takes its final validity from that wallet.
    pub fn insert_vote(&self, mut record: VoteRecord) -> Result<bool, LedgerError> {
        let mut votes = self.votes()?;
        if votes.contains_key(&record.tx_hash) {
            tracing::debug!("Vote {:#x} already recorded", record.tx_hash);
            return Ok(false);
        }
        let mut wallets = self.wallets()?;
        let wallet = wallets
            .entry(record.voter_address.clone())
            .or_insert_with(|| WalletRecord::new(record.voter_address.clone()));

        wallet.observe(
            &record.linked_address,
            &[
                (record.block_number.saturating_sub(1), record.balance_before_vote),
                (record.block_number, record.balance_at_vote),
            ],
        );
        if !wallet.vote_tx_hashes.contains(&record.tx_hash) {
            wallet.vote_tx_hashes.push(record.tx_hash);
        }
        if let Some(final_balance_valid) = wallet.final_balance_valid {
            record.final_valid =
                Some(record.point_in_time_valid == Some(true) && final_balance_valid);
        }

        votes.insert(record.tx_hash, record);
        self.votes_dirty.store(true, Ordering::Release);
        self.wallets_dirty.store(true, Ordering::Release);
        Ok(true)
    }

    /// Fills in a pending vote's balances. Votes that already carry a verdict are left alone.
    pub fn update_validation(
        &self,
        tx_hash: &B256,
        validation: Validation,
    ) -> Result<bool, LedgerError> {
        let mut votes = self.votes()?;
        let Some(vote) = votes.get_mut(tx_hash) else {
            return Ok(false);
        };
        if !vote.is_pending() {
            return Ok(false);
        }
        let mut wallets = self.wallets()?;
        if let Some(wallet) = wallets.get_mut(&vote.voter_address) {
            wallet.observe(
                &validation.linked_address,
                &[
                    (vote.block_number.saturating_sub(1), validation.balance_before_vote),
                    (vote.block_number, validation.balance_at_vote),
                ],
            );
            if let Some(final_balance_valid) = wallet.final_balance_valid {
                vote.final_valid =
                    Some(validation.point_in_time_valid == Some(true) && final_balance_valid);
            }
        }
        if vote.linked_address.is_none() {
            vote.linked_address = validation.linked_address;
        }
        vote.balance_at_vote = validation.balance_at_vote;
        vote.balance_before_vote = validation.balance_before_vote;
        vote.point_in_time_valid = validation.point_in_time_valid;

        self.votes_dirty.store(true, Ordering::Release);
        self.wallets_dirty.store(true, Ordering::Release);
        Ok(true)
    }

    /// Sets a wallet's period-end verdict and the final validity of each of its votes.
    ///
    /// `balance` is `None` when every balance source failed; the wallet is then recorded with
    /// a zero balance and marked invalid. Finalized wallets are never changed again.
    pub fn finalize_wallet(
        &self,
        address: &str,
        end_height: u64,
        balance: Option<Amount>,
        min_balance: Amount,
    ) -> Result<bool, LedgerError> {
        let mut votes = self.votes()?;
        let mut wallets = self.wallets()?;
        let Some(wallet) = wallets.get_mut(address) else {
            return Ok(false);
        };
        if wallet.is_finalized() {
            return Ok(false);
        }

        let valid = balance.is_some_and(|amount| amount >= min_balance);
        if let Some(amount) = balance {
            wallet.balances.insert(end_height, amount);
        }
        wallet.final_balance = Some(balance.unwrap_or(Amount::ZERO));
        wallet.final_balance_valid = Some(valid);

        for hash in &wallet.vote_tx_hashes {
            if let Some(vote) = votes.get_mut(hash) {
                vote.final_valid = Some(vote.point_in_time_valid == Some(true) && valid);
            }
        }
        self.votes_dirty.store(true, Ordering::Release);
        self.wallets_dirty.store(true, Ordering::Release);
        Ok(true)
    }

    pub fn vote(&self, tx_hash: &B256) -> Result<Option<VoteRecord>, LedgerError> {
        Ok(self.votes()?.get(tx_hash).cloned())
    }

    pub fn wallet(&self, address: &str) -> Result<Option<WalletRecord>, LedgerError> {
        Ok(self.wallets()?.get(address).cloned())
    }

    pub fn pending_votes(&self) -> Result<Vec<VoteRecord>, LedgerError> {
        Ok(self.votes()?.values().filter(|vote| vote.is_pending()).cloned().collect())
    }

    /// Addresses of wallets with at least one vote and no period-end verdict yet.
    pub fn unfinalized_wallets(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self
            .wallets()?
            .values()
            .filter(|wallet| !wallet.is_finalized() && !wallet.vote_tx_hashes.is_empty())
            .map(|wallet| wallet.address.clone())
            .collect())
    }

    /// Copies of both tables, taken under both locks so they are mutually consistent.
    pub fn snapshot(&self) -> Result<(Vec<VoteRecord>, Vec<WalletRecord>), LedgerError> {
        let votes = self.votes()?;
        let wallets = self.wallets()?;
        Ok((votes.values().cloned().collect(), wallets.values().cloned().collect()))
    }

    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let votes = self.votes()?;
        let wallets = self.wallets()?;
        Ok(LedgerStats {
            votes: votes.len(),
            wallets: wallets.len(),
            pending_votes: votes.values().filter(|vote| vote.is_pending()).count(),
            finalized_wallets: wallets.values().filter(|wallet| wallet.is_finalized()).count(),
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.votes_dirty.load(Ordering::Acquire) || self.wallets_dirty.load(Ordering::Acquire)
    }

    /// Writes both tables as one snapshot if either changed since the last flush.
    ///
    /// The dirty flags are cleared before the copy is taken and raised again if the write
    /// fails, so a concurrent update is never lost.
    pub async fn flush(&self, store: &SnapshotStore) -> Result<FlushStats, LedgerError> {
        let votes_dirty = self.votes_dirty.swap(false, Ordering::AcqRel);
        let wallets_dirty = self.wallets_dirty.swap(false, Ordering::AcqRel);
        if !votes_dirty && !wallets_dirty {
            return Ok(FlushStats::default());
        }

        let snapshot = {
            let votes = self.votes()?;
            let wallets = self.wallets()?;
            LedgerSnapshot {
                votes: votes.iter().map(|(k, v)| (*k, v.clone())).collect(),
                wallets: wallets.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }
        };
        if let Err(err) = store.write_table(LEDGER_TABLE, &snapshot).await {
            self.votes_dirty.store(true, Ordering::Release);
            self.wallets_dirty.store(true, Ordering::Release);
            return Err(err.into());
        }

        let stats = FlushStats {
            votes_written: Some(snapshot.votes.len()),
            wallets_written: Some(snapshot.wallets.len()),
        };
        tracing::debug!(
            "Flushed ledger: {} votes, {} wallets",
            snapshot.votes.len(),
            snapshot.wallets.len()
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{address, tx_hash};

    fn vote(seed: u64, voter: Address, block: u64, pit: Option<bool>) -> VoteRecord {
        let amount = pit.map(|valid| Amount::from_whole(if valid { 150 } else { 50 }));
        VoteRecord {
            tx_hash: tx_hash(seed),
            voter_address: voter_key(&voter),
            linked_address: Some(format!("sei1voter{seed}")),
            block_number: block,
            timestamp: DateTime::from_timestamp(1_700_000_000 + block as i64, 0).unwrap(),
            value: U256::from(seed),
            balance_at_vote: amount,
            balance_before_vote: amount,
            point_in_time_valid: pit,
            final_valid: None,
            detection: BTreeSet::from([DetectionSignal::ValueTransfer]),
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let ledger = VoteLedger::new();
        let record = vote(1, address(1), 100, Some(true));
        assert!(ledger.insert_vote(record.clone()).unwrap());
        assert!(!ledger.insert_vote(record.clone()).unwrap());

        let wallet = ledger.wallet(&record.voter_address).unwrap().unwrap();
        assert_eq!(wallet.vote_tx_hashes, vec![record.tx_hash]);
        assert_eq!(wallet.balances.len(), 2);
        assert_eq!(ledger.stats().unwrap().votes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_record_once() {
        let ledger = Arc::new(VoteLedger::new());
        let record = vote(7, address(7), 10, Some(true));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                let record = record.clone();
                tokio::spawn(async move { ledger.insert_vote(record).unwrap() })
            })
            .collect();
        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        let wallet = ledger.wallet(&record.voter_address).unwrap().unwrap();
        assert_eq!(wallet.vote_tx_hashes.len(), 1);
    }

    #[test]
    fn finalization_combines_point_in_time_and_final_balance() {
        let ledger = VoteLedger::new();
        let voter = address(1);
        let valid = vote(1, voter, 100, Some(true));
        let invalid = vote(2, voter, 200, Some(false));
        ledger.insert_vote(valid.clone()).unwrap();
        ledger.insert_vote(invalid.clone()).unwrap();

        let min = Amount::from_whole(100);
        assert!(ledger
            .finalize_wallet(&voter_key(&voter), 1_000, Some(Amount::from_whole(120)), min)
            .unwrap());
        assert_eq!(ledger.vote(&valid.tx_hash).unwrap().unwrap().final_valid, Some(true));
        assert_eq!(ledger.vote(&invalid.tx_hash).unwrap().unwrap().final_valid, Some(false));

        // Terminal: a second pass with a different balance changes nothing.
        assert!(!ledger
            .finalize_wallet(&voter_key(&voter), 1_000, Some(Amount::ZERO), min)
            .unwrap());
        let wallet = ledger.wallet(&voter_key(&voter)).unwrap().unwrap();
        assert_eq!(wallet.final_balance, Some(Amount::from_whole(120)));
        assert_eq!(wallet.final_balance_valid, Some(true));
    }

    #[test]
    fn failed_final_lookup_invalidates() {
        let ledger = VoteLedger::new();
        let record = vote(1, address(1), 100, Some(true));
        ledger.insert_vote(record.clone()).unwrap();
        ledger
            .finalize_wallet(&record.voter_address, 500, None, Amount::from_whole(100))
            .unwrap();

        let wallet = ledger.wallet(&record.voter_address).unwrap().unwrap();
        assert_eq!(wallet.final_balance, Some(Amount::ZERO));
        assert_eq!(wallet.final_balance_valid, Some(false));
        assert!(!wallet.balances.contains_key(&500));
        assert_eq!(ledger.vote(&record.tx_hash).unwrap().unwrap().final_valid, Some(false));
    }

    #[test]
    fn late_vote_inherits_final_verdict() {
        let ledger = VoteLedger::new();
        let voter = address(3);
        ledger.insert_vote(vote(1, voter, 10, Some(true))).unwrap();
        ledger
            .finalize_wallet(
                &voter_key(&voter),
                50,
                Some(Amount::from_whole(500)),
                Amount::from_whole(100),
            )
            .unwrap();

        let late = vote(2, voter, 40, Some(true));
        ledger.insert_vote(late.clone()).unwrap();
        assert_eq!(ledger.vote(&late.tx_hash).unwrap().unwrap().final_valid, Some(true));

        let pending = vote(3, voter, 41, None);
        ledger.insert_vote(pending.clone()).unwrap();
        assert_eq!(ledger.vote(&pending.tx_hash).unwrap().unwrap().final_valid, Some(false));
    }

    #[test]
    fn pending_votes_can_be_revalidated_once() {
        let ledger = VoteLedger::new();
        let record = vote(1, address(1), 100, None);
        ledger.insert_vote(record.clone()).unwrap();
        assert_eq!(ledger.pending_votes().unwrap().len(), 1);

        let validation = Validation {
            linked_address: Some("sei1late".into()),
            balance_at_vote: Some(Amount::from_whole(200)),
            balance_before_vote: Some(Amount::from_whole(200)),
            point_in_time_valid: Some(true),
        };
        assert!(ledger.update_validation(&record.tx_hash, validation.clone()).unwrap());
        assert!(!ledger.update_validation(&record.tx_hash, validation).unwrap());
        assert!(ledger.pending_votes().unwrap().is_empty());
        assert_eq!(ledger.vote(&record.tx_hash).unwrap().unwrap().point_in_time_valid, Some(true));
    }

    #[tokio::test]
    async fn flush_writes_once_per_change_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let ledger = VoteLedger::new();
        let record = vote(1, address(1), 100, Some(true));
        ledger.insert_vote(record.clone()).unwrap();

        let first = ledger.flush(&store).await.unwrap();
        assert_eq!(first, FlushStats { votes_written: Some(1), wallets_written: Some(1) });
        assert!(!ledger.is_dirty());
        assert_eq!(ledger.flush(&store).await.unwrap(), FlushStats::default());

        let restored = VoteLedger::load(&store).await.unwrap();
        assert_eq!(restored.vote(&record.tx_hash).unwrap(), Some(record.clone()));
        assert!(!restored.insert_vote(record).unwrap());
    }

    #[tokio::test]
    async fn votes_missing_from_their_wallet_are_attached_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let voter = address(1);
        let first = vote(1, voter, 100, Some(true));
        let second = vote(2, voter, 200, Some(true));
        let finalized = vote(3, address(2), 150, Some(true));

        // A snapshot whose wallets table lost the first voter and lists no votes for the
        // finalized wallet.
        let mut wallet = WalletRecord::new(finalized.voter_address.clone());
        wallet.final_balance = Some(Amount::from_whole(500));
        wallet.final_balance_valid = Some(true);
        let snapshot = LedgerSnapshot {
            votes: [&first, &second, &finalized]
                .into_iter()
                .map(|vote| (vote.tx_hash, vote.clone()))
                .collect(),
            wallets: vec![(wallet.address.clone(), wallet)],
        };
        store.write_table(LEDGER_TABLE, &snapshot).await.unwrap();

        let ledger = VoteLedger::load(&store).await.unwrap();
        assert!(ledger.is_dirty());
        let restored = ledger.wallet(&voter_key(&voter)).unwrap().unwrap();
        assert_eq!(restored.vote_tx_hashes, vec![first.tx_hash, second.tx_hash]);
        assert_eq!(restored.balances.len(), 4);
        assert_eq!(ledger.unfinalized_wallets().unwrap(), vec![voter_key(&voter)]);
        assert_eq!(ledger.vote(&finalized.tx_hash).unwrap().unwrap().final_valid, Some(true));

        ledger
            .finalize_wallet(
                &voter_key(&voter),
                300,
                Some(Amount::from_whole(120)),
                Amount::from_whole(100),
            )
            .unwrap();
        assert_eq!(ledger.vote(&first.tx_hash).unwrap().unwrap().final_valid, Some(true));
        assert_eq!(ledger.vote(&second.tx_hash).unwrap().unwrap().final_valid, Some(true));
        assert_eq!(ledger.repair_membership().unwrap(), 0);
    }
}
