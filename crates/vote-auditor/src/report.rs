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

//! Export rows and summary statistics built from ledger snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    amount::Amount,
    ledger::{LedgerError, VoteLedger, VoteRecord, WalletRecord},
    store::{SnapshotStore, StoreError},
};

pub const VOTES_REPORT: &str = "votes_report";
pub const WALLETS_REPORT: &str = "wallets_report";
pub const SUMMARY_REPORT: &str = "summary";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRow {
    pub tx_hash: String,
    pub voter_address: String,
    pub linked_address: Option<String>,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub balance_at_vote: Option<Amount>,
    pub balance_before_vote: Option<Amount>,
    pub detection_method: String,
    pub point_in_time_valid: Option<bool>,
    pub final_valid: Option<bool>,
}

impl From<&VoteRecord> for VoteRow {
    fn from(vote: &VoteRecord) -> Self {
        Self {
            tx_hash: format!("{:#x}", vote.tx_hash),
            voter_address: vote.voter_address.clone(),
            linked_address: vote.linked_address.clone(),
            block_number: vote.block_number,
            timestamp: vote.timestamp,
            balance_at_vote: vote.balance_at_vote,
            balance_before_vote: vote.balance_before_vote,
            detection_method: vote.detection_method(),
            point_in_time_valid: vote.point_in_time_valid,
            final_valid: vote.final_valid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRow {
    pub address: String,
    pub linked_address: Option<String>,
    pub vote_count: usize,
    pub valid_vote_count: usize,
    pub final_balance: Option<Amount>,
    pub final_balance_valid: Option<bool>,
}

/// A vote counts as valid on its final verdict, or on its point-in-time verdict before
/// finalization.
pub fn is_valid(vote: &VoteRecord) -> bool {
    vote.final_valid.or(vote.point_in_time_valid) == Some(true)
}

pub fn vote_rows(votes: &[VoteRecord]) -> Vec<VoteRow> {
    let mut rows: Vec<VoteRow> = votes.iter().map(VoteRow::from).collect();
    rows.sort_by(|a, b| {
        a.block_number.cmp(&b.block_number).then_with(|| a.tx_hash.cmp(&b.tx_hash))
    });
    rows
}

pub fn wallet_rows(votes: &[VoteRecord], wallets: &[WalletRecord]) -> Vec<WalletRow> {
    let by_hash: HashMap<_, _> = votes.iter().map(|vote| (vote.tx_hash, vote)).collect();
    wallets
        .iter()
        .map(|wallet| WalletRow {
            address: wallet.address.clone(),
            linked_address: wallet.linked_address.clone(),
            vote_count: wallet.vote_tx_hashes.len(),
            valid_vote_count: wallet
                .vote_tx_hashes
                .iter()
                .filter(|hash| by_hash.get(*hash).is_some_and(|vote| is_valid(vote)))
                .count(),
            final_balance: wallet.final_balance,
            final_balance_valid: wallet.final_balance_valid,
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub label: String,
    pub wallets: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopWallet {
    pub address: String,
    pub vote_count: usize,
    pub valid_vote_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub generated_at: DateTime<Utc>,
    pub min_balance: Amount,
    pub total_votes: usize,
    pub valid_votes: usize,
    pub valid_vote_pct: f64,
    pub pending_votes: usize,
    pub total_wallets: usize,
    pub valid_wallets: usize,
    pub valid_wallet_pct: f64,
    pub finalized_wallets: usize,
    pub vote_count_buckets: Vec<Bucket>,
    pub balance_buckets: Vec<Bucket>,
    pub top_wallets: Vec<TopWallet>,
}

const VOTE_COUNT_BUCKETS: [(&str, usize, usize); 5] =
    [("1", 1, 1), ("2-5", 2, 5), ("6-10", 6, 10), ("11-50", 11, 50), ("51+", 51, usize::MAX)];

fn pct(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 * 10_000.0 / total as f64).round() / 100.0
    }
}

/// Balance bucket of a wallet, relative to the required minimum.
fn balance_bucket(balance: Option<Amount>, min: Amount) -> &'static str {
    let Some(balance) = balance else {
        return "unknown";
    };
    if balance.is_zero() {
        "zero"
    } else if balance < min {
        "below_minimum"
    } else if balance < min.saturating_mul(10) {
        "1x-10x_minimum"
    } else if balance < min.saturating_mul(100) {
        "10x-100x_minimum"
    } else {
        "100x+_minimum"
    }
}

const BALANCE_BUCKETS: [&str; 6] =
    ["zero", "below_minimum", "1x-10x_minimum", "10x-100x_minimum", "100x+_minimum", "unknown"];

impl Summary {
    pub fn build(
        votes: &[VoteRecord],
        wallets: &[WalletRecord],
        min_balance: Amount,
        top_n: usize,
    ) -> Self {
        let rows = wallet_rows(votes, wallets);
        let valid_votes = votes.iter().filter(|vote| is_valid(vote)).count();
        let valid_wallets = rows.iter().filter(|row| row.valid_vote_count > 0).count();

        let vote_count_buckets = VOTE_COUNT_BUCKETS
            .iter()
            .map(|(label, lo, hi)| Bucket {
                label: label.to_string(),
                wallets: rows.iter().filter(|row| (*lo..=*hi).contains(&row.vote_count)).count(),
            })
            .collect();

        let mut balance_counts: HashMap<&str, usize> = HashMap::new();
        for wallet in wallets {
            // Latest observed balance stands in until the period-end balance is known.
            let balance =
                wallet.final_balance.or_else(|| wallet.balances.values().next_back().copied());
            *balance_counts.entry(balance_bucket(balance, min_balance)).or_default() += 1;
        }
        let balance_buckets = BALANCE_BUCKETS
            .iter()
            .map(|label| Bucket {
                label: label.to_string(),
                wallets: balance_counts.get(label).copied().unwrap_or_default(),
            })
            .collect();

        let mut top: Vec<&WalletRow> = rows.iter().collect();
        top.sort_by(|a, b| b.vote_count.cmp(&a.vote_count).then_with(|| a.address.cmp(&b.address)));
        let top_wallets = top
            .into_iter()
            .take(top_n)
            .map(|row| TopWallet {
                address: row.address.clone(),
                vote_count: row.vote_count,
                valid_vote_count: row.valid_vote_count,
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            min_balance,
            total_votes: votes.len(),
            valid_votes,
            valid_vote_pct: pct(valid_votes, votes.len()),
            pending_votes: votes.iter().filter(|vote| vote.is_pending()).count(),
            total_wallets: wallets.len(),
            valid_wallets,
            valid_wallet_pct: pct(valid_wallets, wallets.len()),
            finalized_wallets: wallets.iter().filter(|wallet| wallet.is_finalized()).count(),
            vote_count_buckets,
            balance_buckets,
            top_wallets,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("ledger error: {0:?}")]
    Ledger(#[from] LedgerError),

    #[error("store error: {0:?}")]
    Store(#[from] StoreError),
}

/// Writes vote rows, wallet rows and the summary next to the ledger snapshots.
pub async fn write_reports(
    ledger: &VoteLedger,
    store: &SnapshotStore,
    min_balance: Amount,
    top_n: usize,
) -> Result<Summary, ReportError> {
    let (votes, wallets) = ledger.snapshot()?;
    let summary = Summary::build(&votes, &wallets, min_balance, top_n);
    store.write_table(VOTES_REPORT, &vote_rows(&votes)).await?;
    store.write_table(WALLETS_REPORT, &wallet_rows(&votes, &wallets)).await?;
    store.write_table(SUMMARY_REPORT, &summary).await?;
    tracing::info!(
        "Wrote reports to {}: {}/{} valid votes, {}/{} valid wallets",
        store.base_path().display(),
        summary.valid_votes,
        summary.total_votes,
        summary.valid_wallets,
        summary.total_wallets
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use alloy::primitives::U256;

    use super::*;
    use crate::test_utils::tx_hash;

    fn vote(seed: u64, voter: &str, pit: Option<bool>, final_valid: Option<bool>) -> VoteRecord {
        VoteRecord {
            tx_hash: tx_hash(seed),
            voter_address: voter.to_string(),
            linked_address: None,
            block_number: 100 - seed,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            value: U256::ZERO,
            balance_at_vote: None,
            balance_before_vote: None,
            point_in_time_valid: pit,
            final_valid,
            detection: BTreeSet::new(),
        }
    }

    fn wallet(address: &str, hashes: &[u64], final_balance: Option<u64>) -> WalletRecord {
        WalletRecord {
            address: address.to_string(),
            linked_address: None,
            balances: BTreeMap::new(),
            vote_tx_hashes: hashes.iter().map(|seed| tx_hash(*seed)).collect(),
            final_balance: final_balance.map(Amount::from_whole),
            final_balance_valid: final_balance.map(|b| b >= 100),
        }
    }

    #[test]
    fn summary_counts_and_buckets() {
        let votes = vec![
            vote(1, "0xa", Some(true), Some(true)),
            vote(2, "0xa", Some(true), Some(true)),
            vote(3, "0xb", Some(true), Some(false)),
            vote(4, "0xc", None, None),
        ];
        let wallets = vec![
            wallet("0xa", &[1, 2], Some(5_000)),
            wallet("0xb", &[3], Some(80)),
            wallet("0xc", &[4], None),
        ];

        let summary = Summary::build(&votes, &wallets, Amount::from_whole(100), 2);
        assert_eq!(summary.total_votes, 4);
        assert_eq!(summary.valid_votes, 2);
        assert_eq!(summary.valid_vote_pct, 50.0);
        assert_eq!(summary.pending_votes, 1);
        assert_eq!(summary.valid_wallets, 1);
        assert_eq!(summary.valid_wallet_pct, 33.33);
        assert_eq!(summary.finalized_wallets, 2);

        let buckets: Vec<(String, usize)> =
            summary.vote_count_buckets.iter().map(|b| (b.label.clone(), b.wallets)).collect();
        assert_eq!(buckets[0], ("1".to_string(), 2));
        assert_eq!(buckets[1], ("2-5".to_string(), 1));

        let balances: HashMap<String, usize> =
            summary.balance_buckets.iter().map(|b| (b.label.clone(), b.wallets)).collect();
        assert_eq!(balances["10x-100x_minimum"], 1);
        assert_eq!(balances["below_minimum"], 1);
        assert_eq!(balances["unknown"], 1);

        assert_eq!(summary.top_wallets.len(), 2);
        assert_eq!(summary.top_wallets[0].address, "0xa");
        assert_eq!(summary.top_wallets[0].valid_vote_count, 2);
    }

    #[test]
    fn rows_are_ordered_by_block() {
        let votes = vec![vote(1, "0xa", Some(true), None), vote(5, "0xa", Some(false), None)];
        let rows = vote_rows(&votes);
        assert_eq!(rows[0].block_number, 95);
        assert_eq!(rows[1].block_number, 99);
        assert_eq!(rows[0].point_in_time_valid, Some(false));
    }

    #[test]
    fn empty_ledger_has_zero_percentages() {
        let summary = Summary::build(&[], &[], Amount::from_whole(1), 10);
        assert_eq!(summary.valid_vote_pct, 0.0);
        assert!(summary.top_wallets.is_empty());
    }
}
