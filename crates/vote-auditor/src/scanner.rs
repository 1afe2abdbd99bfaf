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

//! Block scanning: fetch blocks in bounded chunks and emit vote candidates and checkpoints.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    time::{Duration, Instant},
};

use alloy::primitives::{Address, FixedBytes, B256, U256};
use futures_util::{future::join_all, stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    chain_data::ChainData,
    errors::{impl_coded_debug, CodedError},
    gateway::{ChainReceipt, ChainTransaction, GatewayError},
};

#[derive(Error)]
pub enum ScanError {
    #[error("scan event consumer is gone")]
    ConsumerClosed,

    #[error("invalid scan range {from}..={to}")]
    InvalidRange { from: u64, to: u64 },
}

impl_coded_debug!(ScanError);

impl CodedError for ScanError {
    fn code(&self) -> &str {
        match self {
            ScanError::ConsumerClosed => "[VA-SCAN-001]",
            ScanError::InvalidRange { .. } => "[VA-SCAN-002]",
        }
    }
}

/// The two contracts behind the vote mechanism and the vote method selector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteContracts {
    pub proxy: Address,
    pub implementation: Address,
    pub vote_selector: FixedBytes<4>,
}

impl VoteContracts {
    fn targets(&self, tx: &ChainTransaction) -> bool {
        matches!(tx.to, Some(to) if to == self.proxy || to == self.implementation)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Blocks per chunk during historical backfill
    pub backfill_chunk_size: u64,
    /// Blocks per chunk while following the head
    pub live_chunk_size: u64,
    pub max_concurrent_chunks: usize,
    /// Blocks fetched concurrently inside a chunk
    pub group_size: usize,
    /// Pause between block groups of a chunk
    pub group_delay_ms: u64,
    /// Capacity of the channel between the scanner and the validation consumer
    pub channel_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            backfill_chunk_size: 500,
            live_chunk_size: 20,
            max_concurrent_chunks: 3,
            group_size: 10,
            group_delay_ms: 100,
            channel_capacity: 1_024,
        }
    }
}

/// Why a transaction was classified as a vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSignal {
    ValueTransfer,
    VoteSelector,
    ImplementationLog,
    ProxyLog,
}

impl DetectionSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionSignal::ValueTransfer => "value_transfer",
            DetectionSignal::VoteSelector => "vote_selector",
            DetectionSignal::ImplementationLog => "implementation_log",
            DetectionSignal::ProxyLog => "proxy_log",
        }
    }
}

impl fmt::Display for DetectionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every signal that fires for a successful transaction. Any one of them makes it a vote.
pub fn classify(
    tx: &ChainTransaction,
    receipt: &ChainReceipt,
    contracts: &VoteContracts,
) -> BTreeSet<DetectionSignal> {
    let mut signals = BTreeSet::new();
    let to_proxy = tx.to == Some(contracts.proxy);
    if to_proxy && tx.value > U256::ZERO {
        signals.insert(DetectionSignal::ValueTransfer);
    }
    if to_proxy && tx.input.len() >= 4 && tx.input[..4] == contracts.vote_selector[..] {
        signals.insert(DetectionSignal::VoteSelector);
    }
    if receipt.log_addresses.contains(&contracts.implementation) {
        signals.insert(DetectionSignal::ImplementationLog);
    }
    if receipt.log_addresses.contains(&contracts.proxy) {
        signals.insert(DetectionSignal::ProxyLog);
    }
    signals
}

/// A transaction classified as a vote, before any balance checks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCandidate {
    pub tx_hash: B256,
    pub voter: Address,
    pub block_number: u64,
    /// Unix seconds of the containing block
    pub timestamp: u64,
    pub value: U256,
    pub signals: BTreeSet<DetectionSignal>,
}

impl VoteCandidate {
    /// Comma joined signal tags, in a stable order.
    pub fn detection_method(&self) -> String {
        self.signals.iter().map(DetectionSignal::as_str).collect::<Vec<_>>().join(",")
    }
}

/// Output of the scanner, consumed by exactly one validation loop.
///
/// All candidates and failed blocks of a chunk are sent before the checkpoint that covers them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanEvent {
    Candidate(VoteCandidate),
    /// Blocks that could not be scanned and must be recorded for a rescan.
    Missed(Vec<u64>),
    Checkpoint(u64),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub blocks_scanned: u64,
    pub candidates: usize,
    /// Blocks whose body or receipts could not be fetched; they need a rescan.
    pub failed_blocks: Vec<u64>,
    /// Highest height below which every chunk completed.
    pub checkpoint: Option<u64>,
    pub cancelled: bool,
}

#[derive(Default)]
struct ChunkResult {
    start: u64,
    end: u64,
    candidates: Vec<VoteCandidate>,
    failed_blocks: Vec<u64>,
}

enum BlockScan {
    Scanned(Vec<VoteCandidate>),
    Failed(GatewayError),
}

/// Tracks completed chunks and exposes the contiguous completed prefix.
struct Watermark {
    next_start: u64,
    done: BTreeMap<u64, u64>,
    height: Option<u64>,
}

impl Watermark {
    fn new(from: u64) -> Self {
        Self { next_start: from, done: BTreeMap::new(), height: None }
    }

    /// Records a finished chunk and returns the new watermark if it moved.
    fn complete(&mut self, start: u64, end: u64) -> Option<u64> {
        self.done.insert(start, end);
        let before = self.height;
        while let Some(end) = self.done.remove(&self.next_start) {
            self.height = Some(end);
            self.next_start = end + 1;
        }
        (self.height != before).then_some(self.height).flatten()
    }
}

#[derive(Clone)]
pub struct VoteScanner {
    data: ChainData,
    contracts: VoteContracts,
    config: ScanConfig,
}

impl VoteScanner {
    pub fn new(data: ChainData, contracts: VoteContracts, config: ScanConfig) -> Self {
        Self { data, contracts, config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scans `from..=to` in chunks of `chunk_size`, sending candidates and checkpoints to `events`.
    ///
    /// At most `max_concurrent_chunks` chunks are in flight. Cancelling `cancel` stops new
    /// chunks from being scheduled; chunks already running finish and are reported.
    pub async fn scan(
        &self,
        from: u64,
        to: u64,
        chunk_size: u64,
        events: &mpsc::Sender<ScanEvent>,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ScanError> {
        if from > to || chunk_size == 0 {
            return Err(ScanError::InvalidRange { from, to });
        }
        let start = Instant::now();
        let total = to - from + 1;
        let chunks = chunk_bounds(from, to, chunk_size);
        tracing::info!(
            "Scanning blocks {from} to {to} in {} chunks of {chunk_size}",
            chunks.len()
        );

        let mut outcome = ScanOutcome::default();
        let mut watermark = Watermark::new(from);
        let mut seen = HashSet::new();

        let mut results = stream::iter(chunks)
            .take_while(|_| std::future::ready(!cancel.is_cancelled()))
            .map(|(start, end)| self.scan_chunk(start, end))
            .buffer_unordered(self.config.max_concurrent_chunks.max(1));

        while let Some(chunk) = results.next().await {
            for candidate in chunk.candidates {
                if !seen.insert(candidate.tx_hash) {
                    continue;
                }
                outcome.candidates += 1;
                events
                    .send(ScanEvent::Candidate(candidate))
                    .await
                    .map_err(|_| ScanError::ConsumerClosed)?;
            }
            outcome.blocks_scanned += chunk.end - chunk.start + 1;
            if !chunk.failed_blocks.is_empty() {
                outcome.failed_blocks.extend_from_slice(&chunk.failed_blocks);
                events
                    .send(ScanEvent::Missed(chunk.failed_blocks))
                    .await
                    .map_err(|_| ScanError::ConsumerClosed)?;
            }

            if let Some(height) = watermark.complete(chunk.start, chunk.end) {
                outcome.checkpoint = Some(height);
                events
                    .send(ScanEvent::Checkpoint(height))
                    .await
                    .map_err(|_| ScanError::ConsumerClosed)?;
            }
            tracing::info!(
                "Scanned chunk {}-{} ({:.1}% of range, {} votes found so far)",
                chunk.start,
                chunk.end,
                outcome.blocks_scanned as f64 * 100.0 / total as f64,
                outcome.candidates
            );
        }

        outcome.cancelled = cancel.is_cancelled() && outcome.blocks_scanned < total;
        outcome.failed_blocks.sort_unstable();
        if !outcome.failed_blocks.is_empty() {
            tracing::warn!(
                "{} blocks could not be scanned: {:?}",
                outcome.failed_blocks.len(),
                outcome.failed_blocks
            );
        }
        tracing::info!(
            "Scan of {from}-{to} finished in {:?}: {} blocks, {} votes{}",
            start.elapsed(),
            outcome.blocks_scanned,
            outcome.candidates,
            if outcome.cancelled { " (stopped early)" } else { "" }
        );
        Ok(outcome)
    }

    /// Scans `from..=to` and returns the unique candidates by hash.
    pub async fn collect(
        &self,
        from: u64,
        to: u64,
        chunk_size: u64,
    ) -> Result<(BTreeMap<B256, VoteCandidate>, ScanOutcome), ScanError> {
        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let consume = async move {
            let mut found = BTreeMap::new();
            while let Some(event) = rx.recv().await {
                if let ScanEvent::Candidate(candidate) = event {
                    found.entry(candidate.tx_hash).or_insert(candidate);
                }
            }
            found
        };
        let produce = async move {
            let outcome = self.scan(from, to, chunk_size, &tx, &cancel).await;
            drop(tx);
            outcome
        };
        let (outcome, found) = tokio::join!(produce, consume);
        Ok((found, outcome?))
    }

    /// Rescans individual blocks, returning the candidates found and the blocks that failed again.
    pub async fn rescan_blocks(&self, blocks: &[u64]) -> (Vec<VoteCandidate>, Vec<u64>) {
        let mut candidates = Vec::new();
        let mut failed = Vec::new();
        for &number in blocks {
            match self.scan_block(number).await {
                BlockScan::Scanned(found) => candidates.extend(found),
                BlockScan::Failed(err) => {
                    tracing::warn!("Rescan of block {number} failed again: {err}");
                    failed.push(number);
                }
            }
        }
        (candidates, failed)
    }

    async fn scan_chunk(&self, start: u64, end: u64) -> ChunkResult {
        let mut result = ChunkResult { start, end, ..Default::default() };
        let numbers: Vec<u64> = (start..=end).collect();
        let group_size = self.config.group_size.max(1);
        let delay = Duration::from_millis(self.config.group_delay_ms);

        for (idx, group) in numbers.chunks(group_size).enumerate() {
            if idx > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let scans = join_all(group.iter().map(|&number| self.scan_block(number))).await;
            for (&number, scan) in group.iter().zip(scans) {
                match scan {
                    BlockScan::Scanned(found) => result.candidates.extend(found),
                    BlockScan::Failed(err) => {
                        tracing::warn!("Failed to scan block {number}: {err}");
                        result.failed_blocks.push(number);
                    }
                }
            }
        }
        tracing::debug!(
            "Chunk {start}-{end}: {} candidates, {} failed blocks",
            result.candidates.len(),
            result.failed_blocks.len()
        );
        result
    }

    async fn scan_block(&self, number: u64) -> BlockScan {
        let block = match self.data.block(number).await {
            Ok(block) => block,
            Err(err) if err.is_not_found() => {
                tracing::warn!("Block {number} not found, skipping");
                return BlockScan::Scanned(vec![]);
            }
            Err(err) => return BlockScan::Failed(err),
        };

        let targeted: Vec<&ChainTransaction> =
            block.transactions.iter().filter(|tx| self.contracts.targets(tx)).collect();
        if targeted.is_empty() {
            return BlockScan::Scanned(vec![]);
        }

        let receipts = join_all(targeted.iter().map(|tx| self.data.receipt(tx.hash))).await;
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        for (tx, receipt) in targeted.into_iter().zip(receipts) {
            let receipt = match receipt {
                Ok(receipt) => receipt,
                Err(err) if err.is_not_found() => {
                    tracing::debug!("No receipt for {:#x}, not counted as a vote", tx.hash);
                    continue;
                }
                Err(err) => return BlockScan::Failed(err),
            };
            if !receipt.success {
                tracing::debug!("Transaction {:#x} reverted, skipping", tx.hash);
                continue;
            }
            let signals = classify(tx, &receipt, &self.contracts);
            if signals.is_empty() || !seen.insert(tx.hash) {
                continue;
            }
            candidates.push(VoteCandidate {
                tx_hash: tx.hash,
                voter: tx.from,
                block_number: number,
                timestamp: block.timestamp,
                value: tx.value,
                signals,
            });
        }
        BlockScan::Scanned(candidates)
    }
}

fn chunk_bounds(from: u64, to: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    let mut start = from;
    loop {
        let end = start.saturating_add(chunk_size - 1).min(to);
        chunks.push((start, end));
        if end >= to {
            break;
        }
        start = end + 1;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use alloy::primitives::{Bytes, U256};

    use super::*;
    use crate::{
        cache::CacheSet,
        gateway::ChainTransaction,
        test_utils::{address, mock_gateway, transaction, MockChain, MockLedger, MockTranslator},
    };

    fn contracts() -> VoteContracts {
        VoteContracts {
            proxy: address(100),
            implementation: address(101),
            vote_selector: FixedBytes::from([0xde, 0xad, 0xbe, 0xef]),
        }
    }

    fn scanner(chain: Arc<MockChain>) -> VoteScanner {
        let gateway = mock_gateway(
            chain,
            Arc::new(MockLedger::default()),
            Arc::new(MockTranslator::default()),
        );
        let data = ChainData::new(Arc::new(gateway), Arc::new(CacheSet::default()));
        let config = ScanConfig { group_delay_ms: 0, ..ScanConfig::default() };
        VoteScanner::new(data, contracts(), config)
    }

    fn receipt(tx: &ChainTransaction, logs: Vec<Address>) -> ChainReceipt {
        ChainReceipt {
            transaction_hash: tx.hash,
            block_number: Some(1),
            success: true,
            log_addresses: logs,
        }
    }

    #[test]
    fn each_signal_alone_is_a_vote() {
        let c = contracts();
        let other = address(5);

        let transfer = transaction(1, address(1), c.proxy, U256::from(50), Bytes::new());
        assert_eq!(
            classify(&transfer, &receipt(&transfer, vec![]), &c),
            BTreeSet::from([DetectionSignal::ValueTransfer])
        );

        let input = Bytes::from(vec![0xde, 0xad, 0xbe, 0xef, 1]);
        let call = transaction(2, address(1), c.proxy, U256::ZERO, input);
        assert_eq!(
            classify(&call, &receipt(&call, vec![]), &c),
            BTreeSet::from([DetectionSignal::VoteSelector])
        );

        let logged = transaction(3, address(1), c.implementation, U256::ZERO, Bytes::new());
        assert_eq!(
            classify(&logged, &receipt(&logged, vec![other, c.implementation]), &c),
            BTreeSet::from([DetectionSignal::ImplementationLog])
        );
        assert_eq!(
            classify(&logged, &receipt(&logged, vec![c.proxy]), &c),
            BTreeSet::from([DetectionSignal::ProxyLog])
        );

        let nothing =
            transaction(4, address(1), c.proxy, U256::ZERO, Bytes::from(vec![1, 2, 3, 4]));
        assert!(classify(&nothing, &receipt(&nothing, vec![other]), &c).is_empty());
    }

    #[test]
    fn detection_method_is_sorted_and_joined() {
        let c = contracts();
        let input = Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]);
        let tx = transaction(1, address(1), c.proxy, U256::from(1), input);
        let signals = classify(&tx, &receipt(&tx, vec![c.proxy, c.implementation]), &c);
        let candidate = VoteCandidate {
            tx_hash: tx.hash,
            voter: tx.from,
            block_number: 1,
            timestamp: 0,
            value: tx.value,
            signals,
        };
        assert_eq!(
            candidate.detection_method(),
            "value_transfer,vote_selector,implementation_log,proxy_log"
        );
    }

    #[test]
    fn chunk_bounds_cover_range() {
        assert_eq!(chunk_bounds(0, 9, 4), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(chunk_bounds(5, 5, 100), vec![(5, 5)]);
    }

    #[test]
    fn watermark_only_advances_over_contiguous_chunks() {
        let mut watermark = Watermark::new(0);
        assert_eq!(watermark.complete(10, 19), None);
        assert_eq!(watermark.complete(20, 29), None);
        assert_eq!(watermark.complete(0, 9), Some(29));
        assert_eq!(watermark.complete(30, 39), Some(39));
    }

    #[tokio::test]
    async fn skips_failed_and_untargeted_transactions() {
        let chain = Arc::new(MockChain::with_blocks(50, 1_000, 1));
        let c = contracts();
        let good = chain.add_transaction(
            10,
            transaction(1, address(1), c.proxy, U256::from(50), Bytes::new()),
            true,
            vec![],
        );
        chain.add_transaction(
            11,
            transaction(2, address(2), c.proxy, U256::from(50), Bytes::new()),
            false,
            vec![],
        );
        chain.add_transaction(
            12,
            transaction(3, address(3), address(9), U256::from(50), Bytes::new()),
            true,
            vec![c.proxy],
        );

        let (found, outcome) = scanner(chain).collect(0, 49, 7).await.unwrap();
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![good]);
        assert_eq!(found[&good].block_number, 10);
        assert_eq!(found[&good].timestamp, 1_010);
        assert_eq!(outcome.blocks_scanned, 50);
        assert_eq!(outcome.checkpoint, Some(49));
    }

    #[tokio::test]
    async fn concurrency_does_not_change_the_result() {
        let chain = Arc::new(MockChain::with_blocks(200, 1_000, 1));
        let c = contracts();
        for n in 0..40u64 {
            chain.add_transaction(
                n * 5,
                transaction(n, address(n), c.proxy, U256::from(n + 1), Bytes::new()),
                true,
                vec![],
            );
        }

        let base = scanner(chain.clone());
        let (serial, _) = VoteScanner::new(
            base.data.clone(),
            c.clone(),
            ScanConfig {
                max_concurrent_chunks: 1,
                group_size: 1,
                group_delay_ms: 0,
                ..Default::default()
            },
        )
        .collect(0, 199, 13)
        .await
        .unwrap();
        let (parallel, _) = base.collect(0, 199, 9).await.unwrap();
        assert_eq!(serial.len(), 40);
        assert_eq!(serial, parallel);
    }

    #[tokio::test]
    async fn failed_blocks_are_reported_and_rescannable() {
        let chain = Arc::new(MockChain::with_blocks(30, 1_000, 1));
        let c = contracts();
        chain.add_transaction(
            15,
            transaction(1, address(1), c.proxy, U256::from(5), Bytes::new()),
            true,
            vec![],
        );
        chain.fail_block(15);

        let scanner = scanner(chain.clone());
        let (found, outcome) = scanner.collect(0, 29, 10).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(outcome.failed_blocks, vec![15]);
        assert_eq!(outcome.checkpoint, Some(29));

        let (retried, still_failed) = scanner.rescan_blocks(&[15]).await;
        assert_eq!(still_failed, vec![15]);
        assert!(retried.is_empty());
    }

    #[tokio::test]
    async fn failed_blocks_are_sent_before_the_covering_checkpoint() {
        let chain = Arc::new(MockChain::with_blocks(30, 1_000, 1));
        chain.fail_block(12);
        chain.fail_block(27);
        let (tx, mut rx) = mpsc::channel(64);
        let outcome =
            scanner(chain).scan(0, 29, 10, &tx, &CancellationToken::new()).await.unwrap();
        drop(tx);
        assert_eq!(outcome.failed_blocks, vec![12, 27]);

        let mut missed = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Missed(blocks) => missed.extend(blocks),
                ScanEvent::Checkpoint(height) => {
                    for block in [12u64, 27].into_iter().filter(|&block| block <= height) {
                        assert!(missed.contains(&block), "checkpoint {height} passed {block}");
                    }
                }
                ScanEvent::Candidate(_) => {}
            }
        }
        missed.sort_unstable();
        assert_eq!(missed, vec![12, 27]);
    }

    #[tokio::test]
    async fn cancellation_stops_scheduling() {
        let chain = Arc::new(MockChain::with_blocks(1_000, 1_000, 1));
        let scanner = scanner(chain);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = scanner.scan(0, 999, 10, &tx, &cancel).await.unwrap();
        drop(tx);
        assert!(outcome.cancelled);
        assert_eq!(outcome.blocks_scanned, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_consumer_is_an_error() {
        let chain = Arc::new(MockChain::with_blocks(10, 1_000, 1));
        let scanner = scanner(chain);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = scanner.scan(0, 9, 5, &tx, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ScanError::ConsumerClosed));
    }
}
