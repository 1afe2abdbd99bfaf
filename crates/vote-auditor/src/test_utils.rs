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

//! In-memory chain, ledger and translator doubles with call counters and failure injection.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::{
    amount::Amount,
    gateway::{
        AddressTranslator, BlockHeader, ChainBlock, ChainClient, ChainReceipt, ChainTransaction,
        Endpoints, Gateway, LedgerClient, RetryPolicy, Source, SourceError,
    },
};

/// Shared failure and latency knobs for every mock source.
#[derive(Default)]
struct Faults {
    calls: AtomicU64,
    fail_next: AtomicU64,
    fail_always: AtomicBool,
    delay_ms: AtomicU64,
}

impl Faults {
    async fn enter(&self) -> Result<(), SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(SourceError::NoResponse("injected failure".into()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(SourceError::NoResponse("injected failure".into()));
        }
        Ok(())
    }
}

macro_rules! fault_controls {
    () => {
        /// Fail the next `n` calls with a transient error.
        pub fn fail_next(&self, n: u64) {
            self.faults.fail_next.store(n, Ordering::SeqCst);
        }

        pub fn fail_always(&self, fail: bool) {
            self.faults.fail_always.store(fail, Ordering::SeqCst);
        }

        pub fn set_delay(&self, delay: Duration) {
            self.faults.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        /// Number of calls made against this source, failed ones included.
        pub fn calls(&self) -> u64 {
            self.faults.calls.load(Ordering::SeqCst)
        }
    };
}

/// Sparse step function of balances: the value at `h` is the last entry at or below `h`.
#[derive(Default)]
struct BalanceHistory<K> {
    entries: HashMap<K, BTreeMap<u64, Amount>>,
}

impl<K: std::hash::Hash + Eq> BalanceHistory<K> {
    fn set(&mut self, key: K, from_height: u64, amount: Amount) {
        self.entries.entry(key).or_default().insert(from_height, amount);
    }

    fn at<Q>(&self, key: &Q, height: u64) -> Amount
    where
        K: std::borrow::Borrow<Q>,
        Q: std::hash::Hash + Eq + ?Sized,
    {
        self.entries
            .get(key)
            .and_then(|history| history.range(..=height).next_back().map(|(_, amount)| *amount))
            .unwrap_or(Amount::ZERO)
    }
}

#[derive(Default)]
struct ChainState {
    head: u64,
    timestamps: Vec<u64>,
    transactions: BTreeMap<u64, Vec<ChainTransaction>>,
    receipts: HashMap<B256, ChainReceipt>,
    balances: BalanceHistory<Address>,
    failing_balances: Vec<Address>,
    failing_blocks: Vec<u64>,
}

/// A deterministic chain held in memory.
pub struct MockChain {
    name: String,
    state: Mutex<ChainState>,
    faults: Faults,
    balance_calls: AtomicU64,
}

impl MockChain {
    /// Blocks `0..count` with `timestamp(n) = start + interval * n`.
    pub fn with_blocks(count: u64, start: u64, interval: u64) -> Self {
        let timestamps = (0..count).map(|n| start + interval * n).collect();
        Self::with_timestamps(timestamps)
    }

    /// One block per entry, in height order.
    pub fn with_timestamps(timestamps: Vec<u64>) -> Self {
        let head = (timestamps.len() as u64).saturating_sub(1);
        Self {
            name: "mock-chain".into(),
            state: Mutex::new(ChainState { head, timestamps, ..Default::default() }),
            faults: Faults::default(),
            balance_calls: AtomicU64::new(0),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    fault_controls!();

    /// Number of balance lookups made against this chain.
    pub fn balance_calls(&self) -> u64 {
        self.balance_calls.load(Ordering::SeqCst)
    }

    /// Moves the head, appending blocks spaced by `interval` seconds when it grows.
    pub fn advance_head(&self, head: u64, interval: u64) {
        let mut state = self.state.lock().unwrap();
        while (state.timestamps.len() as u64) <= head {
            let next = state.timestamps.last().map_or(0, |ts| ts + interval);
            state.timestamps.push(next);
        }
        state.head = head;
    }

    pub fn timestamp(&self, number: u64) -> Option<u64> {
        self.state.lock().unwrap().timestamps.get(number as usize).copied()
    }

    /// Adds a transaction to block `number` along with its receipt.
    pub fn add_transaction(
        &self,
        number: u64,
        mut tx: ChainTransaction,
        success: bool,
        log_addresses: Vec<Address>,
    ) -> B256 {
        let mut state = self.state.lock().unwrap();
        tx.block_number = Some(number);
        let hash = tx.hash;
        state.receipts.insert(
            hash,
            ChainReceipt {
                transaction_hash: hash,
                block_number: Some(number),
                success,
                log_addresses,
            },
        );
        state.transactions.entry(number).or_default().push(tx);
        hash
    }

    /// Drops the receipt of `hash`, simulating a node that lost it.
    pub fn remove_receipt(&self, hash: B256) {
        self.state.lock().unwrap().receipts.remove(&hash);
    }

    /// Sets the balance of `account` from `from_height` onward.
    pub fn set_balance(&self, account: Address, from_height: u64, amount: Amount) {
        self.state.lock().unwrap().balances.set(account, from_height, amount);
    }

    /// Balance lookups for `account` fail with a transient error.
    pub fn fail_balances_for(&self, account: Address) {
        self.state.lock().unwrap().failing_balances.push(account);
    }

    /// Block body lookups at `number` fail with a transient error.
    pub fn fail_block(&self, number: u64) {
        self.state.lock().unwrap().failing_blocks.push(number);
    }

    pub fn recover_block(&self, number: u64) {
        self.state.lock().unwrap().failing_blocks.retain(|&failing| failing != number);
    }

    fn block_at(state: &ChainState, number: u64) -> Option<ChainBlock> {
        if number > state.head {
            return None;
        }
        let timestamp = *state.timestamps.get(number as usize)?;
        Some(ChainBlock {
            number,
            timestamp,
            transactions: state.transactions.get(&number).cloned().unwrap_or_default(),
        })
    }
}

impl Source for MockChain {
    fn name(&self) -> String {
        self.name.clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn head(&self) -> Result<u64, SourceError> {
        self.faults.enter().await?;
        Ok(self.state.lock().unwrap().head)
    }

    async fn header(&self, number: u64) -> Result<Option<BlockHeader>, SourceError> {
        self.faults.enter().await?;
        let state = self.state.lock().unwrap();
        Ok(Self::block_at(&state, number).map(|block| block.header()))
    }

    async fn block(&self, number: u64) -> Result<Option<ChainBlock>, SourceError> {
        self.faults.enter().await?;
        let state = self.state.lock().unwrap();
        if state.failing_blocks.contains(&number) {
            return Err(SourceError::HttpStatus(503));
        }
        Ok(Self::block_at(&state, number))
    }

    async fn transaction(&self, hash: B256) -> Result<Option<ChainTransaction>, SourceError> {
        self.faults.enter().await?;
        let state = self.state.lock().unwrap();
        Ok(state.transactions.values().flatten().find(|tx| tx.hash == hash).cloned())
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ChainReceipt>, SourceError> {
        self.faults.enter().await?;
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn balance(&self, account: Address, height: u64) -> Result<Amount, SourceError> {
        self.faults.enter().await?;
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.failing_balances.contains(&account) {
            return Err(SourceError::HttpStatus(500));
        }
        Ok(state.balances.at(&account, height))
    }
}

/// Bank-module balances keyed by native account.
#[derive(Default)]
pub struct MockLedger {
    balances: Mutex<BalanceHistory<String>>,
    faults: Faults,
}

impl MockLedger {
    fault_controls!();

    pub fn set_balance(&self, account: &str, from_height: u64, amount: Amount) {
        self.balances.lock().unwrap().set(account.to_string(), from_height, amount);
    }
}

impl Source for MockLedger {
    fn name(&self) -> String {
        "mock-ledger".into()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn balance(&self, account: &str, height: u64) -> Result<Amount, SourceError> {
        self.faults.enter().await?;
        Ok(self.balances.lock().unwrap().at(account, height))
    }
}

/// A two-way address book. Unknown addresses are reported as not found.
#[derive(Default)]
pub struct MockTranslator {
    forward: Mutex<HashMap<Address, String>>,
    faults: Faults,
}

impl MockTranslator {
    fault_controls!();

    pub fn link(&self, address: Address, native: &str) {
        self.forward.lock().unwrap().insert(address, native.to_string());
    }
}

impl Source for MockTranslator {
    fn name(&self) -> String {
        "mock-translator".into()
    }
}

#[async_trait]
impl AddressTranslator for MockTranslator {
    async fn to_native(&self, address: Address) -> Result<String, SourceError> {
        self.faults.enter().await?;
        self.forward
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("{address:#x}")))
    }

    async fn to_evm(&self, account: &str) -> Result<Address, SourceError> {
        self.faults.enter().await?;
        self.forward
            .lock()
            .unwrap()
            .iter()
            .find(|(_, native)| native.as_str() == account)
            .map(|(address, _)| *address)
            .ok_or_else(|| SourceError::NotFound(account.to_string()))
    }
}

/// Retry policy with millisecond delays so failure paths run quickly in tests.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        initial_delay: Duration::from_millis(1),
        multiplier: 2.0,
        jitter: 0.2,
        max_delay: Duration::from_millis(10),
    }
}

/// A gateway over single-endpoint mocks.
pub fn mock_gateway(
    chain: Arc<MockChain>,
    ledger: Arc<MockLedger>,
    translator: Arc<MockTranslator>,
) -> Gateway {
    Gateway::new(
        Endpoints::new(chain as Arc<dyn ChainClient>),
        Endpoints::new(ledger as Arc<dyn LedgerClient>),
        Endpoints::new(translator as Arc<dyn AddressTranslator>),
    )
    .with_retry_policy(fast_retry())
}

/// Deterministic address derived from a small seed.
pub fn address(seed: u64) -> Address {
    Address::from_word(keccak256(seed.to_be_bytes()))
}

/// Deterministic transaction hash derived from a small seed.
pub fn tx_hash(seed: u64) -> B256 {
    keccak256([b"tx".as_slice(), &seed.to_be_bytes()].concat())
}

/// A transaction body without block placement.
pub fn transaction(
    seed: u64,
    from: Address,
    to: Address,
    value: U256,
    input: Bytes,
) -> ChainTransaction {
    ChainTransaction { hash: tx_hash(seed), block_number: None, from, to: Some(to), value, input }
}
