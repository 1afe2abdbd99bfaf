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

use std::{sync::Arc, time::Instant};

use alloy::primitives::{Address, B256};

use crate::{
    amount::Amount,
    cache::CacheSet,
    gateway::{
        BlockHeader, ChainBlock, ChainReceipt, ChainTransaction, Gateway, GatewayError,
    },
};

/// Chain lookups funneled through the per-kind caches before reaching the gateway.
///
/// Only successful lookups are cached. A failure or a not-found answer always reaches the
/// gateway again on the next call.
#[derive(Clone)]
pub struct ChainData {
    gateway: Arc<Gateway>,
    caches: Arc<CacheSet>,
}

impl ChainData {
    pub fn new(gateway: Arc<Gateway>, caches: Arc<CacheSet>) -> Self {
        Self { gateway, caches }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn caches(&self) -> &Arc<CacheSet> {
        &self.caches
    }

    /// Current head height. Never cached.
    pub async fn head(&self) -> Result<u64, GatewayError> {
        self.gateway.head().await
    }

    pub async fn header(&self, number: u64) -> Result<BlockHeader, GatewayError> {
        if let Some(header) = self.caches.headers.get(&number) {
            return Ok(header);
        }
        let header = self.gateway.fetch_header(number).await?;
        self.caches.headers.put(number, header);
        Ok(header)
    }

    pub async fn block(&self, number: u64) -> Result<ChainBlock, GatewayError> {
        if let Some(block) = self.caches.blocks.get(&number) {
            tracing::trace!("Cache hit for block {number}");
            return Ok(block);
        }
        let start = Instant::now();
        let block = self.gateway.fetch_block(number).await?;
        tracing::debug!(
            "Fetched block {number} with {} transactions in {:?}",
            block.transactions.len(),
            start.elapsed()
        );
        self.caches.headers.put(number, block.header());
        for tx in &block.transactions {
            self.caches.transactions.put(tx.hash, tx.clone());
        }
        self.caches.blocks.put(number, block.clone());
        Ok(block)
    }

    pub async fn transaction(&self, hash: B256) -> Result<ChainTransaction, GatewayError> {
        if let Some(tx) = self.caches.transactions.get(&hash) {
            return Ok(tx);
        }
        let tx = self.gateway.fetch_transaction(hash).await?;
        self.caches.transactions.put(hash, tx.clone());
        Ok(tx)
    }

    pub async fn receipt(&self, hash: B256) -> Result<ChainReceipt, GatewayError> {
        if let Some(receipt) = self.caches.receipts.get(&hash) {
            return Ok(receipt);
        }
        let receipt = self.gateway.fetch_receipt(hash).await?;
        self.caches.receipts.put(hash, receipt.clone());
        Ok(receipt)
    }

    /// Account balance through the chain RPC. The result is not cached here; resolved
    /// balances are cached by [ChainData::store_balance] once a source has answered.
    pub async fn account_balance(
        &self,
        account: Address,
        height: u64,
    ) -> Result<Amount, GatewayError> {
        self.gateway.fetch_balance(account, height).await
    }

    /// Bank module balance of a native account.
    pub async fn ledger_balance(&self, account: &str, height: u64) -> Result<Amount, GatewayError> {
        self.gateway.fetch_ledger_balance(account, height).await
    }

    pub fn cached_balance(&self, account: Address, height: u64) -> Option<Amount> {
        self.caches.balances.get(&(account, height))
    }

    pub fn store_balance(&self, account: Address, height: u64, amount: Amount) {
        self.caches.balances.put((account, height), amount);
    }

    /// Native counterpart of an EVM address.
    pub async fn native_address(&self, address: Address) -> Result<String, GatewayError> {
        if let Some(native) = self.caches.addresses.get(&address) {
            return Ok(native);
        }
        let native = self.gateway.translate_address(address).await?;
        self.caches.addresses.put(address, native.clone());
        Ok(native)
    }

    /// EVM counterpart of a native account, through the translator's reverse lookup.
    pub async fn evm_address(&self, account: &str) -> Result<Address, GatewayError> {
        let address = self.gateway.reverse_translate(account).await?;
        self.caches.addresses.put(address, account.to_string());
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{address, mock_gateway, MockChain, MockLedger, MockTranslator};

    fn chain_data(chain: Arc<MockChain>, translator: Arc<MockTranslator>) -> ChainData {
        let gateway = mock_gateway(chain, Arc::new(MockLedger::default()), translator);
        ChainData::new(Arc::new(gateway), Arc::new(CacheSet::default()))
    }

    #[tokio::test]
    async fn headers_are_cached() {
        let chain = Arc::new(MockChain::with_blocks(20, 1_000, 1));
        let data = chain_data(chain.clone(), Arc::new(MockTranslator::default()));

        assert_eq!(data.header(7).await.unwrap().timestamp, 1_007);
        assert_eq!(data.header(7).await.unwrap().timestamp, 1_007);
        assert_eq!(chain.calls(), 1);
    }

    #[tokio::test]
    async fn block_fetch_warms_header_cache() {
        let chain = Arc::new(MockChain::with_blocks(20, 1_000, 1));
        let data = chain_data(chain.clone(), Arc::new(MockTranslator::default()));

        data.block(3).await.unwrap();
        data.header(3).await.unwrap();
        assert_eq!(chain.calls(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let chain = Arc::new(MockChain::with_blocks(20, 1_000, 1));
        let data = chain_data(chain.clone(), Arc::new(MockTranslator::default()));

        chain.fail_always(true);
        assert!(data.header(5).await.is_err());
        chain.fail_always(false);
        assert_eq!(data.header(5).await.unwrap().number, 5);
        assert!(data.header(50).await.unwrap_err().is_not_found());
        assert!(data.caches().headers.get(&50).is_none());
    }

    #[tokio::test]
    async fn translations_are_cached_both_ways() {
        let chain = Arc::new(MockChain::with_blocks(2, 0, 1));
        let translator = Arc::new(MockTranslator::default());
        translator.link(address(1), "sei1voter");
        let data = chain_data(chain, translator.clone());

        assert_eq!(data.native_address(address(1)).await.unwrap(), "sei1voter");
        assert_eq!(data.native_address(address(1)).await.unwrap(), "sei1voter");
        assert_eq!(translator.calls(), 1);

        assert_eq!(data.evm_address("sei1voter").await.unwrap(), address(1));
        assert!(data.native_address(address(2)).await.unwrap_err().is_not_found());
    }
}
