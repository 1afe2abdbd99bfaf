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

use alloy::{
    consensus::Transaction as _,
    eips::{BlockId, BlockNumberOrTag},
    network::{Ethereum, ReceiptResponse, TransactionResponse},
    primitives::{Address, B256},
    providers::{Provider, RootProvider},
    rpc::types::{Transaction, TransactionReceipt},
    transports::{RpcError, TransportErrorKind},
};
use async_trait::async_trait;
use url::Url;

use super::{
    BlockHeader, ChainBlock, ChainClient, ChainReceipt, ChainTransaction, Source, SourceError,
};
use crate::amount::Amount;

/// Decimals of the chain's native token as reported by `eth_getBalance`.
pub const EVM_BALANCE_DECIMALS: u8 = 18;

/// [ChainClient] backed by an alloy JSON-RPC provider.
#[derive(Clone)]
pub struct RpcChainClient<P> {
    provider: P,
    name: String,
    balance_decimals: u8,
}

impl RpcChainClient<RootProvider<Ethereum>> {
    pub fn http(url: Url) -> Self {
        let name = url.to_string();
        Self::new(RootProvider::<Ethereum>::new_http(url), name)
    }
}

impl<P> RpcChainClient<P>
where
    P: Provider<Ethereum> + Clone + 'static,
{
    pub fn new(provider: P, name: String) -> Self {
        Self { provider, name, balance_decimals: EVM_BALANCE_DECIMALS }
    }

    pub fn with_balance_decimals(mut self, decimals: u8) -> Self {
        self.balance_decimals = decimals;
        self
    }
}

fn classify(err: RpcError<TransportErrorKind>) -> SourceError {
    match err {
        RpcError::ErrorResp(payload) => {
            SourceError::Rpc { code: payload.code, message: payload.message.to_string() }
        }
        RpcError::DeserError { err, text } => {
            let text: String = text.chars().take(256).collect();
            SourceError::Decode(format!("{err}; payload: {text}"))
        }
        RpcError::NullResp => SourceError::NoResponse("null response".to_string()),
        RpcError::Transport(TransportErrorKind::HttpError(http)) => {
            SourceError::HttpStatus(http.status)
        }
        other => SourceError::NoResponse(other.to_string()),
    }
}

fn convert_tx(tx: &Transaction) -> ChainTransaction {
    ChainTransaction {
        hash: TransactionResponse::tx_hash(tx),
        block_number: tx.block_number,
        from: TransactionResponse::from(tx),
        to: tx.to(),
        value: tx.value(),
        input: tx.input().clone(),
    }
}

fn convert_receipt(receipt: &TransactionReceipt) -> ChainReceipt {
    ChainReceipt {
        transaction_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
        success: ReceiptResponse::status(receipt),
        log_addresses: receipt.inner.logs().iter().map(|log| log.inner.address).collect(),
    }
}

impl<P> Source for RpcChainClient<P>
where
    P: Provider<Ethereum> + Clone + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }
}

#[async_trait]
impl<P> ChainClient for RpcChainClient<P>
where
    P: Provider<Ethereum> + Clone + 'static,
{
    async fn head(&self) -> Result<u64, SourceError> {
        self.provider.get_block_number().await.map_err(classify)
    }

    async fn header(&self, number: u64) -> Result<Option<BlockHeader>, SourceError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .map_err(classify)?;
        Ok(block.map(|block| BlockHeader {
            number: block.header.number,
            timestamp: block.header.timestamp,
        }))
    }

    async fn block(&self, number: u64) -> Result<Option<ChainBlock>, SourceError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await
            .map_err(classify)?;
        Ok(block.map(|block| ChainBlock {
            number: block.header.number,
            timestamp: block.header.timestamp,
            transactions: block.transactions.txns().map(convert_tx).collect(),
        }))
    }

    async fn transaction(&self, hash: B256) -> Result<Option<ChainTransaction>, SourceError> {
        let tx = self.provider.get_transaction_by_hash(hash).await.map_err(classify)?;
        Ok(tx.as_ref().map(convert_tx))
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ChainReceipt>, SourceError> {
        let receipt = self.provider.get_transaction_receipt(hash).await.map_err(classify)?;
        Ok(receipt.as_ref().map(convert_receipt))
    }

    async fn balance(&self, account: Address, height: u64) -> Result<Amount, SourceError> {
        let raw = self
            .provider
            .get_balance(account)
            .block_id(BlockId::number(height))
            .await
            .map_err(classify)?;
        Ok(Amount::from_base_units(raw, self.balance_decimals))
    }
}
