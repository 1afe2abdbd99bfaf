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

use std::time::Duration;

use alloy::primitives::U256;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::{LedgerClient, Source, SourceError};
use crate::amount::Amount;

/// Header selecting the historical height of a bank module query.
pub const BLOCK_HEIGHT_HEADER: &str = "x-cosmos-block-height";

#[derive(Deserialize)]
struct Coin {
    #[allow(dead_code)]
    denom: String,
    amount: String,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: Option<Coin>,
}

/// Bank module REST client answering `balance(account, height)` for one denom.
#[derive(Clone)]
pub struct HttpLedgerClient {
    client: Client,
    api_url: Url,
    denom: String,
    decimals: u8,
    timeout: Duration,
}

impl HttpLedgerClient {
    pub fn new(
        api_url: Url,
        denom: impl Into<String>,
        decimals: u8,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SourceError::from_reqwest(err, timeout))?;
        Ok(Self { client, api_url, denom: denom.into(), decimals, timeout })
    }
}

impl Source for HttpLedgerClient {
    fn name(&self) -> String {
        self.api_url.to_string()
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn balance(&self, account: &str, height: u64) -> Result<Amount, SourceError> {
        let mut url = self.api_url.clone();
        url.set_path(&format!("/cosmos/bank/v1beta1/balances/{account}/by_denom"));
        url.query_pairs_mut().append_pair("denom", &self.denom);

        tracing::debug!(%url, height, "querying ledger balance");

        let response = self
            .client
            .get(url)
            .header(BLOCK_HEIGHT_HEADER, height.to_string())
            .send()
            .await
            .map_err(|err| SourceError::from_reqwest(err, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus(status.as_u16()));
        }

        let body =
            response.text().await.map_err(|err| SourceError::from_reqwest(err, self.timeout))?;
        let parsed: BalanceResponse = serde_json::from_str(&body).map_err(|err| {
            let payload: String = body.chars().take(256).collect();
            SourceError::Decode(format!("{err}; payload: {payload}"))
        })?;

        // No balance entry means the account holds none of the denom.
        let Some(coin) = parsed.balance else {
            return Ok(Amount::ZERO);
        };
        let raw = U256::from_str_radix(coin.amount.trim(), 10)
            .map_err(|_| SourceError::Decode(format!("invalid amount {:?}", coin.amount)))?;
        Ok(Amount::from_base_units(raw, self.decimals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const ACCOUNT: &str = "sei1qy352eufqy352eufqy352eufqy352eufhq3rdm";

    fn client(server: &MockServer) -> HttpLedgerClient {
        HttpLedgerClient::new(
            server.base_url().parse().unwrap(),
            "usei",
            6,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn queries_with_height_header() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path(format!("/cosmos/bank/v1beta1/balances/{ACCOUNT}/by_denom"))
                .query_param("denom", "usei")
                .header(BLOCK_HEIGHT_HEADER, "1000");
            then.status(200).header("content-type", "application/json").json_body(
                serde_json::json!({ "balance": { "denom": "usei", "amount": "150000000" } }),
            );
        });

        let amount = client(&server).balance(ACCOUNT, 1000).await.unwrap();
        mock.assert();
        assert_eq!(amount, Amount::from_whole(150));
    }

    #[tokio::test]
    async fn missing_entry_is_zero() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET);
            then.status(200).json_body(serde_json::json!({ "balance": null }));
        });

        let amount = client(&server).balance(ACCOUNT, 5).await.unwrap();
        assert_eq!(amount, Amount::ZERO);
    }

    #[tokio::test]
    async fn classifies_failures() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).header(BLOCK_HEIGHT_HEADER, "7");
            then.status(503);
        });
        server.mock(|when, then| {
            when.method(GET).header(BLOCK_HEIGHT_HEADER, "8");
            then.status(200).body("<html>gateway</html>");
        });

        let ledger = client(&server);
        assert_eq!(ledger.balance(ACCOUNT, 7).await.unwrap_err(), SourceError::HttpStatus(503));
        let err = ledger.balance(ACCOUNT, 8).await.unwrap_err();
        assert_eq!(err.reason(), "decode-error");
    }
}
