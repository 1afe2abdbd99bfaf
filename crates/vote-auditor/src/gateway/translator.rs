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

use std::{str::FromStr, time::Duration};

use alloy::primitives::Address;
use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use url::Url;

use super::{AddressTranslator, Source, SourceError};

pub const DEFAULT_FORWARD_METHOD: &str = "sei_getSeiAddress";
pub const DEFAULT_REVERSE_METHOD: &str = "sei_getEVMAddress";

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

/// Address translation over JSON-RPC.
///
/// Both directions are answered by the node; a JSON-RPC error object or a null result
/// means the address is not associated with a counterpart.
#[derive(Clone)]
pub struct JsonRpcTranslator {
    client: Client,
    url: Url,
    forward_method: String,
    reverse_method: String,
    timeout: Duration,
}

impl JsonRpcTranslator {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SourceError::from_reqwest(err, timeout))?;
        Ok(Self {
            client,
            url,
            forward_method: DEFAULT_FORWARD_METHOD.to_string(),
            reverse_method: DEFAULT_REVERSE_METHOD.to_string(),
            timeout,
        })
    }

    pub fn with_methods(mut self, forward: impl Into<String>, reverse: impl Into<String>) -> Self {
        self.forward_method = forward.into();
        self.reverse_method = reverse.into();
        self
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        param: String,
    ) -> Result<T, SourceError> {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": [param] });
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| SourceError::from_reqwest(err, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus(status.as_u16()));
        }

        let text =
            response.text().await.map_err(|err| SourceError::from_reqwest(err, self.timeout))?;
        let parsed: RpcResponse<T> = serde_json::from_str(&text).map_err(|err| {
            let payload: String = text.chars().take(256).collect();
            SourceError::Decode(format!("{err}; payload: {payload}"))
        })?;

        if let Some(error) = parsed.error {
            tracing::debug!("{method}({param}) returned error {}: {}", error.code, error.message);
            return Err(SourceError::NotFound(format!("{method}({param}): {}", error.message)));
        }
        parsed.result.ok_or_else(|| SourceError::NotFound(format!("{method}({param})")))
    }
}

impl Source for JsonRpcTranslator {
    fn name(&self) -> String {
        self.url.to_string()
    }
}

#[async_trait]
impl AddressTranslator for JsonRpcTranslator {
    async fn to_native(&self, address: Address) -> Result<String, SourceError> {
        let native: String =
            self.request(&self.forward_method, format!("{address:#x}")).await?;
        Ok(native.trim().to_lowercase())
    }

    async fn to_evm(&self, account: &str) -> Result<Address, SourceError> {
        let evm: String = self.request(&self.reverse_method, account.to_string()).await?;
        Address::from_str(evm.trim())
            .map_err(|err| SourceError::Decode(format!("invalid evm address {evm:?}: {err}")))
    }
}
