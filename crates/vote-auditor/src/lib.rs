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

//! Audits a token-weighted vote: finds every vote sent to the voting proxy during a period
//! and checks that each voter held the minimum balance when voting and at the period end.

pub mod amount;
pub mod auditor;
pub mod cache;
pub mod chain_data;
pub mod checkpoint;
pub mod config;
pub(crate) mod errors;
pub mod gateway;
pub mod ledger;
pub mod locator;
pub mod monitor;
pub mod report;
pub mod scanner;
pub mod store;
pub mod task;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod validator;

pub use amount::Amount;
pub use auditor::{chain_data_from_config, gateway_from_config, AuditReport, Auditor, AuditorErr};
pub use chain_data::ChainData;
pub use config::Config;
pub use errors::CodedError;
pub use ledger::{VoteLedger, VoteRecord, WalletRecord};
pub use locator::{BlockLocator, BlockRange};
pub use scanner::{VoteCandidate, VoteScanner};
pub use validator::BalanceValidator;
