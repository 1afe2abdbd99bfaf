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

use std::{path::PathBuf, str::FromStr};

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use vote_auditor::{
    chain_data_from_config, report, store::ProcessLock, store::SnapshotStore, AuditReport,
    Auditor, BalanceValidator, BlockLocator, Config, VoteLedger,
};

/// Audits the votes cast during a voting period.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct MainArgs {
    /// Path of the TOML config file.
    #[clap(short, long, env = "VOTE_AUDITOR_CONFIG", default_value = "vote-auditor.toml")]
    config: PathBuf,
    /// Overrides `store.data_dir` from the config file.
    #[clap(long, env = "VOTE_AUDITOR_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
    /// Removes a lock file left behind by a run that did not exit cleanly.
    #[clap(long, default_value_t = false)]
    force_unlock: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scans the period from the last checkpoint and finalizes it if it is over.
    Audit,
    /// Scans the period, then follows new blocks until it ends and finalizes it.
    Monitor,
    /// Finalizes wallet balances at the period end and writes the reports.
    Finalize,
    /// Prints the block range of the period, or the first block at or after `--at`.
    Locate {
        #[clap(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Resolves the balance of an EVM address at a height (the head by default).
    Balance {
        address: Address,
        #[clap(long)]
        height: Option<u64>,
    },
    /// Translates an EVM address to its native account, or a native account to its EVM address.
    Translate { address: String },
    /// Rewrites the reports from the stored ledger.
    Summary,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = MainArgs::parse();

    if args.log_json {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    let mut config = Config::load(&args.config).await.context("failed to load config")?;
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }
    if args.force_unlock {
        let store = SnapshotStore::new(&config.store.data_dir);
        ProcessLock::force_unlock(&store.lock_path())?;
    }

    match args.command {
        Command::Audit => run_auditor(config, false).await,
        Command::Monitor => run_auditor(config, true).await,
        Command::Finalize => {
            let auditor = Auditor::from_config(config).await?;
            let report = auditor.finalize().await?;
            print_report(&report)
        }
        Command::Locate { at } => {
            let data = chain_data_from_config(&config)?;
            let locator = BlockLocator::new(data, config.locator.clone());
            match at {
                Some(at) => {
                    let block = locator.find_block_at_or_after_time(at).await?;
                    println!("{block}");
                }
                None => {
                    let range =
                        locator.locate_period(config.period.start, config.period.end).await?;
                    println!("{}", serde_json::to_string_pretty(&range)?);
                }
            }
            Ok(())
        }
        Command::Balance { address, height } => {
            let data = chain_data_from_config(&config)?;
            let height = match height {
                Some(height) => height,
                None => data.head().await?,
            };
            let validator = BalanceValidator::new(data, config.period.min_balance);
            match validator.try_resolve_balance(address, height).await {
                Some(balance) => {
                    let sufficient = balance >= config.period.min_balance;
                    println!(
                        "{address} at block {height}: {balance} (meets minimum: {sufficient})"
                    );
                    Ok(())
                }
                None => bail!("balance of {address} at block {height} could not be resolved"),
            }
        }
        Command::Translate { address } => {
            let data = chain_data_from_config(&config)?;
            match Address::from_str(&address) {
                Ok(evm) => println!("{}", data.native_address(evm).await?),
                Err(_) => println!("{:#x}", data.evm_address(&address).await?),
            }
            Ok(())
        }
        Command::Summary => {
            let store = SnapshotStore::new(&config.store.data_dir);
            let _lock = ProcessLock::acquire(store.lock_path())?;
            let ledger = VoteLedger::load(&store).await?;
            let summary = report::write_reports(
                &ledger,
                &store,
                config.period.min_balance,
                config.store.report_top_n,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

async fn run_auditor(config: Config, follow: bool) -> Result<()> {
    let auditor = Auditor::from_config(config).await?;

    let cancel = auditor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received ctrl-c, stopping after in-flight work");
            cancel.cancel();
        }
    });

    let result = if follow { auditor.monitor().await } else { auditor.audit().await };
    let report = match result {
        Ok(report) => report,
        Err(err) => bail!("FATAL: audit failed: {err:?}"),
    };
    print_report(&report)
}

fn print_report(report: &AuditReport) -> Result<()> {
    if let Some(range) = report.range {
        tracing::info!(
            "Period blocks {}-{} (complete: {}), scanned {} blocks, {} candidates, {} new votes",
            range.start,
            range.end,
            range.complete,
            report.blocks_scanned,
            report.candidates,
            report.ingested
        );
    }
    if !report.missed_blocks.is_empty() {
        tracing::warn!("Blocks still unscanned: {:?}", report.missed_blocks);
    }
    if report.cancelled {
        tracing::info!("Stopped before completion; rerun to resume from the checkpoint");
    }
    if let Some(finalized) = report.finalized {
        tracing::info!(
            "Finalized {} wallets, {} meet the minimum, {} lookups failed",
            finalized.wallets,
            finalized.valid,
            finalized.failed_lookups
        );
    }
    if let Some(summary) = &report.summary {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }
    Ok(())
}
