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

//! Pipeline orchestration: locate the period, backfill from the checkpoint, follow the head
//! while the period is open and finalize once it is over.
//!
//! The scanner (or the live monitor) is the only producer of [ScanEvent]s and
//! [Auditor::consume] is the only consumer. A chunk's checkpoint is recorded after its
//! candidates are ingested and its failed blocks are noted, and persisted after the ledger
//! flush that covers it. Failed blocks travel in the same checkpoint record as the height,
//! so a resumed run always knows which blocks below its checkpoint still need a rescan.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    cache::{resident_memory_bytes, CacheSet, MemoryGuard},
    chain_data::ChainData,
    checkpoint::CheckpointController,
    config::Config,
    errors::{impl_coded_debug, CodedError},
    gateway::{
        AddressTranslator, ChainClient, Endpoints, Gateway, HttpLedgerClient, JsonRpcTranslator,
        LedgerClient, RetryPolicy, RpcChainClient, SourceError,
    },
    ledger::{LedgerError, VoteLedger},
    locator::{BlockLocator, BlockRange, LocatorError},
    monitor::{ConfiguredNotifiers, LiveMonitor, NotifierFactory},
    report::{self, ReportError, Summary},
    scanner::{ScanError, ScanEvent, VoteScanner},
    store::{ProcessLock, SnapshotStore, StoreError},
    task::Supervisor,
    validator::{BalanceValidator, FinalizeSummary},
};

#[derive(Error)]
pub enum AuditorErr {
    #[error("failed to build client: {0}")]
    Client(#[from] SourceError),

    #[error("block lookup failed: {0:?}")]
    Locator(#[from] LocatorError),

    #[error("scan failed: {0:?}")]
    Scan(#[from] ScanError),

    #[error("ledger failure: {0:?}")]
    Ledger(#[from] LedgerError),

    #[error("store failure: {0:?}")]
    Store(#[from] StoreError),

    #[error("report failure: {0}")]
    Report(#[from] ReportError),

    #[error("live monitor failed: {0:?}")]
    Monitor(anyhow::Error),

    #[error("voting period is still open at head {head}")]
    PeriodOpen { head: u64 },
}

impl_coded_debug!(AuditorErr);

impl CodedError for AuditorErr {
    fn code(&self) -> &str {
        match self {
            AuditorErr::Client(_) => "[VA-AUD-001]",
            AuditorErr::Locator(_) => "[VA-AUD-002]",
            AuditorErr::Scan(_) => "[VA-AUD-003]",
            AuditorErr::Ledger(_) => "[VA-AUD-004]",
            AuditorErr::Store(_) => "[VA-AUD-005]",
            AuditorErr::Report(_) => "[VA-AUD-006]",
            AuditorErr::Monitor(_) => "[VA-AUD-007]",
            AuditorErr::PeriodOpen { .. } => "[VA-AUD-008]",
        }
    }
}

/// Builds the gateway from the configured endpoints, with fallbacks where configured.
pub fn gateway_from_config(config: &Config) -> Result<Gateway, AuditorErr> {
    let endpoints = &config.endpoints;
    let timeouts = &config.timeouts;

    let rpc = |url: &url::Url| -> Arc<dyn ChainClient> {
        Arc::new(RpcChainClient::http(url.clone()).with_balance_decimals(endpoints.evm_decimals))
    };
    let chain = Endpoints::new(rpc(&endpoints.rpc_url))
        .with_optional_secondary(endpoints.rpc_fallback_url.as_ref().map(rpc));

    let balance_timeout = Duration::from_secs(timeouts.balance_secs);
    let bank = |url: &url::Url| -> Result<Arc<dyn LedgerClient>, SourceError> {
        Ok(Arc::new(HttpLedgerClient::new(
            url.clone(),
            endpoints.denom.clone(),
            endpoints.ledger_decimals,
            balance_timeout,
        )?))
    };
    let ledger = Endpoints::new(bank(&endpoints.ledger_url)?).with_optional_secondary(
        endpoints.ledger_fallback_url.as_ref().map(bank).transpose()?,
    );

    let translate_timeout = Duration::from_secs(timeouts.translate_secs);
    let translator_at = |url: &url::Url| -> Result<Arc<dyn AddressTranslator>, SourceError> {
        Ok(Arc::new(
            JsonRpcTranslator::new(url.clone(), translate_timeout)?
                .with_methods(endpoints.forward_method.clone(), endpoints.reverse_method.clone()),
        ))
    };
    let translator = Endpoints::new(translator_at(&endpoints.translator_url)?)
        .with_optional_secondary(
            endpoints.translator_fallback_url.as_ref().map(translator_at).transpose()?,
        );

    Ok(Gateway::new(chain, ledger, translator)
        .with_retry_policy(RetryPolicy::from(&config.retry))
        .with_timeouts(timeouts.into()))
}

/// Gateway plus the caches configured for it.
pub fn chain_data_from_config(config: &Config) -> Result<ChainData, AuditorErr> {
    let gateway = gateway_from_config(config)?;
    Ok(ChainData::new(Arc::new(gateway), Arc::new(CacheSet::new(&config.cache))))
}

/// Outcome of one [Auditor] run.
#[derive(Clone, Debug, Default)]
pub struct AuditReport {
    pub range: Option<BlockRange>,
    /// First block scanned by this run
    pub resumed_from: Option<u64>,
    pub blocks_scanned: u64,
    pub candidates: usize,
    /// Votes that were new to the ledger
    pub ingested: usize,
    /// Blocks that could not be scanned, kept in the checkpoint for the next run
    pub missed_blocks: Vec<u64>,
    pub cancelled: bool,
    pub finalized: Option<FinalizeSummary>,
    pub summary: Option<Summary>,
}

#[derive(Clone, Copy, Debug, Default)]
struct ConsumeStats {
    candidates: usize,
    ingested: usize,
}

pub struct Auditor {
    config: Config,
    data: ChainData,
    store: SnapshotStore,
    ledger: Arc<VoteLedger>,
    checkpoint: Arc<CheckpointController>,
    scanner: VoteScanner,
    validator: BalanceValidator,
    locator: BlockLocator,
    notifiers: Arc<dyn NotifierFactory>,
    cancel: CancellationToken,
    _lock: ProcessLock,
}

impl Auditor {
    /// Opens the data directory, takes the process lock and loads the ledger and checkpoint.
    pub async fn open(config: Config, data: ChainData) -> Result<Self, AuditorErr> {
        let store = SnapshotStore::new(&config.store.data_dir);
        store.ensure_dir().await?;
        let lock = ProcessLock::acquire(store.lock_path())?;

        let ledger = Arc::new(VoteLedger::load(&store).await?);
        let checkpoint = Arc::new(
            CheckpointController::load(
                store.clone(),
                Duration::from_secs(config.store.checkpoint_interval_secs),
            )
            .await?,
        );
        let scanner = VoteScanner::new(data.clone(), config.contracts.clone(), config.scan.clone());
        let validator = BalanceValidator::new(data.clone(), config.period.min_balance)
            .with_concurrency(config.validation.finalize_concurrency);
        let locator = BlockLocator::new(data.clone(), config.locator.clone());
        let notifiers = Arc::new(ConfiguredNotifiers::new(
            data.clone(),
            config.monitor.clone(),
            config.endpoints.ws_url.clone(),
        ));

        Ok(Self {
            config,
            data,
            store,
            ledger,
            checkpoint,
            scanner,
            validator,
            locator,
            notifiers,
            cancel: CancellationToken::new(),
            _lock: lock,
        })
    }

    /// [Auditor::open] over clients built from `config`.
    pub async fn from_config(config: Config) -> Result<Self, AuditorErr> {
        let data = chain_data_from_config(&config)?;
        Self::open(config, data).await
    }

    pub fn with_notifiers(mut self, notifiers: Arc<dyn NotifierFactory>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn ledger(&self) -> &VoteLedger {
        &self.ledger
    }

    pub fn checkpoint(&self) -> &CheckpointController {
        &self.checkpoint
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops scheduling new chunks. In-flight work drains and the state is saved.
    pub fn stop(&self) {
        tracing::info!("Stop requested, draining in-flight work");
        self.cancel.cancel();
    }

    pub async fn locate_period(&self) -> Result<BlockRange, AuditorErr> {
        let period = &self.config.period;
        Ok(self.locator.locate_period(period.start, period.end).await?)
    }

    /// Backfills the period from the checkpoint and finalizes it if the period is over.
    pub async fn audit(&self) -> Result<AuditReport, AuditorErr> {
        let mut report = AuditReport::default();
        if self.config.period.start > Utc::now() {
            tracing::info!(
                "Voting period starts at {}, nothing to audit yet",
                self.config.period.start
            );
            return Ok(report);
        }
        let range = self.locate_period().await?;
        report.range = Some(range);

        let _housekeeping = self.spawn_housekeeping();
        self.backfill(range, &mut report).await?;
        if report.cancelled {
            return Ok(report);
        }

        if range.complete {
            self.finalize_range(range, &mut report).await?;
        } else {
            tracing::info!(
                "Voting period is open, scanned up to head {}; use monitor to follow it",
                range.end
            );
        }
        Ok(report)
    }

    /// Backfills, then follows new heads until the period ends and finalizes it.
    pub async fn monitor(&self) -> Result<AuditReport, AuditorErr> {
        let mut report = AuditReport::default();
        if !self.wait_for_period_start().await {
            report.cancelled = true;
            return Ok(report);
        }
        let range = self.locate_period().await?;
        report.range = Some(range);

        let _housekeeping = self.spawn_housekeeping();
        self.backfill(range, &mut report).await?;
        if report.cancelled {
            return Ok(report);
        }
        if range.complete {
            self.finalize_range(range, &mut report).await?;
            return Ok(report);
        }

        let live_from = self.checkpoint.recorded().map_or(range.start, |height| height + 1);
        let live_from = live_from.max(range.start);
        let (result, stats) = self
            .run_pipeline(|events| {
                let monitor = LiveMonitor::new(
                    self.data.clone(),
                    self.scanner.clone(),
                    self.locator.clone(),
                    self.notifiers.clone(),
                    events,
                    live_from,
                    self.config.period.end,
                    self.cancel.clone(),
                );
                Supervisor::new("live monitor", Arc::new(monitor))
                    .with_restart_policy((&self.config.monitor).into())
                    .with_cancel(self.cancel.clone())
                    .spawn()
            })
            .await?;
        report.candidates += stats.candidates;
        report.ingested += stats.ingested;
        let restarts = result.map_err(AuditorErr::Monitor)?;
        if restarts > 0 {
            tracing::info!("Live monitor reconnected {restarts} times");
        }

        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        let range = self.locate_period().await?;
        report.range = Some(range);
        if range.complete {
            self.finalize_range(range, &mut report).await?;
        }
        Ok(report)
    }

    /// Finalizes a period that is already over, without scanning.
    pub async fn finalize(&self) -> Result<AuditReport, AuditorErr> {
        let range = self.locate_period().await?;
        if !range.complete {
            return Err(AuditorErr::PeriodOpen { head: range.end });
        }
        let mut report = AuditReport { range: Some(range), ..Default::default() };
        self.finalize_range(range, &mut report).await?;
        Ok(report)
    }

    /// Writes the vote, wallet and summary reports from the current ledger.
    pub async fn write_reports(&self) -> Result<Summary, AuditorErr> {
        Ok(report::write_reports(
            &self.ledger,
            &self.store,
            self.config.period.min_balance,
            self.config.store.report_top_n,
        )
        .await?)
    }

    async fn wait_for_period_start(&self) -> bool {
        let start = self.config.period.start;
        let Ok(wait) = (start - Utc::now()).to_std() else {
            return true;
        };
        tracing::info!("Waiting {wait:?} for the voting period to start at {start}");
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    async fn backfill(
        &self,
        range: BlockRange,
        report: &mut AuditReport,
    ) -> Result<(), AuditorErr> {
        let from = self.checkpoint.resume_from(range.start);
        if from <= range.end {
            report.resumed_from = Some(from);
            let chunk_size = self.config.scan.backfill_chunk_size;
            let (outcome, stats) = self
                .run_pipeline(|events| async move {
                    self.scanner.scan(from, range.end, chunk_size, &events, &self.cancel).await
                })
                .await?;
            let outcome = outcome?;
            report.blocks_scanned += outcome.blocks_scanned;
            report.candidates += stats.candidates;
            report.ingested += stats.ingested;
            report.cancelled = outcome.cancelled;
        } else {
            tracing::info!("Checkpoint covers blocks up to {}, nothing to backfill", range.end);
        }

        // A complete period rescans in finalize_range instead.
        if !report.cancelled && !range.complete {
            self.rescan_missed(report).await?;
        }
        report.missed_blocks = self.checkpoint.missed_blocks();
        Ok(())
    }

    /// Rescans every recorded missed block once. Blocks that scan cleanly are dropped from
    /// the checkpoint only after the votes found in them are flushed.
    async fn rescan_missed(&self, report: &mut AuditReport) -> Result<(), AuditorErr> {
        let blocks = self.checkpoint.missed_blocks();
        if blocks.is_empty() {
            return Ok(());
        }
        tracing::info!("Rescanning {} blocks that failed earlier", blocks.len());
        let (candidates, still_failed) = self.scanner.rescan_blocks(&blocks).await;
        for candidate in &candidates {
            report.candidates += 1;
            if self.validator.ingest(&self.ledger, candidate).await? {
                report.ingested += 1;
            }
        }
        self.ledger.flush(&self.store).await?;

        let recovered: Vec<u64> =
            blocks.into_iter().filter(|block| !still_failed.contains(block)).collect();
        self.checkpoint.clear_missed(&recovered);
        self.checkpoint.persist().await?;
        if !still_failed.is_empty() {
            tracing::error!(
                "{} blocks still cannot be scanned and are kept for the next run: {:?}",
                still_failed.len(),
                still_failed
            );
        }
        Ok(())
    }

    async fn finalize_range(
        &self,
        range: BlockRange,
        report: &mut AuditReport,
    ) -> Result<(), AuditorErr> {
        self.rescan_missed(report).await?;
        report.missed_blocks = self.checkpoint.missed_blocks();
        if !report.missed_blocks.is_empty() {
            tracing::warn!(
                "Finalizing with {} unscanned blocks: {:?}",
                report.missed_blocks.len(),
                report.missed_blocks
            );
        }
        let revalidated = self.validator.revalidate_pending(&self.ledger).await?;
        if revalidated > 0 {
            tracing::info!("Revalidated {revalidated} pending votes before finalization");
        }
        let finalized = self.validator.finalize_wallets(&self.ledger, range.end).await?;
        self.ledger.flush(&self.store).await?;
        self.checkpoint.persist().await?;
        report.finalized = Some(finalized);
        report.summary = Some(self.write_reports().await?);
        Ok(())
    }

    /// Runs `produce` against the single event consumer until the producer drops its sender.
    async fn run_pipeline<F, Fut>(
        &self,
        produce: F,
    ) -> Result<(Fut::Output, ConsumeStats), AuditorErr>
    where
        F: FnOnce(mpsc::Sender<ScanEvent>) -> Fut,
        Fut: Future,
    {
        let (events_tx, events_rx) = mpsc::channel(self.config.scan.channel_capacity.max(1));
        let (produced, consumed) = tokio::join!(produce(events_tx), self.consume(events_rx));
        Ok((produced, consumed?))
    }

    async fn consume(
        &self,
        mut events: mpsc::Receiver<ScanEvent>,
    ) -> Result<ConsumeStats, AuditorErr> {
        let mut stats = ConsumeStats::default();
        let mut flush = tokio::time::interval(Duration::from_secs(
            self.config.store.flush_interval_secs.max(1),
        ));
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ScanEvent::Candidate(candidate)) => {
                        stats.candidates += 1;
                        if self.validator.ingest(&self.ledger, &candidate).await? {
                            stats.ingested += 1;
                        }
                    }
                    Some(ScanEvent::Missed(blocks)) => {
                        self.checkpoint.record_missed(&blocks);
                    }
                    Some(ScanEvent::Checkpoint(height)) => {
                        self.checkpoint.record(height);
                    }
                    None => break,
                },
                _ = flush.tick() => self.save(false).await?,
            }
        }
        self.save(true).await?;
        Ok(stats)
    }

    /// Flushes the ledger, then persists the checkpoint it covers.
    async fn save(&self, force: bool) -> Result<(), AuditorErr> {
        let flushed = self.ledger.flush(&self.store).await?;
        if flushed.votes_written.is_some() || flushed.wallets_written.is_some() {
            tracing::debug!("Ledger flushed: {flushed:?}");
        }
        if force {
            self.checkpoint.persist().await?;
        } else {
            self.checkpoint.persist_if_due().await?;
        }
        Ok(())
    }

    /// Memory guard and progress logging, stopped when the guard is dropped.
    fn spawn_housekeeping(&self) -> DropGuard {
        let token = self.cancel.child_token();
        let stop = token.clone();
        let caches = self.data.caches().clone();
        let ledger = self.ledger.clone();
        let checkpoint = self.checkpoint.clone();
        let guard = MemoryGuard::new(self.config.cache.memory.clone());
        let memory_every = Duration::from_secs(self.config.cache.memory.interval_secs.max(1));
        let progress_every = Duration::from_secs(self.config.store.progress_interval_secs.max(1));

        tokio::spawn(async move {
            let mut memory = tokio::time::interval(memory_every);
            let mut progress = tokio::time::interval(progress_every);
            memory.set_missed_tick_behavior(MissedTickBehavior::Skip);
            progress.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = memory.tick() => {
                        if let Some(bytes) = resident_memory_bytes() {
                            guard.evaluate(bytes, &caches);
                        }
                    }
                    _ = progress.tick() => log_progress(&ledger, &checkpoint, &caches),
                }
            }
        });
        token.drop_guard()
    }
}

fn log_progress(ledger: &VoteLedger, checkpoint: &CheckpointController, caches: &CacheSet) {
    let stats = match ledger.stats() {
        Ok(stats) => stats,
        Err(err) => {
            tracing::warn!("Progress unavailable: {err:?}");
            return;
        }
    };
    let (hits, misses) = caches
        .stats()
        .iter()
        .fold((0, 0), |(hits, misses), (_, s)| (hits + s.hits, misses + s.misses));
    tracing::info!(
        "Progress: {} votes ({} pending), {} wallets, checkpoint {:?} (durable {:?}), \
            cache hits {hits}/{}",
        stats.votes,
        stats.pending_votes,
        stats.wallets,
        checkpoint.recorded(),
        checkpoint.durable(),
        hits + misses
    );
}
