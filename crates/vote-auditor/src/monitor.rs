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

//! Following the chain head while the voting period is open.
//!
//! New heads come from a [BlockNotifier]: either head polling or a websocket `newHeads`
//! subscription. Both feed the same scan path, so vote handling does not depend on the
//! transport.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    chain_data::ChainData,
    errors::{impl_coded_debug, CodedError},
    gateway::GatewayError,
    locator::{BlockLocator, LocatorError},
    scanner::{ScanEvent, VoteScanner},
    task::{RestartPolicy, RetryRes, RetryTask, SupervisorErr},
};

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Error)]
pub enum MonitorError {
    #[error("failed to subscribe to new heads: {0}")]
    Connect(String),

    #[error("new head subscription closed")]
    SubscriptionClosed,

    #[error("head lookup failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("period end lookup failed: {0}")]
    Locator(#[from] LocatorError),
}

impl_coded_debug!(MonitorError);

impl CodedError for MonitorError {
    fn code(&self) -> &str {
        match self {
            MonitorError::Connect(_) => "[VA-MON-001]",
            MonitorError::SubscriptionClosed => "[VA-MON-002]",
            MonitorError::Gateway(_) => "[VA-MON-003]",
            MonitorError::Locator(_) => "[VA-MON-004]",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// Subscribe when a websocket endpoint is configured, otherwise poll
    #[default]
    Auto,
    Poll,
    Subscribe,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub mode: NotifierKind,
    pub poll_interval_ms: u64,
    /// Delay before reconnecting after a lost subscription, doubled on each consecutive loss
    pub restart_delay_ms: u64,
    pub max_restart_delay_ms: u64,
    /// Consecutive reconnects before the monitor gives up, unlimited when unset
    pub max_restarts: Option<usize>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mode: NotifierKind::Auto,
            poll_interval_ms: 2_000,
            restart_delay_ms: 1_000,
            max_restart_delay_ms: 60_000,
            max_restarts: None,
        }
    }
}

impl From<&MonitorConfig> for RestartPolicy {
    fn from(config: &MonitorConfig) -> Self {
        RestartPolicy {
            delay: Duration::from_millis(config.restart_delay_ms),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(config.max_restart_delay_ms),
            max_retries: config.max_restarts,
            // Five minutes without a loss resets the backoff.
            reset_after: Some(Duration::from_secs(5 * 60)),
        }
    }
}

/// Source of new chain heads.
#[async_trait]
pub trait BlockNotifier: Send {
    /// Waits for a head height greater than any returned before.
    async fn next_head(&mut self) -> Result<u64, MonitorError>;
}

/// Creates a fresh notifier each time the monitor (re)starts.
#[async_trait]
pub trait NotifierFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BlockNotifier>, MonitorError>;
}

/// Pull based notifier: asks for the head on an interval.
pub struct PollingNotifier {
    data: ChainData,
    interval: Duration,
    last: Option<u64>,
}

impl PollingNotifier {
    pub fn new(data: ChainData, interval: Duration) -> Self {
        Self { data, interval, last: None }
    }
}

#[async_trait]
impl BlockNotifier for PollingNotifier {
    async fn next_head(&mut self) -> Result<u64, MonitorError> {
        loop {
            let head = self.data.head().await?;
            if self.last.map_or(true, |last| head > last) {
                self.last = Some(head);
                return Ok(head);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Push based notifier fed by a `newHeads` subscription.
pub struct SubscriptionNotifier {
    heads: mpsc::Receiver<u64>,
    forwarder: Option<JoinHandle<()>>,
    last: Option<u64>,
}

impl SubscriptionNotifier {
    /// Subscribes to new heads over a websocket connection.
    pub async fn connect(url: Url) -> Result<Self, MonitorError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(url.as_str()))
            .await
            .map_err(|err| MonitorError::Connect(err.to_string()))?;
        let subscription = provider
            .subscribe_blocks()
            .await
            .map_err(|err| MonitorError::Connect(err.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let forwarder = tokio::spawn(async move {
            // Keeps the websocket alive for as long as the stream is read.
            let _provider = provider;
            let mut stream = subscription.into_stream();
            while let Some(header) = stream.next().await {
                if tx.send(header.number).await.is_err() {
                    break;
                }
            }
            tracing::warn!("New head subscription stream ended");
        });
        tracing::info!("Subscribed to new heads at {url}");
        Ok(Self { heads: rx, forwarder: Some(forwarder), last: None })
    }

    /// Wraps an existing stream of head heights.
    pub fn from_receiver(heads: mpsc::Receiver<u64>) -> Self {
        Self { heads, forwarder: None, last: None }
    }
}

impl Drop for SubscriptionNotifier {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[async_trait]
impl BlockNotifier for SubscriptionNotifier {
    async fn next_head(&mut self) -> Result<u64, MonitorError> {
        loop {
            let head = self.heads.recv().await.ok_or(MonitorError::SubscriptionClosed)?;
            if self.last.map_or(true, |last| head > last) {
                self.last = Some(head);
                return Ok(head);
            }
        }
    }
}

/// Builds notifiers from configuration, falling back to polling when a subscription
/// cannot be set up in [NotifierKind::Auto] mode.
pub struct ConfiguredNotifiers {
    data: ChainData,
    config: MonitorConfig,
    ws_url: Option<Url>,
}

impl ConfiguredNotifiers {
    pub fn new(data: ChainData, config: MonitorConfig, ws_url: Option<Url>) -> Self {
        Self { data, config, ws_url }
    }

    fn polling(&self) -> Box<dyn BlockNotifier> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        Box::new(PollingNotifier::new(self.data.clone(), interval))
    }
}

#[async_trait]
impl NotifierFactory for ConfiguredNotifiers {
    async fn connect(&self) -> Result<Box<dyn BlockNotifier>, MonitorError> {
        match (self.config.mode, &self.ws_url) {
            (NotifierKind::Poll, _) | (NotifierKind::Auto, None) => Ok(self.polling()),
            (NotifierKind::Subscribe, None) => {
                Err(MonitorError::Connect("subscribe mode needs endpoints.ws_url".into()))
            }
            (NotifierKind::Subscribe, Some(url)) => {
                Ok(Box::new(SubscriptionNotifier::connect(url.clone()).await?))
            }
            (NotifierKind::Auto, Some(url)) => {
                match SubscriptionNotifier::connect(url.clone()).await {
                    Ok(notifier) => Ok(Box::new(notifier)),
                    Err(err) => {
                        tracing::warn!("Falling back to head polling: {err}");
                        Ok(self.polling())
                    }
                }
            }
        }
    }
}

struct MonitorInner {
    data: ChainData,
    scanner: VoteScanner,
    locator: BlockLocator,
    factory: Arc<dyn NotifierFactory>,
    events: mpsc::Sender<ScanEvent>,
    period_end: DateTime<Utc>,
    cursor: AtomicU64,
    cancel: CancellationToken,
}

/// Scans every new head range until the voting period ends or the monitor is cancelled.
///
/// Restartable under a [crate::task::Supervisor]: the next block to scan survives restarts.
/// Blocks that fail are reported as [ScanEvent::Missed] ahead of the checkpoint passing
/// them; the consumer records them durably and they are rescanned before finalization.
#[derive(Clone)]
pub struct LiveMonitor {
    inner: Arc<MonitorInner>,
}

impl LiveMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: ChainData,
        scanner: VoteScanner,
        locator: BlockLocator,
        factory: Arc<dyn NotifierFactory>,
        events: mpsc::Sender<ScanEvent>,
        start_block: u64,
        period_end: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                data,
                scanner,
                locator,
                factory,
                events,
                period_end,
                cursor: AtomicU64::new(start_block),
                cancel,
            }),
        }
    }

    /// Next block the monitor will scan.
    pub fn cursor(&self) -> u64 {
        self.inner.cursor.load(Ordering::Acquire)
    }
}

impl RetryTask for LiveMonitor {
    fn spawn(&self) -> RetryRes {
        let inner = self.inner.clone();
        Box::pin(async move { inner.run().await })
    }
}

impl MonitorInner {
    async fn run(&self) -> Result<(), SupervisorErr> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let mut notifier =
            self.factory.connect().await.map_err(|err| SupervisorErr::Recover(err.into()))?;
        tracing::info!(
            "Live monitor following the head from block {}",
            self.cursor.load(Ordering::Acquire)
        );

        loop {
            let head = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Live monitor stopped");
                    return Ok(());
                }
                head = notifier.next_head() => {
                    head.map_err(|err| SupervisorErr::Recover(err.into()))?
                }
            };

            let from = self.cursor.load(Ordering::Acquire);
            if head < from {
                continue;
            }
            let (to, period_over) =
                self.bound(head).await.map_err(|err| SupervisorErr::Recover(err.into()))?;

            if to >= from {
                let chunk_size = self.scanner.config().live_chunk_size;
                let outcome = self
                    .scanner
                    .scan(from, to, chunk_size, &self.events, &self.cancel)
                    .await
                    .map_err(|err| SupervisorErr::Fault(err.into()))?;
                let next = if outcome.cancelled {
                    outcome.checkpoint.map_or(from, |height| height + 1)
                } else {
                    to + 1
                };
                self.cursor.fetch_max(next, Ordering::AcqRel);
            }

            if period_over {
                tracing::info!("Voting period ended at block {to}, live monitor done");
                return Ok(());
            }
        }
    }

    /// Last block to scan for `head`, and whether the period is over at that block.
    async fn bound(&self, head: u64) -> Result<(u64, bool), MonitorError> {
        let head_ts = self.data.header(head).await?.timestamp;
        let end_ts = self.period_end.timestamp().max(0) as u64;
        if head_ts < end_ts {
            return Ok((head, false));
        }
        let first_after = self.locator.find_block_at_or_after(end_ts).await?;
        Ok((first_after.saturating_sub(1), true))
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Bytes, FixedBytes, U256};
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::{
        cache::CacheSet,
        locator::LocatorConfig,
        scanner::{ScanConfig, VoteContracts},
        task::Supervisor,
        test_utils::{address, mock_gateway, transaction, MockChain, MockLedger, MockTranslator},
    };

    struct ChannelNotifiers {
        heads: AsyncMutex<Option<mpsc::Receiver<u64>>>,
    }

    #[async_trait]
    impl NotifierFactory for ChannelNotifiers {
        async fn connect(&self) -> Result<Box<dyn BlockNotifier>, MonitorError> {
            let heads = self.heads.lock().await.take().ok_or(MonitorError::SubscriptionClosed)?;
            Ok(Box::new(SubscriptionNotifier::from_receiver(heads)))
        }
    }

    fn contracts() -> VoteContracts {
        VoteContracts {
            proxy: address(100),
            implementation: address(101),
            vote_selector: FixedBytes::from([1, 2, 3, 4]),
        }
    }

    fn data(chain: Arc<MockChain>) -> ChainData {
        let gateway = mock_gateway(
            chain,
            Arc::new(MockLedger::default()),
            Arc::new(MockTranslator::default()),
        );
        ChainData::new(Arc::new(gateway), Arc::new(CacheSet::default()))
    }

    fn monitor(
        chain: Arc<MockChain>,
        factory: Arc<dyn NotifierFactory>,
        events: mpsc::Sender<ScanEvent>,
        start: u64,
        period_end: u64,
        cancel: CancellationToken,
    ) -> LiveMonitor {
        let data = data(chain);
        let scanner = VoteScanner::new(
            data.clone(),
            contracts(),
            ScanConfig { live_chunk_size: 5, group_delay_ms: 0, ..ScanConfig::default() },
        );
        let locator = BlockLocator::new(data.clone(), LocatorConfig::default());
        LiveMonitor::new(
            data,
            scanner,
            locator,
            factory,
            events,
            start,
            DateTime::from_timestamp(period_end as i64, 0).unwrap(),
            cancel,
        )
    }

    #[tokio::test]
    async fn polling_reports_only_new_heads() {
        let chain = Arc::new(MockChain::with_blocks(10, 1_000, 1));
        let mut notifier = PollingNotifier::new(data(chain.clone()), Duration::from_millis(5));
        assert_eq!(notifier.next_head().await.unwrap(), 9);

        let advance = {
            let chain = chain.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                chain.advance_head(12, 1);
            })
        };
        assert_eq!(notifier.next_head().await.unwrap(), 12);
        advance.await.unwrap();
    }

    #[tokio::test]
    async fn subscription_skips_stale_heads_and_reports_close() {
        let (tx, rx) = mpsc::channel(8);
        let mut notifier = SubscriptionNotifier::from_receiver(rx);
        for head in [5, 4, 5, 7] {
            tx.send(head).await.unwrap();
        }
        drop(tx);
        assert_eq!(notifier.next_head().await.unwrap(), 5);
        assert_eq!(notifier.next_head().await.unwrap(), 7);
        assert!(matches!(notifier.next_head().await, Err(MonitorError::SubscriptionClosed)));
    }

    #[tokio::test]
    async fn scans_new_heads_until_period_end() {
        let chain = Arc::new(MockChain::with_blocks(20, 1_000, 1));
        let proxy = contracts().proxy;
        let early = chain.add_transaction(
            12,
            transaction(1, address(1), proxy, U256::from(5), Bytes::new()),
            true,
            vec![],
        );
        chain.advance_head(40, 1);
        let late = chain.add_transaction(
            35,
            transaction(2, address(2), proxy, U256::from(5), Bytes::new()),
            true,
            vec![],
        );
        chain.add_transaction(
            31,
            transaction(3, address(3), proxy, U256::from(5), Bytes::new()),
            true,
            vec![],
        );

        chain.fail_block(14);

        let (head_tx, head_rx) = mpsc::channel(8);
        let factory = Arc::new(ChannelNotifiers { heads: AsyncMutex::new(Some(head_rx)) });
        let (events_tx, mut events_rx) = mpsc::channel(64);
        // Period ends at timestamp 1_031: block 30 is the last one inside it.
        let live = monitor(chain, factory, events_tx, 10, 1_031, CancellationToken::new());

        head_tx.send(19).await.unwrap();
        head_tx.send(40).await.unwrap();
        live.inner.run().await.unwrap();
        assert_eq!(live.cursor(), 31);
        drop(live);

        let mut votes = Vec::new();
        let mut missed = Vec::new();
        let mut checkpoints = Vec::new();
        while let Some(event) = events_rx.recv().await {
            match event {
                ScanEvent::Candidate(candidate) => votes.push(candidate.tx_hash),
                ScanEvent::Missed(blocks) => missed.extend(blocks),
                ScanEvent::Checkpoint(height) => {
                    if height >= 14 {
                        assert_eq!(missed, vec![14], "checkpoint {height} passed block 14");
                    }
                    checkpoints.push(height);
                }
            }
        }
        assert_eq!(votes, vec![early]);
        assert_eq!(missed, vec![14]);
        assert!(!votes.contains(&late));
        assert_eq!(checkpoints.last(), Some(&30));
        assert!(checkpoints.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn supervisor_restarts_after_subscription_loss() {
        let chain = Arc::new(MockChain::with_blocks(50, 1_000, 1));
        let (head_tx, head_rx) = mpsc::channel(8);
        let factory = Arc::new(ChannelNotifiers { heads: AsyncMutex::new(Some(head_rx)) });
        let (events_tx, _events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let live = monitor(chain, factory.clone(), events_tx, 0, 2_000, cancel.clone());

        head_tx.send(10).await.unwrap();
        drop(head_tx);

        // The first run consumes the channel and fails when it closes; the restart gets a
        // fresh channel and is then cancelled.
        let (replacement_tx, replacement_rx) = mpsc::channel(8);
        let supervisor = tokio::spawn(
            Supervisor::new("live monitor", Arc::new(live.clone()))
                .with_cancel(cancel.clone())
                .with_restart_policy(RestartPolicy {
                    delay: Duration::from_millis(100),
                    backoff_multiplier: 1.0,
                    max_delay: Duration::from_millis(100),
                    max_retries: Some(2),
                    reset_after: None,
                })
                .spawn(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        *factory.heads.lock().await = Some(replacement_rx);
        replacement_tx.send(20).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        assert_eq!(supervisor.await.unwrap().unwrap(), 1);
        assert_eq!(live.cursor(), 21);
    }
}
