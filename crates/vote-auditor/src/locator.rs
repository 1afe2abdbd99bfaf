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

//! Maps wall-clock instants to block heights.
//!
//! The search estimates a height from an average block time, brackets the target inside a
//! window around that estimate, then narrows the bracket with a mix of interpolated skips
//! and bisection. The answer is always the first block whose timestamp is at or after the
//! target, since callers use it as an inclusive range start.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    chain_data::ChainData,
    errors::{impl_coded_debug, CodedError},
    gateway::GatewayError,
};

/// Below this many estimated blocks between bracket floor and target, bisect instead of skipping.
const SKIP_MIN_BLOCKS: u64 = 64;

#[derive(Error)]
pub enum LocatorError {
    #[error("block lookup failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("period end {end} is not after its start {start}")]
    InvalidPeriod { start: DateTime<Utc>, end: DateTime<Utc> },
}

impl_coded_debug!(LocatorError);

impl CodedError for LocatorError {
    fn code(&self) -> &str {
        match self {
            LocatorError::Gateway(_) => "[VA-LOC-001]",
            LocatorError::InvalidPeriod { .. } => "[VA-LOC-002]",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Assumed average block interval used for the initial estimate
    pub block_time_ms: u64,
    pub min_window_blocks: u64,
    /// Upper bound on the initial search window around the estimate
    pub max_window_blocks: u64,
    /// Maximum header fetches for one search
    pub max_iterations: u32,
    /// A probe this close to the target ends the coarse search
    pub tolerance_secs: u64,
    /// Maximum stride steps in the final correction scan
    pub max_correction_steps: u32,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            block_time_ms: 400,
            min_window_blocks: 100,
            max_window_blocks: 50_000,
            max_iterations: 96,
            tolerance_secs: 1,
            max_correction_steps: 48,
        }
    }
}

/// Inclusive block range covering a voting period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
    /// False while the period end is still in the future; `end` is then the current head.
    pub complete: bool,
}

/// Header fetches of one search, with the fetch budget and the closest block seen.
struct Probe<'a> {
    data: &'a ChainData,
    target: u64,
    fetches: u32,
    budget: u32,
    // (distance, below target, height)
    closest: Option<(u64, bool, u64)>,
}

impl<'a> Probe<'a> {
    fn new(data: &'a ChainData, target: u64, budget: u32) -> Self {
        Self { data, target, fetches: 0, budget, closest: None }
    }

    fn observe(&mut self, number: u64, timestamp: u64) {
        let key = (timestamp.abs_diff(self.target), timestamp < self.target, number);
        if self.closest.map_or(true, |closest| key < closest) {
            self.closest = Some(key);
        }
    }

    /// Timestamp of `number`, or `None` once the budget is spent.
    async fn timestamp(&mut self, number: u64) -> Result<Option<u64>, LocatorError> {
        if self.fetches >= self.budget {
            return Ok(None);
        }
        self.fetches += 1;
        let timestamp = self.data.header(number).await?.timestamp;
        tracing::trace!("Locator probe {}: block {number} at {timestamp}", self.fetches);
        self.observe(number, timestamp);
        Ok(Some(timestamp))
    }

    fn best(&self, fallback: u64) -> u64 {
        let best = self.closest.map_or(fallback, |(_, _, number)| number);
        tracing::warn!(
            "Locator gave up after {} probes for target {}, using closest block {best}",
            self.fetches,
            self.target
        );
        best
    }
}

enum Bracket {
    Range { lo: u64, lo_ts: u64, hi: u64, hi_ts: u64 },
    Exact(u64),
    Exhausted,
}

#[derive(Clone)]
pub struct BlockLocator {
    data: ChainData,
    config: LocatorConfig,
}

impl BlockLocator {
    pub fn new(data: ChainData, config: LocatorConfig) -> Self {
        Self { data, config }
    }

    pub async fn find_block_at_or_after_time(
        &self,
        target: DateTime<Utc>,
    ) -> Result<u64, LocatorError> {
        self.find_block_at_or_after(target.timestamp().max(0) as u64).await
    }

    /// First block whose timestamp is `>= target` (unix seconds).
    ///
    /// A target after the head's timestamp yields the head. If the probe budget runs out,
    /// for example on non-monotonic timestamps, the closest block seen is returned.
    pub async fn find_block_at_or_after(&self, target: u64) -> Result<u64, LocatorError> {
        let head = self.data.head().await?;
        let head_ts = self.data.header(head).await?.timestamp;
        if target > head_ts {
            tracing::info!("Target {target} is after head {head} ({head_ts}), using head");
            return Ok(head);
        }

        let mut probe = Probe::new(&self.data, target, self.config.max_iterations);
        probe.observe(head, head_ts);

        let gap_blocks =
            (head_ts - target).saturating_mul(1_000) / self.config.block_time_ms.max(1);
        let estimate = head.saturating_sub(gap_blocks);
        let window = (gap_blocks / 10)
            .clamp(self.config.min_window_blocks, self.config.max_window_blocks.max(1));
        tracing::debug!(
            "Locating {target}: head {head} at {head_ts}, estimate {estimate}, window {window}"
        );

        let (mut lo, mut lo_ts, mut hi, mut hi_ts) =
            match self.bracket(&mut probe, estimate, window, head).await? {
                Bracket::Range { lo, lo_ts, hi, hi_ts } => (lo, lo_ts, hi, hi_ts),
                Bracket::Exact(number) => return Ok(number),
                Bracket::Exhausted => return Ok(probe.best(head)),
            };

        let mut last_skip_stalled = false;
        while hi - lo > 1 {
            let span = hi - lo;
            let (mid, skipped) = self.next_probe(lo, lo_ts, hi, hi_ts, target, last_skip_stalled);
            let Some(ts) = probe.timestamp(mid).await? else {
                return Ok(probe.best(hi));
            };
            if ts.abs_diff(target) <= self.config.tolerance_secs {
                return self.correct(&mut probe, mid, ts, head).await;
            }
            if ts >= target {
                (hi, hi_ts) = (mid, ts);
            } else {
                (lo, lo_ts) = (mid, ts);
            }
            last_skip_stalled = skipped && (hi - lo) > span / 2;
        }
        tracing::debug!("Located {target} at block {hi} after {} probes", probe.fetches);
        Ok(hi)
    }

    /// Finds `lo < hi` with `ts(lo) < target <= ts(hi)`, widening the window whenever the
    /// target falls outside it.
    async fn bracket(
        &self,
        probe: &mut Probe<'_>,
        estimate: u64,
        mut window: u64,
        head: u64,
    ) -> Result<Bracket, LocatorError> {
        let target = probe.target;
        let mut lo = estimate.saturating_sub(window);
        let mut hi = estimate.saturating_add(window).min(head);
        let (mut lo_known, mut hi_known) = (None, None);

        loop {
            let lo_ts = match lo_known {
                Some(ts) => ts,
                None => match probe.timestamp(lo).await? {
                    Some(ts) => ts,
                    None => return Ok(Bracket::Exhausted),
                },
            };
            if lo_ts >= target {
                if lo == 0 {
                    return Ok(Bracket::Exact(0));
                }
                window = window.saturating_mul(2);
                (hi, hi_known) = (lo, Some(lo_ts));
                (lo, lo_known) = (lo.saturating_sub(window), None);
                continue;
            }

            let hi_ts = match hi_known {
                Some(ts) => ts,
                None => match probe.timestamp(hi).await? {
                    Some(ts) => ts,
                    None => return Ok(Bracket::Exhausted),
                },
            };
            if hi_ts >= target {
                if hi == lo {
                    return Ok(Bracket::Exact(hi));
                }
                return Ok(Bracket::Range { lo, lo_ts, hi, hi_ts });
            }
            if hi >= head {
                // The head was at or after the target when the search started.
                return Ok(Bracket::Exact(head));
            }
            window = window.saturating_mul(2);
            (lo, lo_known) = (hi, Some(hi_ts));
            (hi, hi_known) = (hi.saturating_add(window).min(head), None);
        }
    }

    /// Next height to probe strictly inside `(lo, hi)`.
    ///
    /// While the target is far from the bracket floor, skip ahead by the time gap divided
    /// by the block time observed across the bracket. Fall back to bisection when the gap
    /// is small or the previous skip failed to halve the bracket.
    fn next_probe(
        &self,
        lo: u64,
        lo_ts: u64,
        hi: u64,
        hi_ts: u64,
        target: u64,
        last_skip_stalled: bool,
    ) -> (u64, bool) {
        let span = hi - lo;
        let time_span = hi_ts.saturating_sub(lo_ts);
        let gap = target.saturating_sub(lo_ts);
        let gap_blocks = gap.saturating_mul(1_000) / self.config.block_time_ms.max(1);
        if !last_skip_stalled && time_span > 0 && gap_blocks > SKIP_MIN_BLOCKS && span > 2 {
            let skip = (gap as u128 * span as u128 / time_span as u128) as u64;
            return (lo.saturating_add(skip).clamp(lo + 1, hi - 1), true);
        }
        (lo + span / 2, false)
    }

    /// Moves from a probe near the target to the exact ceiling block: strides away from the
    /// target with doubling steps until the target is bracketed, then bisects.
    async fn correct(
        &self,
        probe: &mut Probe<'_>,
        start: u64,
        start_ts: u64,
        head: u64,
    ) -> Result<u64, LocatorError> {
        let target = probe.target;
        let mut stride = 1u64;
        if start_ts >= target {
            let mut hi = start;
            for _ in 0..self.config.max_correction_steps {
                if hi == 0 {
                    return Ok(0);
                }
                let candidate = hi.saturating_sub(stride);
                let Some(ts) = probe.timestamp(candidate).await? else {
                    return Ok(hi);
                };
                if ts < target {
                    return self.bisect(probe, candidate, hi).await;
                }
                hi = candidate;
                stride = stride.saturating_mul(2);
            }
            return Ok(probe.best(hi));
        }

        let mut lo = start;
        for _ in 0..self.config.max_correction_steps {
            if lo >= head {
                return Ok(head);
            }
            let candidate = lo.saturating_add(stride).min(head);
            let Some(ts) = probe.timestamp(candidate).await? else {
                return Ok(probe.best(candidate));
            };
            if ts >= target {
                return self.bisect(probe, lo, candidate).await;
            }
            lo = candidate;
            stride = stride.saturating_mul(2);
        }
        Ok(probe.best(lo))
    }

    /// Bisects a bracket with `ts(lo) < target <= ts(hi)` down to adjacent heights.
    async fn bisect(
        &self,
        probe: &mut Probe<'_>,
        mut lo: u64,
        mut hi: u64,
    ) -> Result<u64, LocatorError> {
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            let Some(ts) = probe.timestamp(mid).await? else {
                return Ok(hi);
            };
            if ts >= probe.target {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Ok(hi)
    }

    /// Block range of a voting period: from the first block at or after `start` to the last
    /// block before `end`, or to the head while the period is still open.
    pub async fn locate_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BlockRange, LocatorError> {
        if end <= start {
            return Err(LocatorError::InvalidPeriod { start, end });
        }
        let start_block = self.find_block_at_or_after_time(start).await?;

        let head = self.data.head().await?;
        let head_ts = self.data.header(head).await?.timestamp;
        let end_ts = end.timestamp().max(0) as u64;
        let range = if end_ts > head_ts {
            BlockRange { start: start_block, end: head, complete: false }
        } else {
            let first_after = self.find_block_at_or_after(end_ts).await?;
            let first_after_ts = self.data.header(first_after).await?.timestamp;
            let end_block = if first_after_ts >= end_ts {
                first_after.saturating_sub(1)
            } else {
                first_after
            };
            BlockRange { start: start_block, end: end_block.max(start_block), complete: true }
        };
        tracing::info!(
            "Voting period {start} to {end} spans blocks {} to {} (complete: {})",
            range.start,
            range.end,
            range.complete
        );
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        cache::CacheSet,
        test_utils::{mock_gateway, MockChain, MockLedger, MockTranslator},
    };
    use proptest::prelude::*;

    fn locator(chain: Arc<MockChain>) -> BlockLocator {
        let gateway = mock_gateway(
            chain,
            Arc::new(MockLedger::default()),
            Arc::new(MockTranslator::default()),
        );
        let data = ChainData::new(Arc::new(gateway), Arc::new(CacheSet::default()));
        BlockLocator::new(data, LocatorConfig::default())
    }

    /// Irregular but non-decreasing timestamps, with repeats.
    fn irregular_timestamps(count: usize, seed: u64) -> Vec<u64> {
        let mut ts = 1_700_000_000u64;
        let mut state = seed | 1;
        (0..count)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                ts += state % 3;
                ts
            })
            .collect()
    }

    fn assert_ceiling(chain: &MockChain, target: u64, found: u64) {
        let ts = chain.timestamp(found).unwrap();
        assert!(ts >= target, "block {found} at {ts} is before target {target}");
        if found > 0 {
            let prev = chain.timestamp(found - 1).unwrap();
            assert!(prev < target, "block {} at {prev} is not before target {target}", found - 1);
        }
    }

    #[tokio::test]
    async fn finds_ceiling_on_regular_chain() {
        let chain = Arc::new(MockChain::with_blocks(200_000, 1_600_000_000, 1));
        let locator = locator(chain.clone());

        for target in [1_600_000_000, 1_600_000_001, 1_600_050_000, 1_600_123_456, 1_600_199_999] {
            let found = locator.find_block_at_or_after(target).await.unwrap();
            assert_ceiling(&chain, target, found);
        }
    }

    #[tokio::test]
    async fn finds_ceiling_with_repeated_timestamps() {
        let timestamps = irregular_timestamps(50_000, 7);
        let chain = Arc::new(MockChain::with_timestamps(timestamps.clone()));
        let locator = locator(chain.clone());

        for idx in [1usize, 100, 12_345, 33_333, 49_998] {
            let target = timestamps[idx];
            let found = locator.find_block_at_or_after(target).await.unwrap();
            assert_ceiling(&chain, target, found);
        }
    }

    #[tokio::test]
    async fn future_target_returns_head() {
        let chain = Arc::new(MockChain::with_blocks(1_000, 1_000, 2));
        let locator = locator(chain.clone());
        assert_eq!(locator.find_block_at_or_after(1_000_000).await.unwrap(), 999);
    }

    #[tokio::test]
    async fn target_before_genesis_returns_zero() {
        let chain = Arc::new(MockChain::with_blocks(1_000, 1_000, 2));
        let locator = locator(chain.clone());
        assert_eq!(locator.find_block_at_or_after(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_monotonic_timestamps_terminate() {
        let timestamps: Vec<u64> =
            (0..20_000u64).map(|n| 1_000_000 + n + if n % 7 == 0 { 500 } else { 0 }).collect();
        let chain = Arc::new(MockChain::with_timestamps(timestamps));
        let locator = locator(chain.clone());

        let found = locator.find_block_at_or_after(1_010_000).await.unwrap();
        assert!(found < 20_000);
        let budget = LocatorConfig::default().max_iterations as u64;
        assert!(chain.calls() <= budget + 2, "made {} calls", chain.calls());
    }

    #[tokio::test]
    async fn period_end_is_last_block_before_end() {
        let chain = Arc::new(MockChain::with_blocks(10_000, 1_600_000_000, 1));
        let locator = locator(chain.clone());
        let start = DateTime::from_timestamp(1_600_001_000, 0).unwrap();
        let end = DateTime::from_timestamp(1_600_002_000, 0).unwrap();

        let range = locator.locate_period(start, end).await.unwrap();
        assert_eq!(range, BlockRange { start: 1_000, end: 1_999, complete: true });
    }

    #[tokio::test]
    async fn open_period_ends_at_head() {
        let chain = Arc::new(MockChain::with_blocks(10_000, 1_600_000_000, 1));
        let locator = locator(chain.clone());
        let start = DateTime::from_timestamp(1_600_001_000, 0).unwrap();
        let end = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let range = locator.locate_period(start, end).await.unwrap();
        assert_eq!(range, BlockRange { start: 1_000, end: 9_999, complete: false });
        assert!(locator.locate_period(end, start).await.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn located_block_is_the_ceiling(seed in 1u64..10_000, pick in 0usize..5_000) {
            let timestamps = irregular_timestamps(5_000, seed);
            let target = timestamps[pick];
            let chain = Arc::new(MockChain::with_timestamps(timestamps));
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let found = rt.block_on(locator(chain.clone()).find_block_at_or_after(target)).unwrap();
            assert_ceiling(&chain, target, found);
        }
    }
}
