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
//! Durable scan progress: the highest fully processed height and the blocks below it that
//! failed and still need a rescan. Both are written together in one checkpoint record.

use std::{
    collections::BTreeSet,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::store::{SnapshotStore, StoreError};

// Heights are stored off by one so that zero can mean "nothing recorded".
const NONE: u64 = 0;

fn encode(height: u64) -> u64 {
    height.saturating_add(1)
}

fn decode(raw: u64) -> Option<u64> {
    raw.checked_sub(1)
}

/// Tracks the highest fully processed height and persists it on an interval.
///
/// Both the in-memory and the durable heights only ever move up: recording or persisting
/// a lower height than one already seen is a no-op. A failed block must be passed to
/// [CheckpointController::record_missed] before any height covering it is recorded, so the
/// durable height never passes a block that is not in the durable missed set.
pub struct CheckpointController {
    store: SnapshotStore,
    recorded: AtomicU64,
    durable: AtomicU64,
    missed: std::sync::Mutex<BTreeSet<u64>>,
    missed_dirty: AtomicBool,
    save_interval: Duration,
    last_saved: Mutex<Instant>,
}

impl CheckpointController {
    pub async fn load(store: SnapshotStore, save_interval: Duration) -> Result<Self, StoreError> {
        let record = store.read_checkpoint().await?;
        let durable = record.as_ref().map_or(NONE, |record| encode(record.height));
        let missed: BTreeSet<u64> =
            record.map(|record| record.missed_blocks.into_iter().collect()).unwrap_or_default();
        if let Some(height) = decode(durable) {
            tracing::info!(
                "Resuming from durable checkpoint at block {height}, {} blocks to rescan",
                missed.len()
            );
        }
        Ok(Self {
            store,
            recorded: AtomicU64::new(durable),
            durable: AtomicU64::new(durable),
            missed: std::sync::Mutex::new(missed),
            missed_dirty: AtomicBool::new(false),
            save_interval,
            last_saved: Mutex::new(Instant::now()),
        })
    }

    /// Notes that every block up to `height` is processed. Returns the current maximum.
    pub fn record(&self, height: u64) -> u64 {
        let previous = self.recorded.fetch_max(encode(height), Ordering::AcqRel);
        if previous > encode(height) {
            tracing::debug!(
                "Ignoring checkpoint {height} behind {}",
                decode(previous).unwrap_or_default()
            );
        }
        decode(previous.max(encode(height))).unwrap_or(height)
    }

    pub fn recorded(&self) -> Option<u64> {
        decode(self.recorded.load(Ordering::Acquire))
    }

    pub fn durable(&self) -> Option<u64> {
        decode(self.durable.load(Ordering::Acquire))
    }

    fn missed_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<u64>> {
        self.missed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds blocks that could not be scanned. They stay recorded until [Self::clear_missed].
    pub fn record_missed(&self, blocks: &[u64]) {
        let mut missed = self.missed_set();
        let before = missed.len();
        missed.extend(blocks.iter().copied());
        if missed.len() != before {
            self.missed_dirty.store(true, Ordering::Release);
        }
    }

    /// Drops blocks that were rescanned successfully.
    pub fn clear_missed(&self, blocks: &[u64]) {
        let mut missed = self.missed_set();
        let before = missed.len();
        for block in blocks {
            missed.remove(block);
        }
        if missed.len() != before {
            self.missed_dirty.store(true, Ordering::Release);
        }
    }

    /// Blocks still waiting for a rescan, in ascending order.
    pub fn missed_blocks(&self) -> Vec<u64> {
        self.missed_set().iter().copied().collect()
    }

    /// First block still to scan for a period starting at `period_start`.
    pub fn resume_from(&self, period_start: u64) -> u64 {
        self.durable().map_or(period_start, |height| height.saturating_add(1).max(period_start))
    }

    /// Persists the recorded height if the save interval elapsed since the last write.
    pub async fn persist_if_due(&self) -> Result<bool, StoreError> {
        let due = self.last_saved.lock().await.elapsed() >= self.save_interval;
        if !due {
            return Ok(false);
        }
        self.persist().await
    }

    /// Writes the recorded height and the missed set if either changed since the last write.
    ///
    /// Nothing is written before a height is recorded: every missed block is then above the
    /// durable height and gets scanned again on resume anyway.
    pub async fn persist(&self) -> Result<bool, StoreError> {
        // Held across the write so that two writers cannot reorder their heights on disk.
        let mut last_saved = self.last_saved.lock().await;
        let raw = self.recorded.load(Ordering::Acquire);
        let Some(height) = decode(raw) else {
            return Ok(false);
        };
        let missed_changed = self.missed_dirty.swap(false, Ordering::AcqRel);
        if raw <= self.durable.load(Ordering::Acquire) && !missed_changed {
            *last_saved = Instant::now();
            return Ok(false);
        }
        let missed = self.missed_blocks();
        let pending = missed.len();
        if let Err(err) = self.store.write_checkpoint(height, missed).await {
            if missed_changed {
                self.missed_dirty.store(true, Ordering::Release);
            }
            return Err(err);
        }
        self.durable.fetch_max(raw, Ordering::AcqRel);
        *last_saved = Instant::now();
        tracing::info!("Checkpoint saved at block {height} with {pending} blocks to rescan");
        Ok(true)
    }
}
