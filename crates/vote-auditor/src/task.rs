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

//! Restarting long-running tasks after recoverable failures.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Error as AnyhowErr, Result as AnyhowRes};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SupervisorErr {
    /// Restart the task after a delay
    #[error("Recoverable error: {0}")]
    Recover(AnyhowErr),
    /// Stop supervising and report the failure
    #[error("Hard failure: {0}")]
    Fault(AnyhowErr),
}

pub type RetryRes = Pin<Box<dyn Future<Output = Result<(), SupervisorErr>> + Send + 'static>>;

pub trait RetryTask {
    /// Starts one run of the task. Each restart calls this again.
    fn spawn(&self) -> RetryRes;
}

/// When and how often a failed task is restarted.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Delay before the first restart
    pub delay: Duration,
    /// Multiplier applied to the delay after each consecutive restart
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Consecutive restarts before giving up, `None` for unlimited
    pub max_retries: Option<usize>,
    /// A run lasting at least this long resets the consecutive restart count
    pub reset_after: Option<Duration>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            max_retries: None,
            reset_after: Some(Duration::from_secs(60 * 5)),
        }
    }
}

impl RestartPolicy {
    fn delay_for(&self, retry_count: usize) -> Duration {
        let backoff =
            self.delay.as_millis() as f64 * self.backoff_multiplier.powi(retry_count as i32);
        Duration::from_millis(backoff.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Runs a single task, restarting it on [SupervisorErr::Recover] until it exits cleanly,
/// fails hard, exhausts its restarts or is cancelled.
pub struct Supervisor<T: RetryTask> {
    name: &'static str,
    task: Arc<T>,
    policy: RestartPolicy,
    cancel: CancellationToken,
}

impl<T> Supervisor<T>
where
    T: RetryTask + Send,
{
    pub fn new(name: &'static str, task: Arc<T>) -> Self {
        Self { name, task, policy: RestartPolicy::default(), cancel: CancellationToken::new() }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Once `cancel` fires no replacement is started and a pending restart delay is cut short.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Supervises the task and returns the number of restarts it needed.
    pub async fn spawn(self) -> AnyhowRes<usize> {
        let name = self.name;
        let mut restarts = 0;
        let mut retry_count = 0;

        loop {
            let started = Instant::now();
            tracing::debug!("Starting {name}");
            let err = match tokio::spawn(self.task.spawn()).await {
                Ok(Ok(())) => {
                    tracing::debug!("{name} exited cleanly");
                    return Ok(restarts);
                }
                Ok(Err(SupervisorErr::Recover(err))) => err,
                Ok(Err(SupervisorErr::Fault(err))) => {
                    tracing::error!("FAULT: {name} failed hard: {err:?}");
                    anyhow::bail!("Hard failure in {name}: {err}");
                }
                Err(err) => {
                    tracing::error!("ABORT: {name} panicked or was aborted");
                    anyhow::bail!("{name} did not complete: {err}");
                }
            };

            if self.cancel.is_cancelled() {
                tracing::info!("{name} failed after cancellation, not restarting: {err:?}");
                return Ok(restarts);
            }
            if self.policy.reset_after.is_some_and(|after| started.elapsed() >= after) {
                retry_count = 0;
            }
            if let Some(max) = self.policy.max_retries {
                if retry_count >= max {
                    tracing::error!("{name} exceeded {max} consecutive restarts: {err:?}");
                    anyhow::bail!("Exceeded maximum restarts for {name}");
                }
            }

            let delay = self.policy.delay_for(retry_count);
            tracing::warn!(
                "Recoverable failure in {name}: {err:?}, restarting in {delay:?} (retry {})",
                retry_count + 1
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("{name} cancelled while waiting to restart");
                    return Ok(restarts);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            retry_count += 1;
            restarts += 1;
        }
    }
}
