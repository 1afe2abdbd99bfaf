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

use rand::Rng;

/// Exponential backoff with jitter for retrying one endpoint.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts against one endpoint, including the first.
    pub attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub multiplier: f64,
    /// Relative jitter applied to every delay, `0.2` meaning +/- 20%
    pub jitter: f64,
    /// Maximum delay between retries, regardless of backoff
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero based) without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let backoff =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let backoff_ms = backoff.min(self.max_delay.as_millis() as f64).max(0.0) as u64;
        Duration::from_millis(backoff_ms)
    }

    /// Delay before retry number `retry` with jitter applied.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for retry in 0..3 {
            let base = policy.base_delay(retry).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.delay_for(retry).as_secs_f64();
                assert!(delay >= base * 0.8 - 1e-9, "{delay} below band for {base}");
                assert!(delay <= base * 1.2 + 1e-9, "{delay} above band for {base}");
            }
        }
    }
}
