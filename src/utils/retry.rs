// Copyright 2025 jonefeewang@gmail.com
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

/// Backoff schedule for reconnecting a partition receiver.
///
/// Iterating the policy yields the delay to wait before each retry; the
/// iterator ends when the attempts are used up.
///
/// ```
/// use std::time::Duration;
/// use eventhub_spout::utils::RetryPolicy;
///
/// let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1), 3);
/// assert_eq!(policy.iter().count(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Give up after the first failure.
    None,
    /// Double the delay on every attempt up to `max_delay`, with up to 10% jitter on top.
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        max_attempts: usize,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: usize) -> Self {
        Self::Exponential {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            max_attempts,
        }
    }

    pub fn iter(&self) -> RetryIter {
        RetryIter {
            policy: self.clone(),
            attempts: 0,
        }
    }
}

#[derive(Debug)]
pub struct RetryIter {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryIter {
    /// Retries handed out so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl Iterator for RetryIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        match self.policy {
            RetryPolicy::None => None,
            RetryPolicy::Exponential {
                initial_delay,
                max_delay,
                max_attempts,
            } => {
                if self.attempts >= max_attempts {
                    return None;
                }
                let exponent = self.attempts.min(31) as u32;
                self.attempts += 1;
                let delay = initial_delay
                    .saturating_mul(2u32.saturating_pow(exponent))
                    .min(max_delay);
                let jitter_cap = (delay.as_millis() / 10) as u64;
                let jitter = if jitter_cap == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=jitter_cap)
                };
                Some(delay + Duration::from_millis(jitter))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_retries() {
        assert_eq!(RetryPolicy::None.iter().next(), None);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = RetryPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_millis(350),
            4,
        );
        let delays: Vec<Duration> = policy.iter().collect();
        assert_eq!(delays.len(), 4);

        let lower = [100, 200, 350, 350];
        for (delay, lower) in delays.iter().zip(lower) {
            let millis = delay.as_millis() as u64;
            assert!(millis >= lower, "{millis} < {lower}");
            assert!(millis <= lower + lower / 10, "{millis} too much jitter");
        }
    }

    #[test]
    fn attempts_are_counted() {
        let policy = RetryPolicy::exponential(Duration::ZERO, Duration::ZERO, 2);
        let mut iter = policy.iter();
        assert_eq!(iter.next(), Some(Duration::ZERO));
        assert_eq!(iter.next(), Some(Duration::ZERO));
        assert_eq!(iter.next(), None);
        assert_eq!(iter.attempts(), 2);
    }
}
