// Copyright 2024 kisekifs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry with backoff, shared by the fetch and the upload paths.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{
    config::{BackoffPolicy, RetryConfig},
    err::BackendError,
};

/// Why [RetryPolicy::run] gave up.
#[derive(Debug)]
pub enum RetryError {
    /// The last attempt still failed with a transient error.
    Exhausted { attempts: usize, last: BackendError },
    /// A permanent error, returned on the attempt it happened.
    Permanent { attempts: usize, error: BackendError },
}

impl RetryError {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_inner(self) -> BackendError {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> usize { self.config.max_attempts.max(1) }

    /// The delay before attempt `attempt + 1`, `attempt` being 1-based.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let base = match self.config.policy {
            BackoffPolicy::Fixed => self.config.initial_delay(),
            BackoffPolicy::Exponential => {
                let shift = (attempt.saturating_sub(1)).min(16) as u32;
                self.config
                    .initial_delay()
                    .saturating_mul(1u32 << shift)
            }
        };
        let base = if self.config.max_delay_ms > 0 {
            base.min(self.config.max_delay())
        } else {
            base
        };
        if self.config.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.config.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. `what` only shows up in logs.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(usize) -> Result<T, BackendError>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_transient() => {
                    return Err(RetryError::Permanent {
                        attempts: attempt,
                        error: e,
                    });
                }
                Err(e) if attempt >= max_attempts => {
                    warn!("{what} failed after {attempt} attempts: {e}");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!("{what} attempt {attempt}/{max_attempts} failed: {e}, retry in {delay:?}");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
