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

//! End to end scenarios of the streams over instrumented backends.

use std::sync::Arc;

use kiseki_stream::{
    backend::testkit::InstrumentedBackend, RetryConfig, StreamConfig, Transfers,
};

#[cfg(test)]
mod backends;
#[cfg(test)]
mod read_scenarios;
#[cfg(test)]
mod write_scenarios;

/// Deterministic, non repeating enough content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect()
}

/// A config that never sleeps between retries.
pub fn fast_config() -> StreamConfig {
    StreamConfig::default().with_retry(RetryConfig::no_delay(3))
}

/// Transfers over a fresh instrumented in-memory backend.
pub fn instrumented(config: StreamConfig) -> (Arc<InstrumentedBackend>, Transfers) {
    kiseki_utils::logger::install_fmt_log();
    let backend = Arc::new(InstrumentedBackend::in_memory());
    let transfers = Transfers::new(backend.clone(), config).expect("valid config");
    (backend, transfers)
}
