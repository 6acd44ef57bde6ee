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

//! The runtime that drives async storage clients on behalf of the blocking
//! stream API.

use std::future::Future;

use once_cell::sync::Lazy;
use tracing::debug;

static GLOBAL_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    let workers = crate::num_cpus().clamp(2, 8);
    debug!("start tokio runtime with {} workers", workers);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("kiseki-io")
        .enable_all()
        .build()
        .expect("failed to build the io runtime")
});

/// Run `future` to completion on the io runtime, blocking the caller.
///
/// Must not be called from inside an async context.
pub fn block_on<F: Future>(future: F) -> F::Output { GLOBAL_RUNTIME.block_on(future) }
