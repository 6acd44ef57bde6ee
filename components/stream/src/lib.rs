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

//! Seekable read streams and multipart write streams over object storage.
//!
//! ```no_run
//! use std::{io::Write, sync::Arc};
//!
//! use kiseki_stream::{backend::MemoryBackend, StreamConfig, Transfers};
//!
//! let transfers = Transfers::new(Arc::new(MemoryBackend::new()), StreamConfig::default()).unwrap();
//! let mut w = transfers.writer("data/obj").unwrap();
//! w.write_all(b"hello").unwrap();
//! w.close().unwrap();
//!
//! let mut r = transfers.reader("data/obj").unwrap();
//! assert_eq!(r.read(None).unwrap().as_ref(), b"hello");
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod err;
pub mod input;
pub mod orchestrator;
pub mod output;
pub mod range_reader;
pub mod retry;
pub mod session;
pub mod uploader;

use std::sync::Arc;

pub use backend::{BackendRef, ObjectBackend};
pub use config::{BackoffPolicy, RetryConfig, StreamConfig, WriteBufferKind};
pub use err::{Error, Result};
pub use input::{ChunkedInputStream, InputState, ReadStats, Whence};
pub use orchestrator::TransferOrchestrator;
pub use output::{ChunkedOutputStream, OutputState};
use tracing::debug;

use crate::{
    backend::MemoryBackend, range_reader::RangeReader, retry::RetryPolicy,
    uploader::PartUploader,
};

/// Transfers opens streams on one backend with one configuration.
///
/// It is cheap to clone, streams opened from it share the backend but own
/// their buffers.
#[derive(Debug, Clone)]
pub struct Transfers {
    backend: BackendRef,
    config: StreamConfig,
    retry: RetryPolicy,
}

impl Transfers {
    pub fn new(backend: BackendRef, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        debug!("transfers on {} backend with {:?}", backend.name(), config);
        let retry = RetryPolicy::new(config.retry.clone());
        Ok(Self {
            backend,
            config,
            retry,
        })
    }

    /// Everything in process memory.
    pub fn in_memory(config: StreamConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    pub fn backend(&self) -> &BackendRef { &self.backend }

    pub fn config(&self) -> &StreamConfig { &self.config }

    pub fn reader(&self, key: &str) -> Result<ChunkedInputStream> {
        let reader = RangeReader::new(self.backend.clone(), key, self.retry.clone());
        ChunkedInputStream::new(reader, &self.config)
    }

    pub fn writer(&self, key: &str) -> Result<ChunkedOutputStream> {
        ChunkedOutputStream::new(self.orchestrator(key), &self.config)
    }

    /// A bare transfer for callers that cut parts themselves.
    pub fn orchestrator(&self, key: &str) -> TransferOrchestrator {
        let uploader = PartUploader::new(self.backend.clone(), self.retry.clone());
        TransferOrchestrator::new(uploader, key, self.config.max_part_count)
    }
}
