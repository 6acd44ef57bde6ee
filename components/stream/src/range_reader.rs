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

use bytes::Bytes;
use kiseki_common::{ObjectOffset, ObjectSize};
use snafu::IntoError;
use tracing::{debug, instrument};

use crate::{
    backend::{BackendRef, ByteRange},
    err::{PermanentFetchSnafu, Result, TransientFetchSnafu},
    retry::{RetryError, RetryPolicy},
};

/// Counters of one [RangeReader].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    /// Successful fetches.
    pub fetches: u64,
    pub fetched_bytes: u64,
    /// Backend calls, retries included.
    pub attempts: u64,
    pub stats: u64,
}

/// RangeReader pulls byte ranges of one remote object, retrying transient
/// failures with the configured backoff.
#[derive(Debug)]
pub struct RangeReader {
    backend: BackendRef,
    key: String,
    retry: RetryPolicy,
    size: Option<ObjectSize>,
    stats: FetchStats,
}

impl RangeReader {
    pub fn new(backend: BackendRef, key: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            key: key.into(),
            retry,
            size: None,
            stats: FetchStats::default(),
        }
    }

    pub fn key(&self) -> &str { &self.key }

    pub fn stats(&self) -> FetchStats { self.stats }

    pub fn known_size(&self) -> Option<ObjectSize> { self.size }

    /// The object size, asked once and remembered.
    pub fn size(&mut self) -> Result<ObjectSize> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let (backend, key) = (&self.backend, self.key.as_str());
        let stats = &mut self.stats;
        let meta = self
            .retry
            .run("stat", |_| {
                stats.attempts += 1;
                backend.stat(key)
            })
            .map_err(|e| self.map_err(0, e))?;
        self.stats.stats += 1;
        debug!("{} has {} bytes", self.key, meta.size);
        self.size = Some(meta.size);
        Ok(meta.size)
    }

    /// Fetch `len` bytes at `offset`, `None` meaning up to the end of the
    /// object. Fewer bytes are returned only at the end of the object.
    #[instrument(level = "debug", skip(self), fields(key = %self.key))]
    pub fn fetch(&mut self, offset: ObjectOffset, len: Option<u64>) -> Result<Bytes> {
        if len == Some(0) {
            return Ok(Bytes::new());
        }
        let range = ByteRange { offset, len };
        let (backend, key, size) = (&self.backend, self.key.as_str(), self.size);
        let stats = &mut self.stats;
        let mut data = self
            .retry
            .run("fetch", |_| {
                stats.attempts += 1;
                match size {
                    Some(size) => backend.fetch_within(key, range, size),
                    None => backend.fetch(key, range),
                }
            })
            .map_err(|e| self.map_err(offset, e))?;
        if let Some(len) = len {
            // never hand out more than asked.
            data.truncate(len as usize);
        }
        self.stats.fetches += 1;
        self.stats.fetched_bytes += data.len() as u64;
        if let (None, true) = (self.size, len.is_none()) {
            self.size = Some(offset + data.len() as u64);
        }
        Ok(data)
    }

    fn map_err(&self, offset: ObjectOffset, e: RetryError) -> crate::err::Error {
        match e {
            RetryError::Exhausted { attempts, last } => TransientFetchSnafu {
                key: self.key.as_str(),
                offset,
                attempts,
            }
            .into_error(last),
            RetryError::Permanent { error, .. } => PermanentFetchSnafu {
                key: self.key.as_str(),
                offset,
            }
            .into_error(error),
        }
    }
}
