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

use std::time::Duration;

use kiseki_common::{
    BINARY_NEWLINE, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_PART_SIZE,
    DEFAULT_RETRY_INITIAL_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS, MAX_PART_COUNT, MIN_PART_SIZE,
};
use kiseki_utils::{env, readable_size::ReadableSize};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use crate::err::{InvalidConfigSnafu, ParseConfigSnafu, Result};

pub const ENV_PART_SIZE: &str = "KISEKI_STREAM_PART_SIZE";
pub const ENV_BUFFER_SIZE: &str = "KISEKI_STREAM_BUFFER_SIZE";
pub const ENV_DEFER_SEEK: &str = "KISEKI_STREAM_DEFER_SEEK";
pub const ENV_MULTIPART: &str = "KISEKI_STREAM_MULTIPART";
pub const ENV_MAX_ATTEMPTS: &str = "KISEKI_STREAM_MAX_ATTEMPTS";

/// How the delay between two attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Always wait `initial_delay`.
    Fixed,
    /// Wait `initial_delay * 2^(attempt - 1)`, capped by `max_delay`.
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one, so `1` disables retrying.
    pub max_attempts: usize,
    pub policy: BackoffPolicy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomize every delay by up to this fraction of itself, `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            policy: BackoffPolicy::Exponential,
            initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Retry immediately, used by tests and in-memory backends.
    pub fn no_delay(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            policy: BackoffPolicy::Fixed,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    pub fn initial_delay(&self) -> Duration { Duration::from_millis(self.initial_delay_ms) }

    pub fn max_delay(&self) -> Duration { Duration::from_millis(self.max_delay_ms) }
}

/// Where the writer keeps bytes that are not uploaded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteBufferKind {
    Memory,
    /// An anonymous temporary file, trading disk io for RAM.
    Disk,
}

/// [StreamConfig] tunes both directions of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// [buffer_size] is the prefetch window, the amount of bytes a reader
    /// asks the backend for at once.
    pub buffer_size: ReadableSize,
    /// [part_size] is the threshold at which a writer cuts a part and
    /// uploads it.
    pub part_size: ReadableSize,
    /// [min_part_size] is what the backend is known to accept for
    /// non-final parts. Going below only logs a warning.
    pub min_part_size: ReadableSize,
    /// [max_part_count] bounds the number of parts of one transfer.
    pub max_part_count: usize,
    /// [multipart] when false, a writer buffers everything and does a
    /// single put at close.
    pub multipart: bool,
    /// [defer_seek] delays the fetch triggered by a seek, and the initial
    /// stat, until the next read.
    pub defer_seek: bool,
    /// [line_terminator] used by `readline`, may be more than one byte.
    pub line_terminator: Vec<u8>,
    pub write_buffer: WriteBufferKind,
    pub retry: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: ReadableSize(DEFAULT_BUFFER_SIZE as u64), // 128KiB
            part_size: ReadableSize(DEFAULT_PART_SIZE as u64),     // 50MiB
            min_part_size: ReadableSize(MIN_PART_SIZE as u64),     // 5MiB
            max_part_count: MAX_PART_COUNT,
            multipart: true,
            defer_seek: false,
            line_terminator: BINARY_NEWLINE.to_vec(),
            write_buffer: WriteBufferKind::Memory,
            retry: RetryConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StreamConfig = toml::from_str(s).context(ParseConfigSnafu)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = ReadableSize(size as u64);
        self
    }

    pub fn with_part_size(mut self, size: usize) -> Self {
        self.part_size = ReadableSize(size as u64);
        self
    }

    pub fn with_defer_seek(mut self, defer: bool) -> Self {
        self.defer_seek = defer;
        self
    }

    pub fn with_multipart(mut self, multipart: bool) -> Self {
        self.multipart = multipart;
        self
    }

    pub fn with_line_terminator(mut self, terminator: &[u8]) -> Self {
        self.line_terminator = terminator.to_vec();
        self
    }

    pub fn with_write_buffer(mut self, kind: WriteBufferKind) -> Self {
        self.write_buffer = kind;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override fields from `KISEKI_STREAM_*` environment variables (or a
    /// `.env` file).
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        let to_config_err = |e: snafu::Whatever| InvalidConfigSnafu { reason: e.to_string() }.build();
        if let Some(v) = env::var_parsed::<ReadableSize>(ENV_PART_SIZE).map_err(to_config_err)? {
            debug!("override part size from env: {}", v);
            self.part_size = v;
        }
        if let Some(v) = env::var_parsed::<ReadableSize>(ENV_BUFFER_SIZE).map_err(to_config_err)? {
            debug!("override buffer size from env: {}", v);
            self.buffer_size = v;
        }
        if let Some(v) = env::var_flag(ENV_DEFER_SEEK).map_err(to_config_err)? {
            self.defer_seek = v;
        }
        if let Some(v) = env::var_flag(ENV_MULTIPART).map_err(to_config_err)? {
            self.multipart = v;
        }
        if let Some(v) = env::var_parsed::<usize>(ENV_MAX_ATTEMPTS).map_err(to_config_err)? {
            self.retry.max_attempts = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let reason = if self.buffer_size.as_bytes() == 0 {
            "buffer_size must be positive"
        } else if self.part_size.as_bytes() == 0 {
            "part_size must be positive"
        } else if self.max_part_count == 0 {
            "max_part_count must be positive"
        } else if self.line_terminator.is_empty() {
            "line_terminator must not be empty"
        } else if self.retry.max_attempts == 0 {
            "retry.max_attempts must be at least 1"
        } else if !(0.0..=1.0).contains(&self.retry.jitter) {
            "retry.jitter must be within [0, 1]"
        } else {
            return Ok(());
        };
        InvalidConfigSnafu { reason }.fail()
    }
}
