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

use std::sync::Once;

use snafu::{ResultExt, Whatever};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// The environment variable that overrides [LoggingConfig::default_filter].
pub const KISEKI_LOG_ENV: &str = "KISEKI_LOG";

/// Configuration for logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Whether to write logs to stdout, otherwise they go to stderr.
    pub log_to_stdout: bool,
    /// The default filter directive (in the sense of
    /// [tracing_subscriber::filter::EnvFilter]) to use for logs. Will be
    /// overridden by the `KISEKI_LOG` environment variable if set.
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_stdout: false,
            default_filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn init_tracing_subscriber(self) -> Result<(), Whatever> {
        let env_filter = create_env_filter(&self.default_filter);
        // Don't create the subscribers if we'll never emit any logs
        if env_filter.max_level_hint() == Some(LevelFilter::OFF) {
            return Ok(());
        }

        let (stdout_layer, stderr_layer) = if self.log_to_stdout {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                .with_filter(create_env_filter(&self.default_filter));
            (Some(layer), None)
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                .with_writer(std::io::stderr)
                .with_filter(create_env_filter(&self.default_filter));
            (None, Some(layer))
        };

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(stderr_layer)
            .try_init()
            .with_whatever_context(|e| format!("failed to install tracing subscriber: {e}"))?;
        Ok(())
    }
}

/// Create the filter from the KISEKI_LOG environment variable or the default
/// config if that variable is unset. We do this in a function because
/// [EnvFilter] isn't [Clone] and we need a copy of the filter for each
/// [Layer].
fn create_env_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_from_env(KISEKI_LOG_ENV).unwrap_or_else(|_| EnvFilter::new(filter))
}

static INSTALL_FMT_LOG: Once = Once::new();

/// Install a test writer subscriber once per process. Used by tests.
pub fn install_fmt_log() {
    INSTALL_FMT_LOG.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(create_env_filter("debug"))
            .with_test_writer()
            .try_init();
    });
}
