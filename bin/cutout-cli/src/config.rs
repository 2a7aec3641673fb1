//! CLI configuration, loaded from environment variables and overlaid by
//! command-line flags.

use std::time::Duration;

use cutout_core::config::{DEFAULT_CONCURRENCY, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_REQUEST_TIMEOUT};
use cutout_core::{QueueConfig, SegmentParams};

use crate::cli::Args;

/// Runtime configuration for the `cutout` binary.
///
/// Every field has a default so the tool works against a local server
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the segmentation server (default: `"http://127.0.0.1:8000"`).
    pub server: String,

    /// Maximum number of files in flight at once.
    pub concurrency: usize,

    /// Per-file deadline in seconds.
    pub timeout_secs: u64,

    /// Local size limit in bytes; `0` disables the check.
    pub max_upload_bytes: u64,

    /// `tracing` filter string, e.g. `"info"` or `"debug,reqwest=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            server: env_or("CUTOUT_SERVER", "http://127.0.0.1:8000"),
            concurrency: parse_env("CUTOUT_CONCURRENCY", DEFAULT_CONCURRENCY),
            timeout_secs: parse_env("CUTOUT_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT.as_secs()),
            max_upload_bytes: parse_env("CUTOUT_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            log_level: env_or("CUTOUT_LOG", "info"),
            log_json: std::env::var("CUTOUT_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Flags given on the command line win over the environment.
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(server) = &args.server {
            self.server = server.clone();
        }
        if let Some(concurrency) = args.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(timeout_secs) = args.timeout_secs {
            self.timeout_secs = timeout_secs;
        }
        if let Some(max) = args.max_upload_bytes {
            self.max_upload_bytes = max;
        }
        if args.log_json {
            self.log_json = true;
        }
        self
    }

    pub fn queue_config(&self, default_params: SegmentParams) -> QueueConfig {
        QueueConfig {
            concurrency: self.concurrency,
            request_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            max_upload_bytes: (self.max_upload_bytes > 0).then_some(self.max_upload_bytes),
            default_params,
            ..QueueConfig::default()
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
