//! Runtime configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for [`ModelRuntime`].
///
/// Every field has a sensible default so the runtime works out-of-the-box
/// without any environment variables set.
///
/// [`ModelRuntime`]: crate::ModelRuntime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of the model cache (default: `"./kiln-cache"`).
    pub cache_dir: PathBuf,

    /// Base URL that manifest artifact paths are resolved against.
    pub artifact_base_url: String,

    /// Scheduler worker budget across all task types (default: `4`).
    pub max_total_concurrent: usize,

    /// Cache size threshold that triggers LRU eviction of ready versions.
    /// `None` (default) disables eviction.
    pub max_cache_bytes: Option<u64>,

    /// Download retry attempts per artifact (default: `3`).
    pub download_retry_count: usize,

    /// Delay between download retries (default: 2 s).
    pub download_retry_delay: Duration,

    /// When `true`, a matched stop string is included in the final delta.
    /// Off by default; most clients never want to see the stop text.
    pub emit_stop_fragment: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,reqwest=warn"`.
    /// Consumed by the embedding application when wiring a subscriber.
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./kiln-cache"),
            artifact_base_url: String::new(),
            max_total_concurrent: 4,
            max_cache_bytes: None,
            download_retry_count: 3,
            download_retry_delay: Duration::from_secs(2),
            emit_stop_fragment: false,
            log_level: "info".to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Build [`RuntimeConfig`] from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_dir: PathBuf::from(env_or("KILN_CACHE_DIR", "./kiln-cache")),
            artifact_base_url: env_or("KILN_ARTIFACT_BASE_URL", ""),
            max_total_concurrent: parse_env("KILN_MAX_CONCURRENT", defaults.max_total_concurrent),
            max_cache_bytes: std::env::var("KILN_MAX_CACHE_BYTES")
                .ok()
                .and_then(|v| v.parse().ok()),
            download_retry_count: parse_env("KILN_DOWNLOAD_RETRIES", defaults.download_retry_count),
            download_retry_delay: Duration::from_secs(parse_env("KILN_DOWNLOAD_RETRY_DELAY_SECS", 2)),
            emit_stop_fragment: std::env::var("KILN_EMIT_STOP_FRAGMENT")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_level: env_or("KILN_LOG", "info"),
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
