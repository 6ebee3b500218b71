//! Process-wide configuration, read once at startup.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::prelude::*;

/// Default poll interval when the queue is empty (milliseconds).
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default bounded timeout applied to every network call (seconds).
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;

/// Default maximum number of attempts before a task is dead-lettered.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default lease on a claimed task before another worker may reclaim it
/// (seconds).
const DEFAULT_CLAIM_LEASE_SECS: u64 = 600;

/// Built-in storage roots for known namespaces. These apply when no
/// `OCR_RELAY_ROOT_<NAME>` override is configured.
const BUILTIN_ROOTS: &[(&str, &str)] = &[
    ("newsletters", "/data/newsletters"),
    ("books", "/data/books"),
    ("photos", "/data/photos"),
];

/// Process configuration. Roots are fixed for the process lifetime; there is
/// no hot-reload.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `OCR_RELAY_DEFAULT_ROOT` | `/data` | Root for paths with no namespace |
/// | `OCR_RELAY_ROOT_<NAME>` | built-in | Root override for namespace `<name>` |
/// | `OCR_RELAY_QUEUE_DB` | `sqlite://ocr-relay-queue.db` | Task queue database |
/// | `OCR_RELAY_REPOSITORY_URL` | unset | Base URL of the digital repository |
/// | `OCR_RELAY_REPOSITORY_USER` | unset | Repository login, if required |
/// | `OCR_RELAY_REPOSITORY_PASSWORD` | unset | Repository password |
/// | `OCR_RELAY_VISION_API_BASE` | `http://localhost:11434/v1` | Vision OCR endpoint |
/// | `OCR_RELAY_VISION_API_KEY` | unset | API key for the vision endpoint |
/// | `OCR_RELAY_MAX_ATTEMPTS` | `3` | Attempts before dead-lettering |
/// | `OCR_RELAY_CLAIM_LEASE_SECS` | `600` | Lease on claimed tasks before reclaim |
/// | `OCR_RELAY_CALL_TIMEOUT_SECS` | `120` | Timeout on each network call |
/// | `OCR_RELAY_POLL_INTERVAL_MS` | `500` | Worker poll interval when idle |
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for logical paths with no recognized namespace prefix.
    pub default_root: PathBuf,

    /// Namespace name to storage root. Built-ins overlaid with env overrides.
    pub roots: BTreeMap<String, PathBuf>,

    /// Connection URL for the task queue database.
    pub queue_db_url: String,

    /// Base URL of the digital repository, if configured.
    pub repository_url: Option<String>,

    /// Repository login, if the repository requires one.
    pub repository_user: Option<String>,

    /// Repository password.
    pub repository_password: Option<String>,

    /// Base URL of the OpenAI-compatible vision endpoint.
    pub vision_api_base: String,

    /// API key for the vision endpoint, if any.
    pub vision_api_key: Option<String>,

    /// Maximum attempts before a task is dead-lettered.
    pub max_attempts: u32,

    /// How long a claimed task may sit before another worker reclaims it.
    pub claim_lease: Duration,

    /// Bounded timeout applied to every network call.
    pub call_timeout: Duration,

    /// Worker poll interval when the queue is empty.
    pub poll_interval: Duration,
}

impl Config {
    /// Build a configuration from environment variables (with defaults).
    pub fn from_env() -> Self {
        let mut roots = BTreeMap::new();
        for (name, root) in BUILTIN_ROOTS {
            roots.insert((*name).to_owned(), PathBuf::from(root));
        }
        for (key, value) in env::vars() {
            if let Some(name) = key.strip_prefix("OCR_RELAY_ROOT_") {
                if !name.is_empty() && !value.is_empty() {
                    roots.insert(name.to_ascii_lowercase(), PathBuf::from(value));
                }
            }
        }

        let max_attempts = env::var("OCR_RELAY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .max(1);
        let claim_lease_secs = env::var("OCR_RELAY_CLAIM_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CLAIM_LEASE_SECS)
            .max(1);
        let call_timeout_secs = env::var("OCR_RELAY_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS)
            .max(1);
        let poll_interval_ms = env::var("OCR_RELAY_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        Self {
            default_root: env::var("OCR_RELAY_DEFAULT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/data")),
            roots,
            queue_db_url: env::var("OCR_RELAY_QUEUE_DB")
                .unwrap_or_else(|_| "sqlite://ocr-relay-queue.db".to_owned()),
            repository_url: env::var("OCR_RELAY_REPOSITORY_URL").ok(),
            repository_user: env::var("OCR_RELAY_REPOSITORY_USER").ok(),
            repository_password: env::var("OCR_RELAY_REPOSITORY_PASSWORD").ok(),
            vision_api_base: env::var("OCR_RELAY_VISION_API_BASE")
                .unwrap_or_else(|_| "http://localhost:11434/v1".to_owned()),
            vision_api_key: env::var("OCR_RELAY_VISION_API_KEY").ok(),
            max_attempts,
            claim_lease: Duration::from_secs(claim_lease_secs),
            call_timeout: Duration::from_secs(call_timeout_secs),
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }

    /// The repository base URL, or an error telling the user how to set it.
    pub fn repository_url(&self) -> Result<&str> {
        self.repository_url
            .as_deref()
            .context("OCR_RELAY_REPOSITORY_URL must be set")
    }
}
