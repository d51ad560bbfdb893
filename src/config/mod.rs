use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipeline: PipelineConfig,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Reasoning-service request configuration.
///
/// `timeout_ms` bounds a single call; `max_attempts`, `retry_delay_ms` and
/// `max_retry_delay_ms` seed the retry policy of the built-in stages.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

/// Orchestration, drain and evidence-enforcement settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How often the drain controller polls the in-flight counter.
    pub drain_poll_interval_ms: u64,
    /// Upper bound on how long shutdown waits for in-flight stages.
    pub drain_max_wait_ms: u64,
    /// Minimum number of distinct, non-generic gaps in a self-critique.
    pub critique_min_gaps: usize,
    /// Gaps shorter than this are treated as generic.
    pub critique_min_gap_chars: usize,
    /// Prefix applied to every built-in stage pipe name.
    pub pipe_prefix: String,
    /// Create/upsert stage pipes on startup.
    pub ensure_pipes: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/analysis.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = RequestConfig::default();
        let request = RequestConfig {
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS", defaults.timeout_ms),
            max_attempts: parse_env("STAGE_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            retry_delay_ms: parse_env("RETRY_DELAY_MS", defaults.retry_delay_ms),
            max_retry_delay_ms: parse_env("RETRY_MAX_DELAY_MS", defaults.max_retry_delay_ms),
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            drain_poll_interval_ms: parse_env(
                "DRAIN_POLL_INTERVAL_MS",
                defaults.drain_poll_interval_ms,
            )
            .max(1),
            drain_max_wait_ms: parse_env("DRAIN_MAX_WAIT_MS", defaults.drain_max_wait_ms),
            critique_min_gaps: parse_env("CRITIQUE_MIN_GAPS", defaults.critique_min_gaps),
            critique_min_gap_chars: parse_env(
                "CRITIQUE_MIN_GAP_CHARS",
                defaults.critique_min_gap_chars,
            ),
            pipe_prefix: env::var("PIPE_PREFIX").unwrap_or(defaults.pipe_prefix),
            ensure_pipes: env::var("ENSURE_PIPES")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(defaults.ensure_pipes),
        };

        Ok(Config {
            langbase,
            database,
            logging,
            request,
            pipeline,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl RequestConfig {
    /// Per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            drain_poll_interval_ms: 5000,
            drain_max_wait_ms: 300_000,
            critique_min_gaps: 2,
            critique_min_gap_chars: 20,
            pipe_prefix: "analysis-chain".to_string(),
            ensure_pipes: true,
        }
    }
}

impl PipelineConfig {
    /// Drain poll interval as a [`Duration`].
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    /// Maximum drain wait as a [`Duration`].
    pub fn drain_max_wait(&self) -> Duration {
        Duration::from_millis(self.drain_max_wait_ms)
    }
}
