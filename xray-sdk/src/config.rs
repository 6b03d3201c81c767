//! SDK configuration
//!
//! Defines every tunable of the capture runtime: where traces go, how
//! delivery behaves when the endpoint is down, and how candidate lists are
//! sampled. A config is immutable once handed to a [`crate::Tracer`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::XrayError;

/// Upper bound on the per-attempt delivery timeout
const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// What to do with a trace once delivery has failed for good
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Drop the trace and carry on (production default)
    #[default]
    Silent,
    /// Append the trace to a local JSON-lines file
    Log,
    /// Return the transport error to the caller (tests / CI)
    Raise,
}

impl FromStr for FallbackMode {
    type Err = XrayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(FallbackMode::Silent),
            "log" => Ok(FallbackMode::Log),
            "raise" => Ok(FallbackMode::Raise),
            other => Err(XrayError::Config(format!(
                "unknown fallback mode '{}' (expected silent, log or raise)",
                other
            ))),
        }
    }
}

/// How a large candidate list is reduced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Head, random middle, tail
    #[default]
    Smart,
    /// Head and tail only
    HeadTail,
    /// Uniformly random across the whole list
    Random,
    /// Up to one bucket per distinct value of a top-level key
    Stratified { key: String },
}

impl SamplingStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SamplingStrategy::Smart => "smart",
            SamplingStrategy::HeadTail => "head_tail",
            SamplingStrategy::Random => "random",
            SamplingStrategy::Stratified { .. } => "stratified",
        }
    }
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingStrategy::Stratified { key } => write!(f, "stratified:{}", key),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for SamplingStrategy {
    type Err = XrayError;

    /// Parses `smart`, `head_tail`, `random` or `stratified:<key>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smart" => Ok(SamplingStrategy::Smart),
            "head_tail" => Ok(SamplingStrategy::HeadTail),
            "random" => Ok(SamplingStrategy::Random),
            other => match other.strip_prefix("stratified:") {
                Some(key) if !key.is_empty() => Ok(SamplingStrategy::Stratified {
                    key: key.to_string(),
                }),
                _ => Err(XrayError::Config(format!(
                    "unknown sampling strategy '{}' (expected smart, head_tail, random or stratified:<key>)",
                    other
                ))),
            },
        }
    }
}

/// Candidate sampling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Lists up to this length are captured in full
    pub full_capture_threshold: usize,
    /// Items taken from each region (head, middle, tail)
    pub bucket_size: usize,
    pub strategy: SamplingStrategy,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            full_capture_threshold: 100,
            bucket_size: 50,
            strategy: SamplingStrategy::Smart,
        }
    }
}

/// SDK configuration
///
/// Built once at startup (from the environment or with the `with_*`
/// builders) and shared read-only by every trace.
#[derive(Debug, Clone, PartialEq)]
pub struct XrayConfig {
    /// Ingestion API base URL (e.g., "http://localhost:8000")
    pub api_url: String,

    /// Master switch; when off, traces are captured but never sent
    pub enabled: bool,

    /// Deliver on a background worker instead of blocking the caller
    pub async_mode: bool,

    /// Budget for a single delivery attempt
    pub timeout: Duration,

    /// Delivery attempts before the fallback policy applies
    pub max_retries: u32,

    /// Base delay between attempts, doubled after each failure
    pub retry_backoff: Duration,

    pub fallback_mode: FallbackMode,

    /// JSON-lines file used by [`FallbackMode::Log`]
    pub log_file_path: PathBuf,

    pub sampling: SamplingConfig,
}

impl XrayConfig {
    /// Creates a configuration with defaults pointing at `api_url`
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into();
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            enabled: true,
            async_mode: true,
            timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            fallback_mode: FallbackMode::Silent,
            log_file_path: PathBuf::from(".xray/failed_traces.jsonl"),
            sampling: SamplingConfig::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognized variables (all optional):
    /// - XRAY_API_URL (default: http://localhost:8000)
    /// - XRAY_ENABLED (true/false, default: true)
    /// - XRAY_ASYNC_MODE (true/false, default: true)
    /// - XRAY_TIMEOUT (seconds, fractional allowed, default: 5)
    /// - XRAY_MAX_RETRIES (default: 3)
    /// - XRAY_RETRY_BACKOFF_MS (default: 200)
    /// - XRAY_FALLBACK_MODE (silent/log/raise, default: silent)
    /// - XRAY_LOG_FILE_PATH (default: .xray/failed_traces.jsonl)
    /// - XRAY_SAMPLING_THRESHOLD (default: 100)
    /// - XRAY_SAMPLING_BUCKET_SIZE (default: 50)
    /// - XRAY_SAMPLING_STRATEGY (smart/head_tail/random/stratified:<key>)
    ///
    /// A variable that is set but cannot be parsed is an error rather than
    /// a silent fallback to the default.
    pub fn from_env() -> Result<Self, XrayError> {
        let mut config = match std::env::var("XRAY_API_URL") {
            Ok(url) => Self::new(url),
            Err(_) => Self::default(),
        };

        if let Some(enabled) = env_bool("XRAY_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(async_mode) = env_bool("XRAY_ASYNC_MODE")? {
            config.async_mode = async_mode;
        }
        if let Some(secs) = env_parse::<f64>("XRAY_TIMEOUT")? {
            config.timeout = Duration::try_from_secs_f64(secs).map_err(|_| {
                XrayError::Config(format!("XRAY_TIMEOUT must be a positive number, got {}", secs))
            })?;
        }
        if let Some(max_retries) = env_parse::<u32>("XRAY_MAX_RETRIES")? {
            config.max_retries = max_retries;
        }
        if let Some(ms) = env_parse::<u64>("XRAY_RETRY_BACKOFF_MS")? {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(mode) = env_parse::<FallbackMode>("XRAY_FALLBACK_MODE")? {
            config.fallback_mode = mode;
        }
        if let Ok(path) = std::env::var("XRAY_LOG_FILE_PATH") {
            config.log_file_path = PathBuf::from(path);
        }
        if let Some(threshold) = env_parse::<usize>("XRAY_SAMPLING_THRESHOLD")? {
            config.sampling.full_capture_threshold = threshold;
        }
        if let Some(bucket_size) = env_parse::<usize>("XRAY_SAMPLING_BUCKET_SIZE")? {
            config.sampling.bucket_size = bucket_size;
        }
        if let Some(strategy) = env_parse::<SamplingStrategy>("XRAY_SAMPLING_STRATEGY")? {
            config.sampling.strategy = strategy;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_fallback(mut self, mode: FallbackMode) -> Self {
        self.fallback_mode = mode;
        self
    }

    pub fn with_log_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file_path = path.into();
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    /// Number of delivery attempts actually made (at least one)
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay before retrying after the failed attempt `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), XrayError> {
        if self.api_url.is_empty() {
            return Err(XrayError::Config("api_url cannot be empty".to_string()));
        }

        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(XrayError::Config(
                "api_url must start with http:// or https://".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(XrayError::Config("timeout must be greater than 0".to_string()));
        }

        if self.timeout > MAX_TIMEOUT {
            return Err(XrayError::Config(format!(
                "timeout must not exceed {:?}",
                MAX_TIMEOUT
            )));
        }

        if self.sampling.bucket_size == 0 {
            return Err(XrayError::Config(
                "sampling.bucket_size must be greater than 0".to_string(),
            ));
        }

        if self.sampling.full_capture_threshold < self.sampling.bucket_size {
            return Err(XrayError::Config(
                "sampling.full_capture_threshold must be at least sampling.bucket_size".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for XrayConfig {
    fn default() -> Self {
        Self::new("http://localhost:8000")
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>, XrayError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| XrayError::Config(format!("{} has an invalid value '{}': {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, XrayError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(XrayError::Config(format!(
                "{} must be true or false, got '{}'",
                name, raw
            ))),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = XrayConfig::default();
        assert_eq!(config.api_url, "http://localhost:8000");
        assert!(config.enabled);
        assert!(config.async_mode);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.fallback_mode, FallbackMode::Silent);
        assert_eq!(config.sampling.full_capture_threshold, 100);
        assert_eq!(config.sampling.bucket_size, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_url_trailing_slash_trimmed() {
        let config = XrayConfig::new("http://xray.internal:8000/");
        assert_eq!(config.api_url, "http://xray.internal:8000");
    }

    #[test]
    fn test_config_validation() {
        let mut config = XrayConfig::default();
        assert!(config.validate().is_ok());

        config.api_url = "xray.internal".to_string();
        assert!(config.validate().is_err());
        config.api_url = "https://xray.internal".to_string();
        assert!(config.validate().is_ok());

        config.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
        config.timeout = Duration::from_secs(61);
        assert!(config.validate().is_err());
        config.timeout = Duration::from_secs(1);

        config.sampling.bucket_size = 0;
        assert!(config.validate().is_err());
        config.sampling.bucket_size = 200;
        assert!(config.validate().is_err());
        config.sampling.bucket_size = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles() {
        let config = XrayConfig::default().with_retries(4, Duration::from_millis(100));
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let config = XrayConfig::default().with_retries(0, Duration::ZERO);
        assert_eq!(config.attempts(), 1);
    }

    #[test]
    fn test_fallback_mode_parsing() {
        assert_eq!("silent".parse::<FallbackMode>().unwrap(), FallbackMode::Silent);
        assert_eq!("LOG".parse::<FallbackMode>().unwrap(), FallbackMode::Log);
        assert_eq!("raise".parse::<FallbackMode>().unwrap(), FallbackMode::Raise);
        assert!("panic".parse::<FallbackMode>().is_err());
    }

    #[test]
    fn test_sampling_strategy_parsing() {
        assert_eq!("smart".parse::<SamplingStrategy>().unwrap(), SamplingStrategy::Smart);
        assert_eq!(
            "stratified:category".parse::<SamplingStrategy>().unwrap(),
            SamplingStrategy::Stratified {
                key: "category".to_string()
            }
        );
        assert!("stratified:".parse::<SamplingStrategy>().is_err());
        assert!("reservoir".parse::<SamplingStrategy>().is_err());

        let strategy = SamplingStrategy::Stratified {
            key: "brand".to_string(),
        };
        assert_eq!(strategy.to_string().parse::<SamplingStrategy>().unwrap(), strategy);
    }
}
