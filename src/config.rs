//! Processor configuration.
//!
//! Values resolve in three layers: built-in defaults, an optional YAML
//! file, then `REPOSE_*` environment variables (plus `DATABASE_URL` and
//! `REDIS_URL`).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file is not valid YAML for this schema.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the batch run processor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    // Invocation budget
    /// Wall-clock budget of one invocation before it self-continues.
    pub time_budget: Duration,
    /// Age after which a `running` run or output is presumed abandoned.
    pub stale_threshold: Duration,
    /// Upper bound on a single invocation's continuation chain.
    pub max_continuations: u32,

    // Dispatch
    /// Maximum generation calls in flight at once.
    pub output_concurrency: usize,
    /// Queued runs pulled per dispatch cycle.
    pub run_slice_size: usize,
    /// Maximum orphaned outputs processed per drain pass.
    pub orphan_drain_limit: usize,
    /// Poses sampled per (item, shot type) when the run config is silent.
    pub default_poses_per_shot_type: usize,

    // Retry
    /// Retries after the first attempt for transient generation errors.
    pub max_retries: u32,
    /// Delay before retry `n` is `retry_base_delay * n`.
    pub retry_base_delay: Duration,
    /// Pause between output slices of a run.
    pub inter_batch_delay: Duration,

    // Connections
    pub database_url: String,
    pub redis_url: String,
    pub queue_name: String,

    // Generator
    pub generator_url: Option<String>,
    pub generator_api_key: Option<String>,
    pub generator_timeout: Duration,
    pub default_model: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(50),
            stale_threshold: Duration::from_secs(120),
            max_continuations: 500,
            output_concurrency: 8,
            run_slice_size: 3,
            orphan_drain_limit: 200,
            default_poses_per_shot_type: 2,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(2000),
            inter_batch_delay: Duration::from_millis(500),
            database_url: "postgres://localhost/repose".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "repose:invocations".to_string(),
            generator_url: None,
            generator_api_key: None,
            generator_timeout: Duration::from_secs(120),
            default_model: "nano-banana".to_string(),
        }
    }
}

/// On-disk overlay; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    time_budget_secs: Option<u64>,
    stale_threshold_secs: Option<u64>,
    max_continuations: Option<u32>,
    output_concurrency: Option<usize>,
    run_slice_size: Option<usize>,
    orphan_drain_limit: Option<usize>,
    poses_per_shot_type: Option<usize>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    inter_batch_delay_ms: Option<u64>,
    database_url: Option<String>,
    redis_url: Option<String>,
    queue_name: Option<String>,
    generator_url: Option<String>,
    generator_api_key: Option<String>,
    generator_timeout_secs: Option<u64>,
    default_model: Option<String>,
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves defaults, then `path` if given, then the environment, and
    /// validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.overlay_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration from defaults and environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Reads a YAML overlay from disk on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parses a YAML overlay on top of the defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = if content.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(content)?
        };

        let mut config = Self::default();
        if let Some(v) = file.time_budget_secs {
            config.time_budget = Duration::from_secs(v);
        }
        if let Some(v) = file.stale_threshold_secs {
            config.stale_threshold = Duration::from_secs(v);
        }
        if let Some(v) = file.max_continuations {
            config.max_continuations = v;
        }
        if let Some(v) = file.output_concurrency {
            config.output_concurrency = v;
        }
        if let Some(v) = file.run_slice_size {
            config.run_slice_size = v;
        }
        if let Some(v) = file.orphan_drain_limit {
            config.orphan_drain_limit = v;
        }
        if let Some(v) = file.poses_per_shot_type {
            config.default_poses_per_shot_type = v;
        }
        if let Some(v) = file.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = file.retry_base_delay_ms {
            config.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.inter_batch_delay_ms {
            config.inter_batch_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.database_url {
            config.database_url = v;
        }
        if let Some(v) = file.redis_url {
            config.redis_url = v;
        }
        if let Some(v) = file.queue_name {
            config.queue_name = v;
        }
        if file.generator_url.is_some() {
            config.generator_url = file.generator_url;
        }
        if file.generator_api_key.is_some() {
            config.generator_api_key = file.generator_api_key;
        }
        if let Some(v) = file.generator_timeout_secs {
            config.generator_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.default_model {
            config.default_model = v;
        }

        Ok(config)
    }

    /// Applies environment overrides read through `lookup`.
    pub fn overlay_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Invocation budget
        if let Some(val) = lookup("REPOSE_TIME_BUDGET_SECS") {
            let secs: u64 = parse_env_value(&val, "REPOSE_TIME_BUDGET_SECS")?;
            self.time_budget = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("REPOSE_STALE_THRESHOLD_SECS") {
            let secs: u64 = parse_env_value(&val, "REPOSE_STALE_THRESHOLD_SECS")?;
            self.stale_threshold = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("REPOSE_MAX_CONTINUATIONS") {
            self.max_continuations = parse_env_value(&val, "REPOSE_MAX_CONTINUATIONS")?;
        }

        // Dispatch
        if let Some(val) = lookup("REPOSE_OUTPUT_CONCURRENCY") {
            self.output_concurrency = parse_env_value(&val, "REPOSE_OUTPUT_CONCURRENCY")?;
        }

        if let Some(val) = lookup("REPOSE_RUN_SLICE_SIZE") {
            self.run_slice_size = parse_env_value(&val, "REPOSE_RUN_SLICE_SIZE")?;
        }

        if let Some(val) = lookup("REPOSE_ORPHAN_DRAIN_LIMIT") {
            self.orphan_drain_limit = parse_env_value(&val, "REPOSE_ORPHAN_DRAIN_LIMIT")?;
        }

        if let Some(val) = lookup("REPOSE_POSES_PER_SHOT_TYPE") {
            self.default_poses_per_shot_type =
                parse_env_value(&val, "REPOSE_POSES_PER_SHOT_TYPE")?;
        }

        // Retry
        if let Some(val) = lookup("REPOSE_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "REPOSE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("REPOSE_RETRY_BASE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "REPOSE_RETRY_BASE_DELAY_MS")?;
            self.retry_base_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("REPOSE_INTER_BATCH_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "REPOSE_INTER_BATCH_DELAY_MS")?;
            self.inter_batch_delay = Duration::from_millis(ms);
        }

        // Connections
        if let Some(val) = lookup("DATABASE_URL") {
            self.database_url = val;
        }

        if let Some(val) = lookup("REDIS_URL") {
            self.redis_url = val;
        }

        if let Some(val) = lookup("REPOSE_QUEUE_NAME") {
            self.queue_name = val;
        }

        // Generator
        if let Some(val) = lookup("REPOSE_GENERATOR_URL") {
            self.generator_url = Some(val);
        }

        if let Some(val) = lookup("REPOSE_GENERATOR_API_KEY") {
            self.generator_api_key = Some(val);
        }

        if let Some(val) = lookup("REPOSE_GENERATOR_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "REPOSE_GENERATOR_TIMEOUT_SECS")?;
            self.generator_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("REPOSE_DEFAULT_MODEL") {
            self.default_model = val;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_budget.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "time_budget must be greater than 0".to_string(),
            ));
        }

        if self.stale_threshold <= self.time_budget {
            return Err(ConfigError::ValidationFailed(format!(
                "stale_threshold ({:?}) must be longer than time_budget ({:?})",
                self.stale_threshold, self.time_budget
            )));
        }

        if self.output_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "output_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.run_slice_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "run_slice_size must be greater than 0".to_string(),
            ));
        }

        if self.orphan_drain_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "orphan_drain_limit must be greater than 0".to_string(),
            ));
        }

        if self.default_poses_per_shot_type == 0 {
            return Err(ConfigError::ValidationFailed(
                "poses_per_shot_type must be greater than 0".to_string(),
            ));
        }

        if self.database_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if matches!(self.generator_url.as_deref(), Some(url) if url.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "generator_url cannot be empty when set".to_string(),
            ));
        }

        if self.default_model.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_model cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// `stale_threshold` as a signed chrono duration for timestamp math.
    pub fn stale_threshold_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_threshold).unwrap_or(chrono::Duration::MAX)
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_max_continuations(mut self, max: u32) -> Self {
        self.max_continuations = max;
        self
    }

    pub fn with_output_concurrency(mut self, concurrency: usize) -> Self {
        self.output_concurrency = concurrency;
        self
    }

    pub fn with_run_slice_size(mut self, size: usize) -> Self {
        self.run_slice_size = size;
        self
    }

    pub fn with_orphan_drain_limit(mut self, limit: usize) -> Self {
        self.orphan_drain_limit = limit;
        self
    }

    pub fn with_poses_per_shot_type(mut self, count: usize) -> Self {
        self.default_poses_per_shot_type = count;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_generator_url(mut self, url: impl Into<String>) -> Self {
        self.generator_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ProcessorConfig::default();

        assert_eq!(config.time_budget, Duration::from_secs(50));
        assert_eq!(config.stale_threshold, Duration::from_secs(120));
        assert_eq!(config.output_concurrency, 8);
        assert_eq!(config.run_slice_size, 3);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_base_delay, Duration::from_millis(2000));
        assert_eq!(config.inter_batch_delay, Duration::from_millis(500));
        assert_eq!(config.default_poses_per_shot_type, 2);
        assert_eq!(config.default_model, "nano-banana");
        assert!(config.generator_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ProcessorConfig::new()
            .with_time_budget(Duration::from_secs(20))
            .with_output_concurrency(4)
            .with_run_slice_size(1)
            .with_max_retries(5)
            .with_generator_url("http://gen.local/generate")
            .with_default_model("flux");

        assert_eq!(config.time_budget, Duration::from_secs(20));
        assert_eq!(config.output_concurrency, 4);
        assert_eq!(config.run_slice_size, 1);
        assert_eq!(config.max_retries, 5);
        assert_eq!(
            config.generator_url.as_deref(),
            Some("http://gen.local/generate")
        );
        assert_eq!(config.default_model, "flux");
    }

    #[test]
    fn test_env_overlay() {
        let config = ProcessorConfig::default()
            .overlay_env(env(&[
                ("REPOSE_TIME_BUDGET_SECS", "30"),
                ("REPOSE_OUTPUT_CONCURRENCY", " 6 "),
                ("REPOSE_RETRY_BASE_DELAY_MS", "100"),
                ("DATABASE_URL", "postgres://db/other"),
                ("REPOSE_GENERATOR_API_KEY", "secret"),
            ]))
            .unwrap();

        assert_eq!(config.time_budget, Duration::from_secs(30));
        assert_eq!(config.output_concurrency, 6);
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
        assert_eq!(config.database_url, "postgres://db/other");
        assert_eq!(config.generator_api_key.as_deref(), Some("secret"));
        assert_eq!(config.run_slice_size, 3);
    }

    #[test]
    fn test_env_overlay_invalid_value() {
        let err = ProcessorConfig::default()
            .overlay_env(env(&[("REPOSE_MAX_RETRIES", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("REPOSE_MAX_RETRIES"));
    }

    #[test]
    fn test_yaml_overlay() {
        let config = ProcessorConfig::from_yaml_str(
            "time_budget_secs: 40\nrun_slice_size: 5\ndefault_model: flux\n",
        )
        .unwrap();

        assert_eq!(config.time_budget, Duration::from_secs(40));
        assert_eq!(config.run_slice_size, 5);
        assert_eq!(config.default_model, "flux");
        assert_eq!(config.output_concurrency, 8);
    }

    #[test]
    fn test_yaml_rejects_unknown_keys() {
        let err = ProcessorConfig::from_yaml_str("time_budget: 40\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "output_concurrency: 3").unwrap();
        writeln!(file, "stale_threshold_secs: 300").unwrap();

        let config = ProcessorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.output_concurrency, 3);
        assert_eq!(config.stale_threshold, Duration::from_secs(300));
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let config = ProcessorConfig::default().with_output_concurrency(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("output_concurrency"));
    }

    #[test]
    fn test_validation_zero_slice() {
        let config = ProcessorConfig::default().with_run_slice_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_stale_threshold_must_exceed_budget() {
        let config = ProcessorConfig::default()
            .with_time_budget(Duration::from_secs(60))
            .with_stale_threshold(Duration::from_secs(60));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stale_threshold"));
    }

    #[test]
    fn test_validation_empty_database_url() {
        let config = ProcessorConfig::default().with_database_url("");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("database_url"));
    }

    #[test]
    fn test_validation_zero_budget() {
        let config = ProcessorConfig::default().with_time_budget(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
