//! Validated pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default collector endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

/// Validated configuration for the whole pipeline.
///
/// Built via [`PipelineConfig::builder`]; invalid values are rejected at
/// build time rather than surfacing as runtime misbehavior.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    instrumentation_key: String,
    endpoint_url: String,
    storage_root: PathBuf,
    max_batch_count: usize,
    max_batch_interval: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
    telemetry_disabled: bool,
    max_file_count: usize,
    max_in_flight: usize,
    send_interval: Duration,
    session_expiration: Duration,
    session_renewal: Duration,
    developer_mode: bool,
}

/// Errors produced when validating pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Instrumentation key must be non-empty.
    EmptyInstrumentationKey,
    /// Endpoint URL failed to parse.
    InvalidEndpoint(String),
    /// `max_batch_count` must be > 0.
    InvalidBatchCount(usize),
    /// `max_file_count` must be > 0.
    InvalidFileCount(usize),
    /// `max_in_flight` must be > 0.
    InvalidInFlightLimit(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EmptyInstrumentationKey => {
                write!(f, "instrumentation_key must be non-empty")
            }
            ConfigError::InvalidEndpoint(url) => write!(f, "endpoint_url is not a valid URL: {}", url),
            ConfigError::InvalidBatchCount(n) => {
                write!(f, "max_batch_count must be > 0 (got {})", n)
            }
            ConfigError::InvalidFileCount(n) => write!(f, "max_file_count must be > 0 (got {})", n),
            ConfigError::InvalidInFlightLimit(n) => {
                write!(f, "max_in_flight must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl PipelineConfig {
    /// Construct a builder with default thresholds.
    pub fn builder(
        instrumentation_key: impl Into<String>,
        storage_root: impl Into<PathBuf>,
    ) -> PipelineConfigBuilder {
        PipelineConfigBuilder::new(instrumentation_key.into(), storage_root.into())
    }

    pub fn instrumentation_key(&self) -> &str {
        &self.instrumentation_key
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn storage_root(&self) -> &PathBuf {
        &self.storage_root
    }

    /// Batch size that triggers an immediate flush.
    pub fn max_batch_count(&self) -> usize {
        self.max_batch_count
    }

    /// Longest a non-empty queue waits before flushing.
    pub fn max_batch_interval(&self) -> Duration {
        self.max_batch_interval
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn telemetry_disabled(&self) -> bool {
        self.telemetry_disabled
    }

    /// Per-priority-directory cap on persisted batch files.
    pub fn max_file_count(&self) -> usize {
        self.max_file_count
    }

    /// Cap on simultaneous outbound HTTP requests.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Cadence of the background send loop.
    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    /// Inactivity-independent lifetime of a session.
    pub fn session_expiration(&self) -> Duration {
        self.session_expiration
    }

    /// Inactivity window after which a session renews.
    pub fn session_renewal(&self) -> Duration {
        self.session_renewal
    }

    /// Verbose diagnostics: response bodies are logged on success and misuse
    /// logs at `error!` instead of `debug!`.
    pub fn developer_mode(&self) -> bool {
        self.developer_mode
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    fn new(instrumentation_key: String, storage_root: PathBuf) -> Self {
        Self {
            config: PipelineConfig {
                instrumentation_key,
                endpoint_url: DEFAULT_ENDPOINT.to_string(),
                storage_root,
                max_batch_count: 100,
                max_batch_interval: Duration::from_secs(15),
                connect_timeout: Duration::from_secs(15),
                read_timeout: Duration::from_secs(10),
                telemetry_disabled: false,
                max_file_count: 50,
                max_in_flight: 10,
                send_interval: Duration::from_secs(10),
                session_expiration: Duration::from_secs(24 * 3600),
                session_renewal: Duration::from_secs(30 * 60),
                developer_mode: false,
            },
        }
    }

    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.config.endpoint_url = url.into();
        self
    }

    pub fn max_batch_count(mut self, count: usize) -> Self {
        self.config.max_batch_count = count;
        self
    }

    pub fn max_batch_interval(mut self, interval: Duration) -> Self {
        self.config.max_batch_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn telemetry_disabled(mut self, disabled: bool) -> Self {
        self.config.telemetry_disabled = disabled;
        self
    }

    pub fn max_file_count(mut self, count: usize) -> Self {
        self.config.max_file_count = count;
        self
    }

    pub fn max_in_flight(mut self, count: usize) -> Self {
        self.config.max_in_flight = count;
        self
    }

    pub fn send_interval(mut self, interval: Duration) -> Self {
        self.config.send_interval = interval;
        self
    }

    pub fn session_expiration(mut self, expiration: Duration) -> Self {
        self.config.session_expiration = expiration;
        self
    }

    pub fn session_renewal(mut self, renewal: Duration) -> Self {
        self.config.session_renewal = renewal;
        self
    }

    pub fn developer_mode(mut self, enabled: bool) -> Self {
        self.config.developer_mode = enabled;
        self
    }

    /// Validate and produce the final configuration.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let c = &self.config;
        if c.instrumentation_key.trim().is_empty() {
            return Err(ConfigError::EmptyInstrumentationKey);
        }
        if reqwest::Url::parse(&c.endpoint_url).is_err() {
            return Err(ConfigError::InvalidEndpoint(c.endpoint_url.clone()));
        }
        if c.max_batch_count == 0 {
            return Err(ConfigError::InvalidBatchCount(c.max_batch_count));
        }
        if c.max_file_count == 0 {
            return Err(ConfigError::InvalidFileCount(c.max_file_count));
        }
        if c.max_in_flight == 0 {
            return Err(ConfigError::InvalidInFlightLimit(c.max_in_flight));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> PipelineConfigBuilder {
        PipelineConfig::builder("ikey-1234", "/tmp/blackbox-test")
    }

    #[test]
    fn defaults_match_contract() {
        let config = builder().build().unwrap();
        assert_eq!(config.max_batch_count(), 100);
        assert_eq!(config.max_batch_interval(), Duration::from_secs(15));
        assert_eq!(config.max_file_count(), 50);
        assert_eq!(config.max_in_flight(), 10);
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.session_expiration(), Duration::from_secs(24 * 3600));
        assert_eq!(config.session_renewal(), Duration::from_secs(30 * 60));
        assert_eq!(config.endpoint_url(), DEFAULT_ENDPOINT);
        assert!(!config.telemetry_disabled());
        assert!(!config.developer_mode());
    }

    #[test]
    fn rejects_empty_instrumentation_key() {
        let err = PipelineConfig::builder("  ", "/tmp/x").build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyInstrumentationKey);
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let err = builder().endpoint_url("not a url").build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEndpoint(_)));
    }

    #[test]
    fn rejects_zero_thresholds() {
        assert!(matches!(
            builder().max_batch_count(0).build().unwrap_err(),
            ConfigError::InvalidBatchCount(0)
        ));
        assert!(matches!(
            builder().max_file_count(0).build().unwrap_err(),
            ConfigError::InvalidFileCount(0)
        ));
        assert!(matches!(
            builder().max_in_flight(0).build().unwrap_err(),
            ConfigError::InvalidInFlightLimit(0)
        ));
    }

    #[test]
    fn error_display_names_the_field() {
        let msg = format!("{}", ConfigError::InvalidBatchCount(0));
        assert!(msg.contains("max_batch_count"));
    }
}
