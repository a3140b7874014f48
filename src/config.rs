use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TollwayError};
use crate::gateway::{FastSpringConfig, GatewayKind, PaddleConfig, PayProGlobalConfig, ProductBindings};
use crate::provisioning::HttpProvisioningConfig;
use crate::retry::RetryPolicy;
use crate::utils::{get_env_parsed, get_env_with_prefix};

/// Main configuration for a Tollway service.
///
/// Holds gateway credentials as [`secrecy::SecretString`], so it is never
/// serialized and its `Debug` output redacts them.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub gateways: GatewaysConfig,
    /// `None` until a provisioning URL is configured.
    pub provisioning: Option<HttpProvisioningConfig>,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub free_tier: FreeTierConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

/// Adapter credentials and the product binding table.
///
/// An adapter is registered only when its section is present.
#[derive(Debug, Clone)]
pub struct GatewaysConfig {
    pub default_gateway: Option<GatewayKind>,
    /// Applied to every adapter's HTTP client.
    pub timeout_seconds: u64,
    pub fastspring: Option<FastSpringConfig>,
    pub paddle: Option<PaddleConfig>,
    pub payproglobal: Option<PayProGlobalConfig>,
    pub product_bindings: ProductBindings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeTierConfig {
    pub package_name: String,
    pub abuse_prevention: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for GatewaysConfig {
    fn default() -> Self {
        Self {
            default_gateway: None,
            timeout_seconds: default_timeout_seconds(),
            fastspring: None,
            paddle: None,
            payproglobal: None,
            product_bindings: ProductBindings::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 300,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
        }
    }
}

impl Default for FreeTierConfig {
    fn default() -> Self {
        Self {
            package_name: crate::domain::FREE_PACKAGE_NAME.to_string(),
            abuse_prevention: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_seconds() -> u64 {
    20
}

const TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=120;

impl ServerConfig {
    pub fn addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl GatewaysConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Whether credentials for `gateway` are present.
    pub fn is_configured(&self, gateway: GatewayKind) -> bool {
        match gateway {
            GatewayKind::FastSpring => self.fastspring.is_some(),
            GatewayKind::Paddle => self.paddle.is_some(),
            GatewayKind::PayProGlobal => self.payproglobal.is_some(),
        }
    }

    pub fn configured(&self) -> Vec<GatewayKind> {
        GatewayKind::ALL
            .into_iter()
            .filter(|kind| self.is_configured(*kind))
            .collect()
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_ms))
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Config {
    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for an invalid address or log level, zero retry
    /// attempts, a timeout outside 1..=120 seconds, a zero scheduler
    /// interval, or a default gateway without credentials.
    pub fn validate(&self) -> Result<()> {
        self.server.addr().map_err(|e| {
            TollwayError::bad_request(format!(
                "Invalid server address {}:{} - {}",
                self.server.host, self.server.port, e
            ))
        })?;

        if self.server.port == 0 {
            return Err(TollwayError::bad_request("Server port must be greater than 0"));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(TollwayError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(TollwayError::bad_request(
                "Retry max_attempts must be greater than 0",
            ));
        }

        if !TIMEOUT_RANGE.contains(&self.gateways.timeout_seconds) {
            return Err(TollwayError::bad_request(format!(
                "Gateway timeout must be between 1 and 120 seconds, got {}",
                self.gateways.timeout_seconds
            )));
        }

        if let Some(provisioning) = &self.provisioning {
            if !TIMEOUT_RANGE.contains(&provisioning.timeout.as_secs()) {
                return Err(TollwayError::bad_request(format!(
                    "Provisioning timeout must be between 1 and 120 seconds, got {}",
                    provisioning.timeout.as_secs()
                )));
            }
            if provisioning.base_url.trim().is_empty() {
                return Err(TollwayError::bad_request("Provisioning URL must not be empty"));
            }
        }

        if self.scheduler.enabled && self.scheduler.interval_seconds == 0 {
            return Err(TollwayError::bad_request(
                "Scheduler interval must be greater than 0 when enabled",
            ));
        }

        if let Some(default) = self.gateways.default_gateway {
            if !self.gateways.is_configured(default) {
                return Err(TollwayError::bad_request(format!(
                    "Default gateway '{}' has no adapter configuration",
                    default
                )));
            }
        }

        if self.free_tier.package_name.trim().is_empty() {
            return Err(TollwayError::bad_request("Free package name must not be empty"));
        }

        Ok(())
    }
}

/// Builder for [`Config`] with environment variable support.
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
    /// Values from the environment that could not be parsed; reported by `build()`.
    errors: Vec<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            errors: Vec::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_default_gateway(mut self, gateway: GatewayKind) -> Self {
        self.config.gateways.default_gateway = Some(gateway);
        self
    }

    pub fn with_gateway_timeout(mut self, seconds: u64) -> Self {
        self.config.gateways.timeout_seconds = seconds;
        self
    }

    pub fn with_fastspring(mut self, fastspring: FastSpringConfig) -> Self {
        self.config.gateways.fastspring = Some(fastspring);
        self
    }

    pub fn with_paddle(mut self, paddle: PaddleConfig) -> Self {
        self.config.gateways.paddle = Some(paddle);
        self
    }

    pub fn with_payproglobal(mut self, payproglobal: PayProGlobalConfig) -> Self {
        self.config.gateways.payproglobal = Some(payproglobal);
        self
    }

    pub fn with_product_bindings(mut self, bindings: ProductBindings) -> Self {
        self.config.gateways.product_bindings = bindings;
        self
    }

    pub fn with_provisioning(mut self, provisioning: HttpProvisioningConfig) -> Self {
        self.config.provisioning = Some(provisioning);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.config.retry = RetryConfig {
            max_attempts,
            backoff_ms,
        };
        self
    }

    pub fn with_scheduler(mut self, enabled: bool, interval_seconds: u64) -> Self {
        self.config.scheduler = SchedulerConfig {
            enabled,
            interval_seconds,
        };
        self
    }

    pub fn with_free_package_name(mut self, name: impl Into<String>) -> Self {
        self.config.free_tier.package_name = name.into();
        self
    }

    pub fn with_abuse_prevention(mut self, enabled: bool) -> Self {
        self.config.free_tier.abuse_prevention = enabled;
        self
    }

    /// Parse an environment value, recording a failure for `build()`.
    fn env_parsed<T: FromStr>(&mut self, key: &str) -> Option<T> {
        get_env_parsed(key).unwrap_or_else(|e| {
            self.errors.push(e);
            None
        })
    }

    /// Load configuration from environment variables with TOLLWAY_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        // TOLLWAY_PORT first, then PORT for platforms that inject it
        if let Some(port) = self.env_parsed("PORT") {
            self.config.server.port = port;
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = self.env_parsed("LOG_JSON") {
            self.config.logging.json = json;
        }

        self.load_gateways_from_env();
        self.load_provisioning_from_env();

        if let Some(attempts) = self.env_parsed("RETRY_MAX_ATTEMPTS") {
            self.config.retry.max_attempts = attempts;
        }
        if let Some(backoff) = self.env_parsed("RETRY_BACKOFF_MS") {
            self.config.retry.backoff_ms = backoff;
        }

        if let Some(enabled) = self.env_parsed("SCHEDULER_ENABLED") {
            self.config.scheduler.enabled = enabled;
        }
        if let Some(interval) = self.env_parsed("SCHEDULER_INTERVAL_SECONDS") {
            self.config.scheduler.interval_seconds = interval;
        }

        if let Some(enabled) = self.env_parsed("FREE_TIER_ABUSE_PREVENTION") {
            self.config.free_tier.abuse_prevention = enabled;
        }
        if let Some(name) = get_env_with_prefix("FREE_PACKAGE_NAME") {
            self.config.free_tier.package_name = name;
        }

        self
    }

    fn load_gateways_from_env(&mut self) {
        let timeout = self.env_parsed("GATEWAY_TIMEOUT_SECONDS");
        let gateways = &mut self.config.gateways;

        if let Some(name) = get_env_with_prefix("DEFAULT_GATEWAY") {
            match name.parse::<GatewayKind>() {
                Ok(kind) => gateways.default_gateway = Some(kind),
                Err(e) => self.errors.push(format!("DEFAULT_GATEWAY: {}", e)),
            }
        }
        if let Some(timeout) = timeout {
            gateways.timeout_seconds = timeout;
        }

        if let (Some(username), Some(password), Some(secret)) = (
            get_env_with_prefix("FASTSPRING_USERNAME"),
            get_env_with_prefix("FASTSPRING_PASSWORD"),
            get_env_with_prefix("FASTSPRING_WEBHOOK_SECRET"),
        ) {
            let mut fastspring = FastSpringConfig::new(username, password, secret);
            if let Some(url) = get_env_with_prefix("FASTSPRING_API_URL") {
                fastspring = fastspring.with_api_url(url);
            }
            gateways.fastspring = Some(fastspring);
        }

        if let (Some(api_key), Some(public_key)) = (
            get_env_with_prefix("PADDLE_API_KEY"),
            get_env_with_prefix("PADDLE_PUBLIC_KEY"),
        ) {
            let mut paddle = PaddleConfig::new(api_key, public_key);
            if let Some(url) = get_env_with_prefix("PADDLE_API_URL") {
                paddle = paddle.with_api_url(url);
            }
            gateways.paddle = Some(paddle);
        }

        if let (Some(vendor), Some(secret), Some(webhook_secret)) = (
            get_env_with_prefix("PAYPRO_VENDOR_ACCOUNT_ID"),
            get_env_with_prefix("PAYPRO_API_SECRET"),
            get_env_with_prefix("PAYPRO_WEBHOOK_SECRET"),
        ) {
            let mut payproglobal = PayProGlobalConfig::new(vendor, secret, webhook_secret);
            if let Some(url) = get_env_with_prefix("PAYPRO_API_URL") {
                payproglobal = payproglobal.with_api_url(url);
            }
            if let Some(url) = get_env_with_prefix("PAYPRO_CHECKOUT_URL") {
                payproglobal = payproglobal.with_checkout_url(url);
            }
            gateways.payproglobal = Some(payproglobal);
        }

        if let Some(raw) = get_env_with_prefix("PRODUCT_BINDINGS") {
            match ProductBindings::parse(&raw) {
                Ok(bindings) => gateways.product_bindings = bindings,
                Err(e) => self.errors.push(format!("PRODUCT_BINDINGS: {}", e)),
            }
        }
    }

    fn load_provisioning_from_env(&mut self) {
        let Some(url) = get_env_with_prefix("PROVISIONING_URL") else {
            return;
        };
        let key = get_env_with_prefix("PROVISIONING_SUBSCRIPTION_KEY").unwrap_or_default();

        let mut provisioning = HttpProvisioningConfig::new(url, key);
        if let Some(timeout) = self.env_parsed("PROVISIONING_TIMEOUT_SECONDS") {
            provisioning = provisioning.with_timeout(Duration::from_secs(timeout));
        }
        if let Some(retries) = self.env_parsed("PROVISIONING_HTTP_RETRIES") {
            provisioning = provisioning.with_http_retries(retries);
        }
        self.config.provisioning = Some(provisioning);
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error listing every environment value that could not be
    /// parsed (numbers, booleans, gateway names, product bindings), or the
    /// first problem [`Config::validate`] finds.
    pub fn build(self) -> Result<Config> {
        if !self.errors.is_empty() {
            return Err(TollwayError::bad_request(format!(
                "Invalid configuration: {}",
                self.errors.join("; ")
            )));
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
