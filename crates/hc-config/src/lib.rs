//! HttpCourier Configuration
//!
//! Loads the `[output]` table of a TOML document and validates it once into an
//! immutable [`DeliveryConfig`]:
//! - Required options (`url`, `http_method`)
//! - Content type resolution from the body format
//! - `message` format constraints
//! - Status code sets (ignorable / retryable)
//! - Retry policy and transport pass-through options

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use hc_common::{BodyFormat, HttpMethod, MappingTemplate};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Connection ceiling used when `pool_max` is not configured
pub const DEFAULT_POOL_MAX: usize = 50;

/// Largest accepted `pool_max`; one slot per outbound connection
pub const MAX_POOL_MAX: usize = 65_535;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {option}: {reason}")]
    Invalid { option: &'static str, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { option, reason: reason.into() }
    }
}

// ============================================================================
// Raw settings (as written in the config file)
// ============================================================================

/// Root of a configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    pub output: OutputSettings,
}

impl CourierConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

/// HTTP output options before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    /// URL template, e.g. `http://collector/%{[service][name]}`
    pub url: Option<String>,
    pub http_method: Option<HttpMethod>,
    /// Header name -> value template
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    pub content_type: Option<String>,
    /// Output field -> template tree
    pub mapping: Option<IndexMap<String, MappingTemplate>>,
    #[serde(default)]
    pub format: BodyFormat,
    /// Body template for the `message` format
    pub message: Option<String>,
    pub pool_max: Option<usize>,
    #[serde(default)]
    pub ignorable_codes: Vec<u16>,
    /// Replaces the default retryable set (429 and 5xx) when present
    pub retryable_codes: Option<Vec<u16>>,
    #[serde(default = "default_true")]
    pub retry_failed: bool,
    #[serde(default)]
    pub retry_non_retryable_codes: bool,
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub log_request_details: bool,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

fn default_true() -> bool {
    true
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            url: None,
            http_method: None,
            headers: IndexMap::new(),
            content_type: None,
            mapping: None,
            format: BodyFormat::default(),
            message: None,
            pool_max: None,
            ignorable_codes: Vec::new(),
            retryable_codes: None,
            retry_failed: true,
            retry_non_retryable_codes: false,
            max_attempts: None,
            log_request_details: false,
            retry: RetrySettings::default(),
            transport: TransportSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fraction of the delay (0.0 to 1.0) randomised on each retry
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            jitter: 0.1,
        }
    }
}

/// Options handed to the HTTP transport untouched by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub verify_tls: bool,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            verify_tls: true,
            proxy: None,
            user_agent: format!("hc-courier/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Validated configuration
// ============================================================================

/// Status codes that trigger a resubmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryableCodes {
    /// 429 and every 5xx
    Default,
    Explicit(BTreeSet<u16>),
}

impl RetryableCodes {
    pub fn contains(&self, code: u16) -> bool {
        match self {
            RetryableCodes::Default => code == 429 || (500..=599).contains(&code),
            RetryableCodes::Explicit(codes) => codes.contains(&code),
        }
    }
}

/// Retry behaviour of the delivery engine
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub retryable_codes: RetryableCodes,
    /// When false, retryable outcomes are reported as failures instead
    pub retry_failed: bool,
    /// Retry statuses that would otherwise be terminal (non-2xx, non-retryable)
    pub retry_non_retryable_codes: bool,
    /// Cap on attempts per event; `None` retries until success or shutdown
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let settings = RetrySettings::default();
        Self {
            retryable_codes: RetryableCodes::Default,
            retry_failed: true,
            retry_non_retryable_codes: false,
            max_attempts: None,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            jitter: settings.jitter,
        }
    }
}

/// Immutable, validated delivery configuration
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub url: String,
    pub method: HttpMethod,
    pub headers: IndexMap<String, String>,
    pub content_type: String,
    pub format: BodyFormat,
    pub mapping: Option<IndexMap<String, MappingTemplate>>,
    pub message: Option<String>,
    pub pool_max: usize,
    pub ignorable_codes: BTreeSet<u16>,
    pub retry: RetryPolicy,
    pub transport: TransportSettings,
    pub log_request_details: bool,
}

impl DeliveryConfig {
    pub fn is_ignorable(&self, code: u16) -> bool {
        self.ignorable_codes.contains(&code)
    }
}

impl OutputSettings {
    /// Shorthand for the two required options
    pub fn new(url: impl Into<String>, http_method: HttpMethod) -> Self {
        Self {
            url: Some(url.into()),
            http_method: Some(http_method),
            ..Default::default()
        }
    }

    /// Validate the settings into a [`DeliveryConfig`]
    pub fn validate(self) -> Result<DeliveryConfig, ConfigError> {
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::Missing("url"))?;
        let method = self.http_method.ok_or(ConfigError::Missing("http_method"))?;

        let mut mapping = self.mapping;
        if self.format == BodyFormat::Message {
            if self.message.is_none() {
                return Err(ConfigError::Missing("message"));
            }
            if self.content_type.is_none() {
                return Err(ConfigError::invalid(
                    "content_type",
                    "must be set when the message format is used",
                ));
            }
            if mapping.take().is_some() {
                warn!("mapping is not supported and will be ignored if message format is used");
            }
        }

        let content_type = match self.content_type {
            Some(ct) if !ct.trim().is_empty() => ct,
            Some(_) => return Err(ConfigError::invalid("content_type", "must not be empty")),
            None => self
                .format
                .default_content_type()
                .map(str::to_string)
                .ok_or(ConfigError::Missing("content_type"))?,
        };

        let pool_max = self.pool_max.unwrap_or(DEFAULT_POOL_MAX);
        if pool_max == 0 {
            return Err(ConfigError::invalid("pool_max", "must be at least 1"));
        }
        if pool_max > MAX_POOL_MAX {
            return Err(ConfigError::invalid(
                "pool_max",
                format!("must not exceed {}", MAX_POOL_MAX),
            ));
        }

        let ignorable_codes = status_set("ignorable_codes", &self.ignorable_codes)?;
        let retryable_codes = match self.retryable_codes {
            Some(codes) => RetryableCodes::Explicit(status_set("retryable_codes", &codes)?),
            None => RetryableCodes::Default,
        };
        if let RetryableCodes::Explicit(ref codes) = retryable_codes {
            if let Some(code) = codes.intersection(&ignorable_codes).next() {
                return Err(ConfigError::invalid(
                    "retryable_codes",
                    format!("{} is also listed in ignorable_codes", code),
                ));
            }
        }

        if self.max_attempts == Some(0) {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must be between 0.0 and 1.0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.initial_backoff_ms",
                "must not exceed retry.max_backoff_ms",
            ));
        }

        let retry = RetryPolicy {
            retryable_codes,
            retry_failed: self.retry_failed,
            retry_non_retryable_codes: self.retry_non_retryable_codes,
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            jitter: self.retry.jitter,
        };

        Ok(DeliveryConfig {
            url,
            method,
            headers: self.headers,
            content_type,
            format: self.format,
            mapping,
            message: self.message,
            pool_max,
            ignorable_codes,
            retry,
            transport: self.transport,
            log_request_details: self.log_request_details,
        })
    }
}

fn status_set(option: &'static str, codes: &[u16]) -> Result<BTreeSet<u16>, ConfigError> {
    codes
        .iter()
        .map(|&code| {
            if (100..=599).contains(&code) {
                Ok(code)
            } else {
                Err(ConfigError::invalid(option, format!("{} is not an HTTP status code", code)))
            }
        })
        .collect()
}
