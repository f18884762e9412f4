//! Configuration module for Forwardlytics.
//!
//! Loads configuration from an optional TOML file with environment variable
//! substitution, then applies environment overrides.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${FORWARDLYTICS_API_KEY}"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 100
//!
//! [integrations.mixpanel]
//! token = "${MIXPANEL_TOKEN}"
//! ```
//!
//! Integration credentials left out of the file are read from their
//! environment variable on every call (see [`Credential`]).

use crate::integrations::{
    drift, drip, intercom, keen, mixpanel, Auth, Credential, Drift, Drip, HttpTransport,
    Intercom, Keen, Mixpanel,
};
use crate::registry::Registry;
use crate::retry::RetryPolicy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_PATH_VAR: &str = "FORWARDLYTICS_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "config/forwardlytics.toml";

pub const PORT_VAR: &str = "PORT";

pub const API_KEY_VAR: &str = "FORWARDLYTICS_API_KEY";

pub const MAX_RETRIES_VAR: &str = "FORWARDLYTICS_MAX_RETRIES";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid substitution pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ForwardlyticsConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Retry configuration for destination calls
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10000
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Per-integration settings
#[derive(Debug, Deserialize, Clone)]
pub struct IntegrationsConfig {
    /// Timeout for every destination request
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub drift: DriftConfig,

    #[serde(default)]
    pub drip: DripConfig,

    #[serde(default)]
    pub intercom: IntercomConfig,

    #[serde(default)]
    pub mixpanel: MixpanelConfig,
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            drift: DriftConfig::default(),
            drip: DripConfig::default(),
            intercom: IntercomConfig::default(),
            mixpanel: MixpanelConfig::default(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriftConfig {
    #[serde(default = "default_drift_url")]
    pub base_url: String,

    #[serde(default)]
    pub org_id: Option<String>,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            base_url: default_drift_url(),
            org_id: None,
        }
    }
}

fn default_drift_url() -> String {
    drift::DEFAULT_BASE_URL.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DripConfig {
    #[serde(default = "default_drip_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default)]
    pub account_id: Option<String>,
}

impl Default for DripConfig {
    fn default() -> Self {
        Self {
            base_url: default_drip_url(),
            api_token: None,
            account_id: None,
        }
    }
}

fn default_drip_url() -> String {
    drip::DEFAULT_BASE_URL.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntercomConfig {
    #[serde(default = "default_intercom_url")]
    pub base_url: String,

    #[serde(default)]
    pub app_id: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for IntercomConfig {
    fn default() -> Self {
        Self {
            base_url: default_intercom_url(),
            app_id: None,
            api_key: None,
        }
    }
}

fn default_intercom_url() -> String {
    intercom::DEFAULT_BASE_URL.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MixpanelConfig {
    #[serde(default = "default_mixpanel_url")]
    pub base_url: String,

    #[serde(default)]
    pub token: Option<String>,
}

impl Default for MixpanelConfig {
    fn default() -> Self {
        Self {
            base_url: default_mixpanel_url(),
            token: None,
        }
    }
}

fn default_mixpanel_url() -> String {
    mixpanel::DEFAULT_BASE_URL.to_string()
}

impl ForwardlyticsConfig {
    /// Load configuration from the default path or FORWARDLYTICS_CONFIG env var,
    /// then apply environment overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|var| env::var(var).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        Self::parse(&content, |var| env::var(var).ok())
    }

    /// Parse TOML content, substituting `${VAR}` through `lookup`.
    pub fn parse<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = substitute_vars(content, lookup)?;

        debug!("Parsing TOML configuration");
        let config: ForwardlyticsConfig = toml::from_str(&content)?;

        info!(
            port = config.server.port,
            max_retries = config.retry.max_retries,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Overlay values from the environment (or any other lookup).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(PORT_VAR) {
            self.server.port = port.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("{} must be a port number, got '{}'", PORT_VAR, port))
            })?;
        }

        if let Some(api_key) = lookup(API_KEY_VAR).filter(|k| !k.is_empty()) {
            self.server.api_key = Some(api_key);
        }

        if let Some(retries) = lookup(MAX_RETRIES_VAR) {
            self.retry.max_retries = retries.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "{} must be a non-negative integer, got '{}'",
                    MAX_RETRIES_VAR, retries
                ))
            })?;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        let urls = [
            (drift::NAME, &self.integrations.drift.base_url),
            (drip::NAME, &self.integrations.drip.base_url),
            (intercom::NAME, &self.integrations.intercom.base_url),
            (mixpanel::NAME, &self.integrations.mixpanel.base_url),
        ];

        for (name, url) in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "Integration '{}' base_url must start with http:// or https://",
                    name
                )));
            }
        }

        if let Some(key) = &self.server.api_key {
            if key.contains("${") {
                warn!("API key contains unsubstituted environment variable");
            }
        }

        Ok(())
    }

    /// The API key clients must present.
    pub fn api_key(&self) -> Result<&str, ConfigError> {
        match self.server.api_key.as_deref() {
            Some(key) if !key.is_empty() && !key.contains("${") => Ok(key),
            _ => Err(ConfigError::MissingField(format!(
                "server.api_key (or {})",
                API_KEY_VAR
            ))),
        }
    }

    /// Build the registry holding every known integration.
    ///
    /// All adapters are registered; whether each one is used is decided per
    /// event by its credentials.
    pub fn build_registry(&self) -> Registry {
        let client = Client::new();
        let timeout = Duration::from_millis(self.integrations.timeout_ms);
        let integrations = &self.integrations;

        let transport = |base_url: &str, auth: Auth| {
            Arc::new(
                HttpTransport::new(base_url, client.clone())
                    .with_timeout(timeout)
                    .with_auth(auth),
            )
        };

        let registry = Registry::new();

        let org_id = Credential::from_config(integrations.drift.org_id.as_deref(), drift::ORG_ID_VAR);
        registry.register(
            drift::NAME,
            Arc::new(Drift::new(org_id, transport(&integrations.drift.base_url, Auth::None))),
        );

        let api_token = Credential::from_config(
            integrations.drip.api_token.as_deref(),
            drip::API_TOKEN_VAR,
        );
        let account_id = Credential::from_config(
            integrations.drip.account_id.as_deref(),
            drip::ACCOUNT_ID_VAR,
        );
        let drip_auth = Auth::Basic {
            username: api_token.clone(),
            password: None,
        };
        registry.register(
            drip::NAME,
            Arc::new(Drip::new(
                api_token,
                account_id,
                transport(&integrations.drip.base_url, drip_auth),
            )),
        );

        let app_id = Credential::from_config(
            integrations.intercom.app_id.as_deref(),
            intercom::APP_ID_VAR,
        );
        let api_key = Credential::from_config(
            integrations.intercom.api_key.as_deref(),
            intercom::API_KEY_VAR,
        );
        let intercom_auth = Auth::Basic {
            username: app_id.clone(),
            password: Some(api_key.clone()),
        };
        registry.register(
            intercom::NAME,
            Arc::new(Intercom::new(
                app_id,
                api_key,
                transport(&integrations.intercom.base_url, intercom_auth),
            )),
        );

        registry.register(keen::NAME, Arc::new(Keen));

        let token = Credential::from_config(
            integrations.mixpanel.token.as_deref(),
            mixpanel::TOKEN_VAR,
        );
        registry.register(
            mixpanel::NAME,
            Arc::new(Mixpanel::new(
                token,
                transport(&integrations.mixpanel.base_url, Auth::None),
            )),
        );

        info!(integrations = ?registry.list(), "Integrations registered");

        registry
    }
}

/// Substitute variables in the format ${VAR_NAME}
///
/// Unknown variables keep their placeholder.
fn substitute_vars<F>(content: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;

    let substituted = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match lookup(var_name) {
            Some(value) => value,
            None => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    });

    Ok(substituted.into_owned())
}
