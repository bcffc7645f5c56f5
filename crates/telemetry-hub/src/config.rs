//! Telemetry Hub configuration.
//!
//! Configuration is loaded from environment variables. Every setting has a
//! default; the bridge store URL is a secret and redacted in Debug output.

use crate::collector::CollectorConfig;
use crate::registry::RegistryLabels;
use secrecy::SecretString;
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Default listener address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:9464";

/// Default `environment` label.
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Default health polling interval in seconds.
pub const DEFAULT_HEALTH_POLL_INTERVAL_SECONDS: u64 = 30;

/// Default shutdown race timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;

/// Default per-service registration deadline in seconds.
pub const DEFAULT_REGISTRATION_TIMEOUT_SECONDS: u64 = 10;

/// Default in-flight request cap.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 64;

/// Default consecutive failures before the circuit opens.
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// Default circuit breaker cool-down in seconds.
pub const DEFAULT_CIRCUIT_BREAKER_COOLDOWN_SECONDS: u64 = 30;

/// Default bridge push interval in seconds.
pub const DEFAULT_BRIDGE_INTERVAL_SECONDS: u64 = 15;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "hub";

/// Service name used for the hub's own meta metrics.
pub const HUB_SERVICE_NAME: &str = "telemetry_hub";

/// Known services and the environment variables that mark them available.
pub const DEFAULT_KNOWN_SERVICES: [(&str, &[&str]); 3] = [
    ("reply_bot", &["DISCORD_TOKEN"]),
    ("admin_api", &["ADMIN_API_TOKEN"]),
    ("memory_service", &["EMBEDDING_API_KEY"]),
];

/// A service the hub may register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownService {
    pub name: String,
    /// Environment variables that must be present and non-empty.
    pub markers: Vec<String>,
    /// Whether every marker was present when configuration was loaded.
    pub available: bool,
}

/// External metrics bridge settings.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Service whose metrics are pushed.
    pub service: String,
    /// Key-value store URL.
    pub redis_url: SecretString,
    pub interval: Duration,
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("service", &self.service)
            .field("redis_url", &"[REDACTED]")
            .field("interval", &self.interval)
            .finish()
    }
}

/// Telemetry Hub configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener address (default: "0.0.0.0:9464").
    pub bind_address: SocketAddr,

    /// Default `environment` label.
    pub environment: String,

    /// Default `version` label.
    pub version: String,

    /// Default `instance` label; unique per hub process.
    pub instance_id: String,

    pub health_poll_interval: Duration,

    pub shutdown_timeout: Duration,

    pub registration_timeout: Duration,

    pub max_concurrent_requests: usize,

    pub circuit_breaker_threshold: u32,

    pub circuit_breaker_cooldown: Duration,

    /// Register available known services at initialize.
    pub auto_discovery: bool,

    /// Allow-list, in configured order.
    pub known_services: Vec<KnownService>,

    /// Disabled when not configured.
    pub bridge: Option<BridgeConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    ///
    /// Availability markers are checked against the same map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_str = vars
            .get("HUB_BIND_ADDRESS")
            .map(String::as_str)
            .unwrap_or(DEFAULT_BIND_ADDRESS);
        let bind_address: SocketAddr = bind_str.parse().map_err(|e| {
            ConfigError::InvalidValue(format!(
                "HUB_BIND_ADDRESS must be a host:port socket address, got '{bind_str}': {e}"
            ))
        })?;

        let environment = vars
            .get("HUB_ENVIRONMENT")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let version = vars
            .get("HUB_VERSION")
            .cloned()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

        let instance_id = vars.get("HUB_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = vars
                .get("HOSTNAME")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let health_poll_interval = Duration::from_secs(parse_positive(
            vars,
            "HUB_HEALTH_POLL_INTERVAL_SECONDS",
            DEFAULT_HEALTH_POLL_INTERVAL_SECONDS,
        )?);
        let shutdown_timeout = Duration::from_secs(parse_positive(
            vars,
            "HUB_SHUTDOWN_TIMEOUT_SECONDS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
        )?);
        let registration_timeout = Duration::from_secs(parse_positive(
            vars,
            "HUB_REGISTRATION_TIMEOUT_SECONDS",
            DEFAULT_REGISTRATION_TIMEOUT_SECONDS,
        )?);
        let max_concurrent_requests = parse_positive(
            vars,
            "HUB_MAX_CONCURRENT_REQUESTS",
            DEFAULT_MAX_CONCURRENT_REQUESTS,
        )?;
        let circuit_breaker_threshold = parse_positive(
            vars,
            "HUB_CIRCUIT_BREAKER_THRESHOLD",
            DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
        )?;
        let circuit_breaker_cooldown = Duration::from_secs(parse_positive(
            vars,
            "HUB_CIRCUIT_BREAKER_COOLDOWN_SECONDS",
            DEFAULT_CIRCUIT_BREAKER_COOLDOWN_SECONDS,
        )?);

        let auto_discovery = match vars.get("HUB_AUTO_DISCOVERY") {
            Some(value) => parse_bool("HUB_AUTO_DISCOVERY", value)?,
            None => true,
        };

        let known_services = parse_known_services(vars)?;
        let bridge = parse_bridge(vars, &known_services)?;

        Ok(Config {
            bind_address,
            environment,
            version,
            instance_id,
            health_poll_interval,
            shutdown_timeout,
            registration_timeout,
            max_concurrent_requests,
            circuit_breaker_threshold,
            circuit_breaker_cooldown,
            auto_discovery,
            known_services,
            bridge,
        })
    }

    /// Default labels for a service registry.
    #[must_use]
    pub fn labels_for(&self, service: &str) -> RegistryLabels {
        RegistryLabels {
            service: service.to_string(),
            environment: self.environment.clone(),
            version: self.version.clone(),
            instance: self.instance_id.clone(),
        }
    }

    #[must_use]
    pub fn allowed_services(&self) -> BTreeSet<String> {
        self.known_services.iter().map(|s| s.name.clone()).collect()
    }

    #[must_use]
    pub fn known_service(&self, name: &str) -> Option<&KnownService> {
        self.known_services.iter().find(|s| s.name == name)
    }

    #[must_use]
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            allowed_services: self.allowed_services(),
            max_concurrent_requests: self.max_concurrent_requests,
            breaker_threshold: self.circuit_breaker_threshold,
            breaker_cooldown: self.circuit_breaker_cooldown,
            labels: self.labels_for(HUB_SERVICE_NAME),
        }
    }
}

/// Parse a strictly positive integer, falling back to `default` when unset.
fn parse_positive<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: fmt::Display,
{
    let Some(value_str) = vars.get(key) else {
        return Ok(default);
    };

    let value: T = value_str.trim().parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{key} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;

    if value <= T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{key} must be greater than 0"
        )));
    }

    Ok(value)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

/// Service names must match `[a-z][a-z0-9_]*`.
#[must_use]
pub fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_known_services(vars: &HashMap<String, String>) -> Result<Vec<KnownService>, ConfigError> {
    let names: Vec<String> = match vars.get("HUB_KNOWN_SERVICES") {
        Some(value) => split_list(value),
        None => DEFAULT_KNOWN_SERVICES
            .iter()
            .map(|(name, _)| (*name).to_string())
            .collect(),
    };

    let mut seen = BTreeSet::new();
    let mut services = Vec::with_capacity(names.len());

    for name in names {
        if !is_valid_service_name(&name) {
            return Err(ConfigError::InvalidValue(format!(
                "HUB_KNOWN_SERVICES entry '{name}' must match [a-z][a-z0-9_]*"
            )));
        }
        if !seen.insert(name.clone()) {
            return Err(ConfigError::InvalidValue(format!(
                "HUB_KNOWN_SERVICES lists '{name}' more than once"
            )));
        }

        let markers_key = format!("HUB_SERVICE_{}_MARKERS", name.to_ascii_uppercase());
        let markers = match vars.get(&markers_key) {
            Some(value) => split_list(value),
            None => DEFAULT_KNOWN_SERVICES
                .iter()
                .find(|(known, _)| *known == name)
                .map(|(_, markers)| markers.iter().map(|m| (*m).to_string()).collect())
                .unwrap_or_default(),
        };

        let available = markers
            .iter()
            .all(|marker| vars.get(marker).is_some_and(|v| !v.trim().is_empty()));

        services.push(KnownService {
            name,
            markers,
            available,
        });
    }

    Ok(services)
}

fn parse_bridge(
    vars: &HashMap<String, String>,
    known_services: &[KnownService],
) -> Result<Option<BridgeConfig>, ConfigError> {
    let service = vars
        .get("HUB_BRIDGE_SERVICE")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let redis_url = vars
        .get("HUB_BRIDGE_REDIS_URL")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let (service, redis_url) = match (service, redis_url) {
        (None, None) => return Ok(None),
        (Some(_), None) => {
            return Err(ConfigError::MissingEnvVar(
                "HUB_BRIDGE_REDIS_URL".to_string(),
            ))
        }
        (None, Some(_)) => {
            return Err(ConfigError::MissingEnvVar("HUB_BRIDGE_SERVICE".to_string()))
        }
        (Some(service), Some(url)) => (service, url),
    };

    if !known_services.iter().any(|s| s.name == service) {
        return Err(ConfigError::InvalidValue(format!(
            "HUB_BRIDGE_SERVICE '{service}' is not in HUB_KNOWN_SERVICES"
        )));
    }

    let interval = Duration::from_secs(parse_positive(
        vars,
        "HUB_BRIDGE_INTERVAL_SECONDS",
        DEFAULT_BRIDGE_INTERVAL_SECONDS,
    )?);

    Ok(Some(BridgeConfig {
        service,
        redis_url: SecretString::from(redis_url),
        interval,
    }))
}
