//! Configuration structures and parsing for conduit

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// OpenTelemetry export settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Runtime feature flag overrides
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Downstream listeners
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Upstream clusters
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut cluster_names = HashSet::new();
        for cluster in &self.clusters {
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate cluster name '{}'",
                    cluster.name
                )));
            }
            if cluster.hosts.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Cluster '{}' has no hosts",
                    cluster.name
                )));
            }
            if cluster.max_connections == 0 {
                return Err(ConfigError::Validation(format!(
                    "Cluster '{}' needs max_connections of at least 1",
                    cluster.name
                )));
            }
        }

        let mut listener_names = HashSet::new();
        for listener in &self.listeners {
            if !listener_names.insert(listener.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate listener name '{}'",
                    listener.name
                )));
            }

            if listener.address.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Listener '{}' has no address",
                    listener.name
                )));
            }

            if let Some(tracing) = &listener.tracing {
                if !(0.0..=100.0).contains(&tracing.random_sampling) {
                    return Err(ConfigError::Validation(format!(
                        "Listener '{}' random_sampling must be within 0..=100, got {}",
                        listener.name, tracing.random_sampling
                    )));
                }
            }

            for route in &listener.routes {
                match (&route.cluster, &route.direct_response) {
                    (None, None) => {
                        return Err(ConfigError::Validation(format!(
                            "Route '{}' needs either a cluster or a direct_response",
                            route.name
                        )));
                    }
                    (Some(cluster), _) if !cluster_names.contains(cluster.as_str()) => {
                        return Err(ConfigError::Validation(format!(
                            "Route '{}' references unknown cluster '{}'",
                            route.name, cluster
                        )));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Find a cluster by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Global settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Default log level when none is given on the command line
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds to wait for connections to drain on shutdown
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_grace_period() -> u64 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            grace_period: default_grace_period(),
        }
    }
}

/// OTLP export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable OpenTelemetry export
    #[serde(default)]
    pub enabled: bool,

    /// OTLP collector endpoint
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Service name reported with every span
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Sampling ratio between 0.0 and 1.0
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "conduit".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

/// Runtime feature flags, keyed by flag name, valued in percent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub overrides: HashMap<String, f64>,
}

/// Downstream listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Listener name, used in logs
    pub name: String,

    /// Bind address, e.g. "0.0.0.0:9000"
    pub address: String,

    /// Downstream codec name
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Prefix for stats emitted by this listener
    #[serde(default)]
    pub stat_prefix: Option<String>,

    /// Close idle connections once the proxy starts draining
    #[serde(default = "default_true")]
    pub drain_close: bool,

    /// Stream tracing
    #[serde(default)]
    pub tracing: Option<StreamTracingConfig>,

    /// Ordered stream filters
    #[serde(default)]
    pub filters: Vec<FilterEntry>,

    /// Ordered routes, first match wins
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl ListenerConfig {
    /// Stat prefix, falling back to the listener name
    pub fn stat_prefix(&self) -> &str {
        self.stat_prefix.as_deref().unwrap_or(&self.name)
    }
}

fn default_codec() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

/// Per-listener stream tracing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTracingConfig {
    /// Percentage of streams to trace
    #[serde(default = "default_random_sampling")]
    pub random_sampling: f64,

    /// Span direction
    #[serde(default)]
    pub operation_name: OperationName,

    /// Record extra detail on spans
    #[serde(default)]
    pub verbose: bool,

    /// Maximum length of the path tag
    #[serde(default = "default_max_path_tag_length")]
    pub max_path_tag_length: usize,

    /// Static tags added to every span
    #[serde(default)]
    pub custom_tags: HashMap<String, String>,
}

fn default_random_sampling() -> f64 {
    100.0
}

fn default_max_path_tag_length() -> usize {
    256
}

impl Default for StreamTracingConfig {
    fn default() -> Self {
        Self {
            random_sampling: default_random_sampling(),
            operation_name: OperationName::default(),
            verbose: false,
            max_path_tag_length: default_max_path_tag_length(),
            custom_tags: HashMap::new(),
        }
    }
}

/// Direction of a traced operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationName {
    #[default]
    Ingress,
    Egress,
}

/// A named filter with its settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterEntry {
    /// Filter name, e.g. "access_log"
    pub name: String,

    /// Filter specific settings
    #[serde(default)]
    pub config: HashMap<String, toml::Value>,
}

impl FilterEntry {
    /// Read a string setting
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// Read a table of string settings
    pub fn get_string_map(&self, key: &str) -> HashMap<String, String> {
        self.config
            .get(key)
            .and_then(|v| v.as_table())
            .map(|table| {
                table
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Route definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route name
    pub name: String,

    /// Match on request service (host)
    #[serde(default)]
    pub service: Option<String>,

    /// Match on request method
    #[serde(default)]
    pub method: Option<String>,

    /// Match on request properties
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Target cluster
    #[serde(default)]
    pub cluster: Option<String>,

    /// Answer locally instead of proxying
    #[serde(default)]
    pub direct_response: Option<DirectResponseConfig>,

    /// Opaque per-route metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Local response returned by a route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectResponseConfig {
    /// Status code name, e.g. "ok", "not_found", "unavailable"
    #[serde(default = "default_direct_status")]
    pub status: String,

    /// Status message
    #[serde(default)]
    pub message: String,
}

fn default_direct_status() -> String {
    "ok".to_string()
}

/// Upstream cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,

    /// Host addresses
    pub hosts: Vec<String>,

    /// Framing transport
    #[serde(default)]
    pub transport: TransportKind,

    /// Message protocol
    #[serde(default)]
    pub protocol: ProtocolKind,

    /// Close the downstream connection after a local error reply
    #[serde(default = "default_true")]
    pub close_downstream_on_error: bool,

    /// Maximum connections per host, counting those still connecting
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Outlier detection settings
    #[serde(default)]
    pub outlier_detection: OutlierDetectionConfig,
}

fn default_max_connections() -> usize {
    1024
}

fn default_connect_timeout() -> u64 {
    10
}

/// Upstream framing transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Framed,
    Unframed,
}

/// Upstream message protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    #[default]
    Binary,
    Compact,
}

/// Outlier detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierDetectionConfig {
    /// Consecutive request failures before ejection
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,

    /// Consecutive connect failures or timeouts before ejection
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_local_origin_failures: u32,

    /// Successes needed to restore an ejected host
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long an ejected host stays out
    #[serde(default = "default_base_ejection_time_ms")]
    pub base_ejection_time_ms: u64,
}

fn default_consecutive_failures() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_base_ejection_time_ms() -> u64 {
    30_000
}

impl Default for OutlierDetectionConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: default_consecutive_failures(),
            consecutive_local_origin_failures: default_consecutive_failures(),
            success_threshold: default_success_threshold(),
            base_ejection_time_ms: default_base_ejection_time_ms(),
        }
    }
}
