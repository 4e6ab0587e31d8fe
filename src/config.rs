// src/config.rs

//! Manages router configuration: loading, CLI overrides, and validation.

use crate::core::access::AccessLevel;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Identity of this router instance, used in FRDP and the status display.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IdentityConfig {
    #[serde(default = "default_simulator_name")]
    pub simulator: String,
    #[serde(default = "default_router_name")]
    pub router: String,
    /// If true, an invariant violation terminates the process instead of
    /// being logged and survived.
    #[serde(default)]
    pub stop_minded: bool,
    /// Forward `pleaseBeSoKindAndQuit` to the upstream as well as to
    /// downstream clients. Dangerous in shared-cockpit setups.
    #[serde(default)]
    pub forward_quit_upstream: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            simulator: default_simulator_name(),
            router: default_router_name(),
            stop_minded: false,
            forward_quit_upstream: false,
        }
    }
}

fn default_simulator_name() -> String {
    "UnknownSim".to_string()
}
fn default_router_name() -> String {
    "UnknownRouter".to_string()
}

/// Listening ports for the PSX protocol and the REST API.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListenConfig {
    #[serde(default = "default_listen_port")]
    pub port: u16,
    #[serde(default = "default_rest_api_port")]
    pub rest_api_port: Option<u16>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            rest_api_port: default_rest_api_port(),
        }
    }
}

fn default_listen_port() -> u16 {
    10748
}
fn default_rest_api_port() -> Option<u16> {
    Some(8747)
}

/// One upstream target (a PSX main server or another router).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpstreamConfig {
    /// Marks the target the router dials at startup. With several
    /// `[[upstream]]` entries exactly one should be the default; otherwise
    /// the first entry is used.
    #[serde(rename = "default", default)]
    pub is_default: bool,
    #[serde(default = "default_upstream_name")]
    pub name: String,
    #[serde(default = "default_upstream_host")]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            is_default: true,
            name: default_upstream_name(),
            host: default_upstream_host(),
            port: default_upstream_port(),
            password: None,
        }
    }
}

fn default_upstream_name() -> String {
    "main".to_string()
}
fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}
fn default_upstream_port() -> u16 {
    10747
}

/// Log-file settings. `level` feeds the tracing filter when `RUST_LOG` is
/// not set.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default)]
    pub traffic: bool,
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    /// Rotate the traffic log when it exceeds this size in bytes. `0`
    /// disables rotation.
    #[serde(default = "default_traffic_max_size")]
    pub traffic_max_size: u64,
    #[serde(default = "default_keep_versions")]
    pub traffic_keep_versions: u32,
    #[serde(default)]
    pub output_max_size: u64,
    #[serde(default = "default_keep_versions")]
    pub output_keep_versions: u32,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            traffic: false,
            directory: default_log_directory(),
            traffic_max_size: default_traffic_max_size(),
            traffic_keep_versions: default_keep_versions(),
            output_max_size: 0,
            output_keep_versions: default_keep_versions(),
            level: default_log_level(),
        }
    }
}

fn default_log_directory() -> PathBuf {
    PathBuf::from(".")
}
fn default_traffic_max_size() -> u64 {
    64 * 1024 * 1024
}
fn default_keep_versions() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

/// What to do with keywords that are not in the variable catalogue.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnknownKeywordPolicy {
    /// Accept, cache, forward, and log the keyword.
    #[default]
    Log,
    /// Drop the line.
    Drop,
}

/// PSX-protocol settings: the variable catalogue and the content filters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PsxConfig {
    #[serde(default = "default_variables_path")]
    pub variables: PathBuf,
    #[serde(default)]
    pub filter_elevation: bool,
    #[serde(default)]
    pub filter_traffic: bool,
    #[serde(default = "default_filter_flight_controls")]
    pub filter_flight_controls: bool,
    /// Overrides the built-in set of keywords excluded for `nolong`
    /// clients.
    #[serde(default)]
    pub nolong_keywords: Option<Vec<String>>,
    #[serde(default)]
    pub unknown_keywords: UnknownKeywordPolicy,
    /// Cache snapshot file, read at startup and written periodically so a
    /// fresh router can serve welcomes before the upstream connects.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl Default for PsxConfig {
    fn default() -> Self {
        Self {
            variables: default_variables_path(),
            filter_elevation: false,
            filter_traffic: false,
            filter_flight_controls: default_filter_flight_controls(),
            nolong_keywords: None,
            unknown_keywords: UnknownKeywordPolicy::default(),
            cache_file: None,
        }
    }
}

fn default_variables_path() -> PathBuf {
    PathBuf::from("Variables.txt")
}
fn default_filter_flight_controls() -> bool {
    true
}

/// One access rule. The list is order-significant: first match wins.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccessConfig {
    pub display_name: String,
    /// CIDR networks or the literal `"ANY"`.
    #[serde(default)]
    pub match_ipv4: Vec<String>,
    #[serde(default)]
    pub match_password: Option<String>,
    pub level: AccessLevel,
}

/// Kind of connectivity check evaluated by the status display.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    IsFrankenrouter,
    NameRegexp,
}

/// Warns when the number of connected clients matching the check falls
/// outside `limit_min..=limit_max`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckConfig {
    #[serde(rename = "type")]
    pub check_type: CheckType,
    #[serde(default)]
    pub regexp: Option<String>,
    #[serde(default)]
    pub limit_min: Option<usize>,
    #[serde(default)]
    pub limit_max: Option<usize>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Warning thresholds for the performance monitoring hooks.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PerformanceConfig {
    /// Warn when a client's outbound queue holds more than this many
    /// buffered bytes.
    #[serde(default = "default_write_buffer_warning")]
    pub write_buffer_warning: usize,
    #[serde(default = "default_queue_time_warning")]
    pub queue_time_warning: f64,
    #[serde(default = "default_total_delay_warning")]
    pub total_delay_warning: f64,
    #[serde(default = "default_monitor_delay_warning")]
    pub monitor_delay_warning: f64,
    #[serde(default = "default_frdp_rtt_warning")]
    pub frdp_rtt_warning: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            write_buffer_warning: default_write_buffer_warning(),
            queue_time_warning: default_queue_time_warning(),
            total_delay_warning: default_total_delay_warning(),
            monitor_delay_warning: default_monitor_delay_warning(),
            frdp_rtt_warning: default_frdp_rtt_warning(),
        }
    }
}

fn default_write_buffer_warning() -> usize {
    1024 * 1024
}
fn default_queue_time_warning() -> f64 {
    0.016
}
fn default_total_delay_warning() -> f64 {
    0.024
}
fn default_monitor_delay_warning() -> f64 {
    0.032
}
fn default_frdp_rtt_warning() -> f64 {
    0.1
}

/// Console status display settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DisplayConfig {
    /// Seconds between status table prints.
    #[serde(default = "default_status_interval")]
    pub status_interval: f64,
    /// Print the one-line aircraft summary decoded from the cache.
    #[serde(default = "default_aircraft_status")]
    pub aircraft_status: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            status_interval: default_status_interval(),
            aircraft_status: default_aircraft_status(),
        }
    }
}

fn default_status_interval() -> f64 {
    1.0
}
fn default_aircraft_status() -> bool {
    true
}

/// A raw representation of the config file before validation.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    identity: IdentityConfig,
    #[serde(default)]
    listen: ListenConfig,
    #[serde(default)]
    upstream: Vec<UpstreamConfig>,
    #[serde(default)]
    log: LogConfig,
    #[serde(default)]
    psx: PsxConfig,
    #[serde(default)]
    access: Vec<AccessConfig>,
    #[serde(default)]
    check: Vec<CheckConfig>,
    #[serde(default)]
    performance: PerformanceConfig,
    #[serde(default)]
    display: DisplayConfig,
}

/// The final, validated router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub identity: IdentityConfig,
    pub listen: ListenConfig,
    pub upstream: Vec<UpstreamConfig>,
    pub log: LogConfig,
    pub psx: PsxConfig,
    pub access: Vec<AccessConfig>,
    pub check: Vec<CheckConfig>,
    pub performance: PerformanceConfig,
    pub display: DisplayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawConfig::default())
    }
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;
        let config = Self::from_raw(raw);
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Self {
        let mut config = Self {
            identity: raw.identity,
            listen: raw.listen,
            upstream: raw.upstream,
            log: raw.log,
            psx: raw.psx,
            access: raw.access,
            check: raw.check,
            performance: raw.performance,
            display: raw.display,
        };
        if config.upstream.is_empty() {
            config.upstream.push(UpstreamConfig::default());
        }
        if config.access.is_empty() {
            // Without any [[access]] rules only localhost clients get in.
            config.access.push(AccessConfig {
                display_name: "localhost".to_string(),
                match_ipv4: vec!["127.0.0.1/32".to_string()],
                match_password: None,
                level: AccessLevel::Full,
            });
        }
        config
    }

    /// Validates the configuration, failing with a specific message for
    /// each kind of inconsistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen.port == 0 {
            return Err(anyhow!("listen.port cannot be 0"));
        }
        if let Some(rest_port) = self.listen.rest_api_port
            && rest_port == self.listen.port
        {
            return Err(anyhow!(
                "listen.rest_api_port cannot be the same as listen.port"
            ));
        }
        if self.identity.simulator.len() > 16 {
            return Err(anyhow!("identity.simulator is limited to 16 characters"));
        }

        let defaults = self.upstream.iter().filter(|u| u.is_default).count();
        if defaults > 1 {
            return Err(anyhow!("more than one [[upstream]] entry marked default"));
        }
        for upstream in &self.upstream {
            if upstream.port == 0 {
                return Err(anyhow!("upstream '{}' has port 0", upstream.name));
            }
        }

        for access in &self.access {
            if access.match_ipv4.is_empty() && access.match_password.is_none() {
                return Err(anyhow!(
                    "access rule '{}' must use match_ipv4 or match_password",
                    access.display_name
                ));
            }
            for network in &access.match_ipv4 {
                if network == "ANY" {
                    continue;
                }
                network.parse::<ipnet::IpNet>().map_err(|e| {
                    anyhow!(
                        "access rule '{}' has an invalid network '{}': {}",
                        access.display_name,
                        network,
                        e
                    )
                })?;
            }
            if access.match_password.as_deref() == Some("") {
                return Err(anyhow!(
                    "access rule '{}' has an empty password; remove the key for password-less access",
                    access.display_name
                ));
            }
        }

        for (i, check) in self.check.iter().enumerate() {
            if check.check_type == CheckType::NameRegexp {
                let Some(pattern) = &check.regexp else {
                    return Err(anyhow!("check #{} requires a regexp", i + 1));
                };
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow!("check #{} has an invalid regexp: {}", i + 1, e))?;
            }
        }

        if self.display.status_interval <= 0.0 {
            return Err(anyhow!("display.status_interval must be positive"));
        }
        Ok(())
    }

    /// Returns the upstream target the router should dial at startup.
    pub fn default_upstream(&self) -> &UpstreamConfig {
        self.upstream
            .iter()
            .find(|u| u.is_default)
            .unwrap_or(&self.upstream[0])
    }
}
