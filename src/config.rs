use std::env;
use std::time::Duration;

use crate::agents;
use crate::error::{Result, ShroudError};
use crate::proxy::{Socks5Config, StealthConfig, Target};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Stealth transport configuration
    pub stealth: StealthServerConfig,
    /// Statistics server configuration
    pub stats: StatsServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 8080, 0 = OS-assigned)
    pub port: u16,
    /// Targets as `prefix=origin` pairs
    pub targets: Vec<TargetConfig>,
    /// Serve HTTPS with a freshly generated self-signed certificate
    pub tls_enabled: bool,
    /// Hosts covered by the generated certificate (comma-separated)
    pub tls_hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub prefix: String,
    pub origin: String,
}

#[derive(Debug, Clone)]
pub struct StealthServerConfig {
    /// Minimum artificial delay between upstream dispatches
    pub min_delay: Duration,
    /// Maximum artificial delay between upstream dispatches
    pub max_delay: Duration,
    /// Transparent content-encoding negotiation
    pub compression: bool,
    /// Optional SOCKS5 egress, `host:port`
    pub socks5_addr: Option<String>,
    pub socks5_username: Option<String>,
    pub socks5_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatsServerConfig {
    /// Enable the statistics API server
    pub enabled: bool,
    /// Port for the statistics server (default: 8081)
    pub port: u16,
    /// Sliding window the statistics are computed over, in seconds
    pub window_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("SHROUD_PORT", "8080").parse().map_err(|_| {
                    ShroudError::InvalidConfig("SHROUD_PORT must be a valid port number".into())
                })?,
                targets: parse_targets(&get_env_or("SHROUD_TARGETS", ""))?,
                tls_enabled: get_env_or("SHROUD_TLS_ENABLED", "false")
                    .parse()
                    .unwrap_or(false),
                tls_hosts: get_env_or("SHROUD_TLS_HOSTS", "localhost")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            stealth: StealthServerConfig {
                min_delay: Duration::from_millis(
                    get_env_or("SHROUD_MIN_DELAY_MS", "0").parse().map_err(|_| {
                        ShroudError::InvalidConfig("SHROUD_MIN_DELAY_MS must be a number".into())
                    })?,
                ),
                max_delay: Duration::from_millis(
                    get_env_or("SHROUD_MAX_DELAY_MS", "0").parse().map_err(|_| {
                        ShroudError::InvalidConfig("SHROUD_MAX_DELAY_MS must be a number".into())
                    })?,
                ),
                compression: get_env_or("SHROUD_COMPRESSION", "true")
                    .parse()
                    .unwrap_or(true),
                socks5_addr: get_env_opt("SHROUD_SOCKS5_ADDR"),
                socks5_username: get_env_opt("SHROUD_SOCKS5_USER"),
                socks5_password: get_env_opt("SHROUD_SOCKS5_PASSWORD"),
            },
            stats: StatsServerConfig {
                enabled: get_env_or("SHROUD_STATS_ENABLED", "true")
                    .parse()
                    .unwrap_or(true),
                port: get_env_or("SHROUD_STATS_PORT", "8081").parse().map_err(|_| {
                    ShroudError::InvalidConfig(
                        "SHROUD_STATS_PORT must be a valid port number".into(),
                    )
                })?,
                window_secs: get_env_or("SHROUD_STATS_WINDOW_SECS", "120")
                    .parse()
                    .unwrap_or(120),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Registration values for proxy construction
    pub fn targets(&self) -> Vec<Target> {
        self.proxy
            .targets
            .iter()
            .map(|t| Target::new(t.origin.clone(), t.prefix.clone()))
            .collect()
    }

    /// Stealth transport configuration with the canned user-agent list
    pub fn stealth_config(&self) -> StealthConfig {
        let socks5 = self.stealth.socks5_addr.as_ref().map(|addr| Socks5Config {
            addr: addr.clone(),
            auth: match (&self.stealth.socks5_username, &self.stealth.socks5_password) {
                (Some(username), password) => Some(crate::proxy::Socks5Auth {
                    username: username.clone(),
                    password: password.clone().unwrap_or_default(),
                }),
                _ => None,
            },
        });

        StealthConfig {
            user_agents: agents::default_user_agents(),
            min_delay: self.stealth.min_delay,
            max_delay: self.stealth.max_delay,
            socks5,
            compression: self.stealth.compression,
        }
    }
}

/// Parse `prefix=origin` pairs separated by commas.
fn parse_targets(raw: &str) -> Result<Vec<TargetConfig>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    raw.split(',')
        .map(|pair| {
            let pair = pair.trim();
            let (prefix, origin) = pair.split_once('=').ok_or_else(|| {
                ShroudError::InvalidConfig(format!(
                    "SHROUD_TARGETS entry {:?} is not a prefix=origin pair",
                    pair
                ))
            })?;
            if prefix.is_empty() || origin.is_empty() {
                return Err(ShroudError::InvalidConfig(format!(
                    "SHROUD_TARGETS entry {:?} has an empty prefix or origin",
                    pair
                )));
            }
            Ok(TargetConfig {
                prefix: prefix.to_string(),
                origin: origin.to_string(),
            })
        })
        .collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
