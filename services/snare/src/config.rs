//! Sensor configuration.
//!
//! Configuration is env-driven; every option has a default.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SnareError};

/// Default port of the tracked-traffic server.
pub const DEFAULT_SERVER_PORT: u16 = 5000;

/// Default transport I/O deadline.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(45);

/// Default upper bound on a single handler's lifetime (72 hours).
pub const DEFAULT_MAX_HANDLER_LIFETIME: Duration = Duration::from_secs(72 * 60 * 60);

/// Default drain interval at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Default monitor sampling interval.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of payload bytes captured per connection.
pub const DEFAULT_MAX_TCP_PAYLOAD: usize = 4096;

/// Sensor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the tracked-traffic server.
    pub server_addr: SocketAddr,

    /// Transport I/O deadline armed on every dispatched connection.
    pub conn_timeout: Duration,

    /// Upper bound on how long a handler may run, even without shutdown.
    pub max_handler_lifetime: Duration,

    /// How long shutdown waits for in-flight connections to drain.
    pub shutdown_grace: Duration,

    /// Monitor sampling interval.
    pub monitor_interval: Duration,

    /// Max payload bytes captured by the generic TCP handler and intercept proxies.
    pub max_tcp_payload: usize,

    /// Rule file path.
    pub rules_path: PathBuf,

    /// Directory holding the persisted sensor identity.
    pub var_dir: PathBuf,

    /// Handler that receives connections the packet engine did not track.
    pub default_handler: Option<String>,

    /// Telemetry endpoint, present only when telemetry is enabled.
    pub telemetry_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)),
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            max_handler_lifetime: DEFAULT_MAX_HANDLER_LIFETIME,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            max_tcp_payload: DEFAULT_MAX_TCP_PAYLOAD,
            rules_path: PathBuf::from("rules/rules.toml"),
            var_dir: PathBuf::from("/var/lib/snare"),
            default_handler: None,
            telemetry_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_ip: IpAddr = parse_or(&var, "SNARE_BIND_IP", defaults.server_addr.ip())?;
        let port: u16 = parse_or(&var, "SNARE_SERVER_PORT", DEFAULT_SERVER_PORT)?;

        let conn_timeout = secs_or(&var, "SNARE_CONN_TIMEOUT_SECS", defaults.conn_timeout)?;
        let max_handler_lifetime = secs_or(
            &var,
            "SNARE_MAX_HANDLER_LIFETIME_SECS",
            defaults.max_handler_lifetime,
        )?;
        let monitor_interval =
            secs_or(&var, "SNARE_MONITOR_INTERVAL_SECS", defaults.monitor_interval)?;

        let shutdown_grace = millis_or(&var, "SNARE_SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?;

        let max_tcp_payload: usize = parse_or(&var, "SNARE_MAX_TCP_PAYLOAD", defaults.max_tcp_payload)?;
        if max_tcp_payload == 0 {
            return Err(SnareError::Config(
                "SNARE_MAX_TCP_PAYLOAD must be greater than zero.".to_string(),
            ));
        }

        let rules_path = var("SNARE_RULES_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.rules_path);
        let var_dir = var("SNARE_VAR_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.var_dir);
        let default_handler = var("SNARE_DEFAULT_HANDLER").map(|v| v.trim().to_string());

        let telemetry_enabled = var("SNARE_TELEMETRY_ENABLED")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);
        let telemetry_url = if telemetry_enabled {
            Some(var("SNARE_TELEMETRY_URL").ok_or_else(|| {
                SnareError::Config(
                    "SNARE_TELEMETRY_URL is required when SNARE_TELEMETRY_ENABLED is set."
                        .to_string(),
                )
            })?)
        } else {
            None
        };

        let log_level = var("SNARE_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            server_addr: SocketAddr::new(bind_ip, port),
            conn_timeout,
            max_handler_lifetime,
            shutdown_grace,
            monitor_interval,
            max_tcp_payload,
            rules_path,
            var_dir,
            default_handler,
            telemetry_url,
            log_level,
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SnareError::Config(format!("{key} has an invalid value: '{raw}'."))),
        None => Ok(default),
    }
}

fn secs_or<F>(var: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(var, key, default.as_secs())?;
    if secs == 0 {
        return Err(SnareError::Config(format!(
            "{key} must be greater than zero."
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn millis_or<F>(var: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let millis: u64 = parse_or(var, key, default.as_millis() as u64)?;
    if millis == 0 {
        return Err(SnareError::Config(format!(
            "{key} must be greater than zero."
        )));
    }
    Ok(Duration::from_millis(millis))
}
