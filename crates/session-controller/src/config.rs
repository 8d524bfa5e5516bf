//! Session Controller configuration.
//!
//! Configuration is loaded from `SC_*` environment variables. Every setting
//! has a default; a value that is present but unparseable is an error rather
//! than silently falling back.

use crate::engine::WebRtcTransportOptions;

use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3016";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default RTC port range handed to the media engine.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 10100;

/// Default transport listen IP.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default initial available outgoing bitrate for new transports (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default maximum incoming bitrate applied to new transports (bps).
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Default delay between a worker death and process exit.
pub const DEFAULT_WORKER_DEATH_GRACE_MS: u64 = 2000;

/// Default room limit.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sc";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Session Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3016").
    pub signaling_bind_address: String,

    /// Health/metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance (used in logs).
    pub instance_id: String,

    /// Number of media engine workers (default: available parallelism).
    pub num_workers: usize,

    /// Inclusive RTC port range for transports.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// IP the transports listen on.
    pub listen_ip: IpAddr,

    /// Public IP advertised in ICE candidates, when behind NAT.
    pub announced_ip: Option<String>,

    pub initial_outgoing_bitrate: u32,

    pub max_incoming_bitrate: u32,

    /// Delay between a worker death and process exit.
    pub worker_death_grace: Duration,

    /// Create consumers paused; clients must `resume` them.
    pub consumers_start_paused: bool,

    /// Room limit for the registry.
    pub max_rooms: usize,
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{key}={raw:?}: {e}"))),
    }
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let num_workers = parse_var(vars, "SC_NUM_WORKERS", default_num_workers())?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SC_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let rtc_min_port = parse_var(vars, "SC_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SC_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SC_RTC_MIN_PORT ({rtc_min_port}) is greater than SC_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = parse_var(
            vars,
            "SC_LISTEN_IP",
            IpAddr::from_str(DEFAULT_LISTEN_IP)
                .map_err(|e| ConfigError::InvalidValue(e.to_string()))?,
        )?;

        let announced_ip = vars
            .get("SC_ANNOUNCED_IP")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let initial_outgoing_bitrate = parse_var(
            vars,
            "SC_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;
        let max_incoming_bitrate =
            parse_var(vars, "SC_MAX_INCOMING_BITRATE", DEFAULT_MAX_INCOMING_BITRATE)?;

        let worker_death_grace = Duration::from_millis(parse_var(
            vars,
            "SC_WORKER_DEATH_GRACE_MS",
            DEFAULT_WORKER_DEATH_GRACE_MS,
        )?);

        let consumers_start_paused = parse_var(vars, "SC_CONSUMERS_START_PAUSED", false)?;

        let max_rooms = parse_var(vars, "SC_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;

        let instance_id = vars.get("SC_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            instance_id,
            num_workers,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            initial_outgoing_bitrate,
            max_incoming_bitrate,
            worker_death_grace,
            consumers_start_paused,
            max_rooms,
        })
    }

    /// Options applied to every WebRTC transport the rooms create.
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip.clone(),
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
            max_incoming_bitrate: Some(self.max_incoming_bitrate),
            ..WebRtcTransportOptions::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(config.num_workers >= 1);
        assert_eq!(config.rtc_min_port, 10000);
        assert_eq!(config.rtc_max_port, 10100);
        assert_eq!(config.listen_ip.to_string(), "0.0.0.0");
        assert_eq!(config.announced_ip, None);
        assert_eq!(config.initial_outgoing_bitrate, 1_000_000);
        assert_eq!(config.max_incoming_bitrate, 1_500_000);
        assert_eq!(config.worker_death_grace, Duration::from_millis(2000));
        assert!(!config.consumers_start_paused);
        assert_eq!(config.max_rooms, 1000);
        assert!(config.instance_id.starts_with("sc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let config = Config::from_vars(&vars(&[
            ("SC_SIGNALING_BIND_ADDRESS", "127.0.0.1:4000"),
            ("SC_HEALTH_BIND_ADDRESS", "127.0.0.1:9000"),
            ("SC_INSTANCE_ID", "sc-custom-001"),
            ("SC_NUM_WORKERS", "4"),
            ("SC_RTC_MIN_PORT", "20000"),
            ("SC_RTC_MAX_PORT", "20010"),
            ("SC_LISTEN_IP", "10.0.0.5"),
            ("SC_ANNOUNCED_IP", "203.0.113.9"),
            ("SC_INITIAL_OUTGOING_BITRATE", "600000"),
            ("SC_MAX_INCOMING_BITRATE", "900000"),
            ("SC_WORKER_DEATH_GRACE_MS", "50"),
            ("SC_CONSUMERS_START_PAUSED", "true"),
            ("SC_MAX_ROOMS", "3"),
        ]))
        .expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:4000");
        assert_eq!(config.health_bind_address, "127.0.0.1:9000");
        assert_eq!(config.instance_id, "sc-custom-001");
        assert_eq!(config.num_workers, 4);
        assert_eq!((config.rtc_min_port, config.rtc_max_port), (20000, 20010));
        assert_eq!(config.announced_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(config.worker_death_grace, Duration::from_millis(50));
        assert!(config.consumers_start_paused);
        assert_eq!(config.max_rooms, 3);

        let options = config.transport_options();
        assert_eq!(options.listen_ip.to_string(), "10.0.0.5");
        assert_eq!(options.initial_available_outgoing_bitrate, 600_000);
        assert_eq!(options.max_incoming_bitrate, Some(900_000));
        assert!(options.enable_udp && options.enable_tcp && options.prefer_udp);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let result = Config::from_vars(&vars(&[("SC_RTC_MIN_PORT", "ten thousand")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("SC_RTC_MIN_PORT")));

        let result = Config::from_vars(&vars(&[("SC_RTC_MAX_PORT", "70000")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let result = Config::from_vars(&vars(&[
            ("SC_RTC_MIN_PORT", "30000"),
            ("SC_RTC_MAX_PORT", "20000"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let result = Config::from_vars(&vars(&[("SC_NUM_WORKERS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_blank_announced_ip_is_ignored() {
        let config = Config::from_vars(&vars(&[("SC_ANNOUNCED_IP", "  ")])).unwrap();
        assert_eq!(config.announced_ip, None);
    }

    #[test]
    fn test_invalid_listen_ip_is_rejected() {
        let result = Config::from_vars(&vars(&[("SC_LISTEN_IP", "not-an-ip")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
