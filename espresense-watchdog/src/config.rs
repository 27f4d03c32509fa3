//! Startup parameters and the optional tuning file.
//!
//! The three broker parameters come from the command line (or env / `.env`);
//! everything else has a default and can be overridden from `watchdog.yaml`
//! (path in `WATCHDOG_CONFIG`).

use crate::policy::RestartPolicy;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "WATCHDOG_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "watchdog.yaml";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
/// rumqttc refuses shorter keep-alives.
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
    #[error("invalid broker endpoint '{0}'")]
    Endpoint(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} is too large")]
    OutOfRange(&'static str),
    #[error("mqtt.keep_alive_secs must be at least 5, got {0}")]
    KeepAlive(u64),
    #[error("topic '{0}' must contain exactly one '+' segment")]
    Topic(String),
}

/// Broker credentials. All three are required.
#[derive(Debug, Clone, Parser)]
#[command(name = "espresense-watchdog", version, about = "Restarts ESPresense nodes that stop reporting")]
pub struct Cli {
    /// MQTT broker, `host` or `host:port`
    #[arg(env = "WATCHDOG_MQTT_HOST")]
    pub mqtt_host: String,
    #[arg(env = "WATCHDOG_MQTT_USER")]
    pub mqtt_user: String,
    #[arg(env = "WATCHDOG_MQTT_PASS", hide_env_values = true)]
    pub mqtt_pass: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    /// Accepts `host`, `host:port`, or a bracketed IPv6 `[::1]:port`.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let bad = || ConfigError::Endpoint(raw.to_string());
        if raw.is_empty() {
            return Err(bad());
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| bad())?,
                None if tail.is_empty() => default_port,
                None => return Err(bad()),
            };
            return Ok(Self { host: host.to_string(), port });
        }

        match raw.rsplit_once(':') {
            // more than one ':' without brackets: bare IPv6 address
            Some((host, _)) if host.contains(':') => Ok(Self { host: raw.to_string(), port: default_port }),
            Some((host, port)) if !host.is_empty() => {
                Ok(Self { host: host.to_string(), port: port.parse().map_err(|_| bad())? })
            }
            Some(_) => Err(bad()),
            None => Ok(Self { host: raw.to_string(), port: default_port }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConf {
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub keep_alive_secs: u64,
    pub session_expiry_secs: u32,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            port: DEFAULT_MQTT_PORT,
            client_id: "restart_cron".into(),
            topic: "espresense/rooms/+/telemetry".into(),
            keep_alive_secs: 300,
            session_expiry_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogConfig {
    pub silence_threshold_secs: u64,
    pub max_uptime_secs: u64,
    pub tick_interval_secs: u64,
    pub cooldown_secs: u64,
    pub restart_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Treat non-2xx answers to the restart POST as failures.
    pub strict_http_status: bool,
    pub mqtt: MqttConf,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            silence_threshold_secs: 300,
            max_uptime_secs: 6 * 60 * 60,
            tick_interval_secs: 60,
            cooldown_secs: 5,
            restart_timeout_secs: 5,
            shutdown_grace_secs: 10,
            strict_http_status: false,
            mqtt: MqttConf::default(),
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("silence_threshold_secs", self.silence_threshold_secs),
            ("max_uptime_secs", self.max_uptime_secs),
            ("tick_interval_secs", self.tick_interval_secs),
            ("restart_timeout_secs", self.restart_timeout_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        // thresholds become signed time::Duration values
        for (name, value) in [
            ("silence_threshold_secs", self.silence_threshold_secs),
            ("max_uptime_secs", self.max_uptime_secs),
        ] {
            if i64::try_from(value).is_err() {
                return Err(ConfigError::OutOfRange(name));
            }
        }
        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::KeepAlive(self.mqtt.keep_alive_secs));
        }
        let wildcards = self.mqtt.topic.split('/').filter(|s| *s == "+").count();
        if wildcards != 1 || self.mqtt.topic.contains('#') {
            return Err(ConfigError::Topic(self.mqtt.topic.clone()));
        }
        Ok(())
    }

    /// Values past `i64::MAX` are rejected by `validate`; saturate here so an
    /// unvalidated config can never produce a negative threshold.
    pub fn policy(&self) -> RestartPolicy {
        let secs = |v: u64| time::Duration::seconds(i64::try_from(v).unwrap_or(i64::MAX));
        RestartPolicy {
            silence_threshold: secs(self.silence_threshold_secs),
            max_uptime: secs(self.max_uptime_secs),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Reads the tuning file. A missing file means defaults; an unreadable or
/// invalid one is an error.
pub fn load_config_from(path: &Path) -> Result<WatchdogConfig, ConfigError> {
    let shown = path.display().to_string();
    if !path.exists() {
        tracing::info!(path = %shown, "no config file, using defaults");
        return Ok(WatchdogConfig::default());
    }
    let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: shown.clone(), source })?;
    let cfg = if txt.trim().is_empty() {
        WatchdogConfig::default()
    } else {
        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse { path: shown.clone(), source })?
    };
    cfg.validate()?;
    tracing::info!(path = %shown, "config loaded");
    Ok(cfg)
}

pub fn load_config() -> Result<WatchdogConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(Path::new(&path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn yaml_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_match_reference_behaviour() {
        let cfg = WatchdogConfig::default();
        assert_eq!(cfg.policy(), RestartPolicy::default());
        assert_eq!(cfg.tick_interval(), Duration::from_secs(60));
        assert_eq!(cfg.cooldown(), Duration::from_secs(5));
        assert_eq!(cfg.mqtt.client_id, "restart_cron");
        assert_eq!(cfg.mqtt.keep_alive_secs, 300);
        assert_eq!(cfg.mqtt.session_expiry_secs, 1800);
        assert!(!cfg.strict_http_status);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(cfg, WatchdogConfig::default());
    }

    #[test]
    fn empty_file_gives_defaults() {
        let f = yaml_file("  \n");
        assert_eq!(load_config_from(f.path()).unwrap(), WatchdogConfig::default());
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let f = yaml_file("silence_threshold_secs: 120\nstrict_http_status: true\nmqtt:\n  port: 8883\n");
        let cfg = load_config_from(f.path()).unwrap();
        assert_eq!(cfg.silence_threshold_secs, 120);
        assert!(cfg.strict_http_status);
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.mqtt.topic, "espresense/rooms/+/telemetry");
        assert_eq!(cfg.max_uptime_secs, 21_600);
    }

    #[test]
    fn invalid_files_are_errors() {
        let f = yaml_file("silence_threshold_secs: [1, 2]\n");
        assert!(matches!(load_config_from(f.path()), Err(ConfigError::Parse { .. })));

        let f = yaml_file("unknown_key: 1\n");
        assert!(matches!(load_config_from(f.path()), Err(ConfigError::Parse { .. })));

        let f = yaml_file("tick_interval_secs: 0\n");
        assert!(matches!(load_config_from(f.path()), Err(ConfigError::Zero("tick_interval_secs"))));

        let f = yaml_file("mqtt:\n  topic: espresense/rooms/#\n");
        assert!(matches!(load_config_from(f.path()), Err(ConfigError::Topic(_))));
    }

    #[test]
    fn thresholds_beyond_i64_are_rejected() {
        let f = yaml_file("max_uptime_secs: 18446744073709551615\n");
        assert!(matches!(load_config_from(f.path()), Err(ConfigError::OutOfRange("max_uptime_secs"))));

        let f = yaml_file("silence_threshold_secs: 9223372036854775808\n");
        assert!(matches!(load_config_from(f.path()), Err(ConfigError::OutOfRange("silence_threshold_secs"))));

        let f = yaml_file("max_uptime_secs: 9223372036854775807\n");
        let cfg = load_config_from(f.path()).unwrap();
        assert!(cfg.policy().max_uptime.is_positive());
    }

    #[test]
    fn policy_never_goes_negative() {
        let cfg = WatchdogConfig { max_uptime_secs: u64::MAX, ..WatchdogConfig::default() };
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.policy().max_uptime, time::Duration::seconds(i64::MAX));
    }

    #[test]
    fn keep_alive_has_a_floor() {
        let f = yaml_file("mqtt:\n  keep_alive_secs: 4\n");
        assert!(matches!(load_config_from(f.path()), Err(ConfigError::KeepAlive(4))));

        let f = yaml_file("mqtt:\n  keep_alive_secs: 5\n");
        assert_eq!(load_config_from(f.path()).unwrap().mqtt.keep_alive_secs, 5);
    }

    #[test]
    fn endpoint_forms() {
        let ep = BrokerEndpoint::parse("broker.lan", 1883).unwrap();
        assert_eq!(ep, BrokerEndpoint { host: "broker.lan".into(), port: 1883 });

        let ep = BrokerEndpoint::parse("10.0.0.2:8883", 1883).unwrap();
        assert_eq!(ep, BrokerEndpoint { host: "10.0.0.2".into(), port: 8883 });

        let ep = BrokerEndpoint::parse("[::1]:1884", 1883).unwrap();
        assert_eq!(ep, BrokerEndpoint { host: "::1".into(), port: 1884 });

        let ep = BrokerEndpoint::parse("fe80::1", 1883).unwrap();
        assert_eq!(ep.port, 1883);

        assert!(BrokerEndpoint::parse("", 1883).is_err());
        assert!(BrokerEndpoint::parse("broker:notaport", 1883).is_err());
        assert!(BrokerEndpoint::parse(":1883", 1883).is_err());
    }

    #[test]
    fn cli_requires_three_parameters() {
        let ok = Cli::try_parse_from(["espresense-watchdog", "broker", "user", "secret"]).unwrap();
        assert_eq!(ok.mqtt_host, "broker");
        assert_eq!(ok.mqtt_pass, "secret");

        // env fallback is not set in the test environment
        if std::env::var("WATCHDOG_MQTT_PASS").is_err() {
            assert!(Cli::try_parse_from(["espresense-watchdog", "broker", "user"]).is_err());
        }
    }
}
