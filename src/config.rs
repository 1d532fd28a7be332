//! Bootstrap parameters, read from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `AMBER_CLUSTER_MODE` | `false` |
//! | `AMBER_ROLE` | `master` |
//! | `AMBER_MASTER_HOST` | `localhost` |
//! | `AMBER_MASTER_PORT` | `2552` |
//! | `AMBER_LOCAL_HOST` | `localhost` |
//! | `AMBER_RPC_TIMEOUT_MS` | `5000` |
//! | `AMBER_JOIN_RETRIES` | `10` |
//! | `AMBER_STATUS_INTERVAL_MS` | `500`; `0` turns status rounds off |
//! | `AMBER_API_ENABLED` | `false` |
//! | `AMBER_API_PORT` | `3030` |
//! | `AMBER_LOG_LEVEL` | unset, meaning `error` |
//! | `AMBER_OTLP_URL` | unset |
//! | `AMBER_JAEGER_ENDPOINT` | unset |
//! | `AMBER_SERVICE_NAME` | `amber` |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::addresses::NodeAddress;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::tracing::TracingConfig;

/// Which half of the cluster this process is.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Hosts the controller and seeds membership.
    #[default]
    Master,
    /// Joins a master and hosts workers.
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" | "controller" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            other => Err(format!("expected `master` or `worker`; got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub cluster_mode: bool,
    pub role: Role,
    pub master: NodeAddress,
    /// Host a worker advertises for itself.
    pub local_host: String,
    pub rpc_timeout: Duration,
    pub join_retries: u32,
    /// Period of the master's statistics rounds.
    pub status_interval: Option<Duration>,
    pub api_enabled: bool,
    pub api_port: u16,
    pub log_level: Option<String>,
    pub otlp_url: Option<String>,
    pub jaeger_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster_mode: false,
            role: Role::Master,
            master: NodeAddress::new("localhost", 2552),
            local_host: "localhost".to_string(),
            rpc_timeout: Duration::from_millis(5000),
            join_retries: 10,
            status_interval: Some(Duration::from_millis(500)),
            api_enabled: false,
            api_port: 3030,
            log_level: None,
            otlp_url: None,
            jaeger_endpoint: None,
            service_name: "amber".to_string(),
        }
    }
}

fn parse<T>(name: &str, raw: &str) -> EngineResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| EngineError::Config(format!("can't parse {name}={raw:?}: {err}")))
}

fn parse_bool(name: &str, raw: &str) -> EngineResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(EngineError::Config(format!(
            "can't parse {name}={raw:?}: expected a boolean"
        ))),
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name to value lookup. Unset names keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup("AMBER_CLUSTER_MODE") {
            config.cluster_mode = parse_bool("AMBER_CLUSTER_MODE", &raw)?;
        }
        if let Some(raw) = lookup("AMBER_ROLE") {
            config.role = parse("AMBER_ROLE", &raw)?;
        }
        if let Some(raw) = lookup("AMBER_MASTER_HOST") {
            config.master.host = raw.trim().to_string();
        }
        if let Some(raw) = lookup("AMBER_MASTER_PORT") {
            config.master.port = parse("AMBER_MASTER_PORT", &raw)?;
        }
        if let Some(raw) = lookup("AMBER_LOCAL_HOST") {
            config.local_host = raw.trim().to_string();
        }
        if let Some(raw) = lookup("AMBER_RPC_TIMEOUT_MS") {
            config.rpc_timeout = Duration::from_millis(parse("AMBER_RPC_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("AMBER_JOIN_RETRIES") {
            config.join_retries = parse("AMBER_JOIN_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("AMBER_STATUS_INTERVAL_MS") {
            let millis: u64 = parse("AMBER_STATUS_INTERVAL_MS", &raw)?;
            config.status_interval = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(raw) = lookup("AMBER_API_ENABLED") {
            config.api_enabled = parse_bool("AMBER_API_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("AMBER_API_PORT") {
            config.api_port = parse("AMBER_API_PORT", &raw)?;
        }
        config.log_level = lookup("AMBER_LOG_LEVEL");
        config.otlp_url = lookup("AMBER_OTLP_URL");
        config.jaeger_endpoint = lookup("AMBER_JAEGER_ENDPOINT");
        if let Some(raw) = lookup("AMBER_SERVICE_NAME") {
            config.service_name = raw;
        }

        if config.role == Role::Worker && !config.cluster_mode {
            return Err(EngineError::Config(
                "AMBER_ROLE=worker needs AMBER_CLUSTER_MODE=true".to_string(),
            ));
        }
        if config.rpc_timeout.is_zero() {
            return Err(EngineError::Config(
                "AMBER_RPC_TIMEOUT_MS must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    /// Trace export backend, if one was configured. OTLP wins when
    /// both are set.
    pub fn tracing_config(&self) -> Option<TracingConfig> {
        if let Some(url) = &self.otlp_url {
            Some(TracingConfig::Otlp {
                service_name: self.service_name.clone(),
                url: Some(url.clone()),
                sampling_ratio: 1.0,
            })
        } else {
            self.jaeger_endpoint
                .as_ref()
                .map(|endpoint| TracingConfig::Jaeger {
                    service_name: self.service_name.clone(),
                    endpoint: Some(endpoint.clone()),
                    sampling_ratio: 1.0,
                })
        }
    }
}

#[cfg(test)]
fn lookup_from(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
    move |name| {
        pairs
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    }
}

#[test]
fn defaults_without_environment() {
    let config = EngineConfig::from_lookup(|_| None).unwrap();
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.master, NodeAddress::new("localhost", 2552));
    assert_eq!(config.api_port, 3030);
    assert!(config.tracing_config().is_none());
}

#[test]
fn worker_role_from_environment() {
    let config = EngineConfig::from_lookup(lookup_from(&[
        ("AMBER_CLUSTER_MODE", "true"),
        ("AMBER_ROLE", "worker"),
        ("AMBER_MASTER_HOST", "10.0.0.5"),
        ("AMBER_MASTER_PORT", "2600"),
        ("AMBER_LOCAL_HOST", "10.0.0.9"),
        ("AMBER_RPC_TIMEOUT_MS", "250"),
    ]))
    .unwrap();
    assert_eq!(config.role, Role::Worker);
    assert_eq!(config.master, NodeAddress::new("10.0.0.5", 2600));
    assert_eq!(config.local_host, "10.0.0.9");
    assert_eq!(config.rpc_timeout, Duration::from_millis(250));
}

#[test]
fn bad_values_name_the_variable() {
    let err = EngineConfig::from_lookup(lookup_from(&[("AMBER_MASTER_PORT", "lots")])).unwrap_err();
    assert!(err.to_string().contains("AMBER_MASTER_PORT"));

    let err = EngineConfig::from_lookup(lookup_from(&[("AMBER_ROLE", "worker")])).unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[test]
fn status_interval_zero_turns_rounds_off() {
    assert_eq!(
        EngineConfig::default().status_interval,
        Some(Duration::from_millis(500))
    );
    let config = EngineConfig::from_lookup(lookup_from(&[("AMBER_STATUS_INTERVAL_MS", "20")])).unwrap();
    assert_eq!(config.status_interval, Some(Duration::from_millis(20)));
    let config = EngineConfig::from_lookup(lookup_from(&[("AMBER_STATUS_INTERVAL_MS", "0")])).unwrap();
    assert_eq!(config.status_interval, None);
    let err = EngineConfig::from_lookup(lookup_from(&[("AMBER_STATUS_INTERVAL_MS", "-1")])).unwrap_err();
    assert!(err.to_string().contains("AMBER_STATUS_INTERVAL_MS"));
}

#[test]
fn otlp_wins_over_jaeger() {
    let config = EngineConfig::from_lookup(lookup_from(&[
        ("AMBER_OTLP_URL", "grpc://otel:4317"),
        ("AMBER_JAEGER_ENDPOINT", "jaeger:6831"),
    ]))
    .unwrap();
    assert!(matches!(
        config.tracing_config(),
        Some(TracingConfig::Otlp { .. })
    ));
}
