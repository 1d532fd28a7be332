//! Logging and trace export.
//!
//! Logs always go to stdout, at least at the `ERROR` level. Setting
//! `AMBER_LOG` to an env-filter directive (for example
//! `amber=debug,amber::cluster=trace`) replaces the level filter
//! entirely. Trace export is off unless a [`TracingConfig`] is given.
//!
//! Each export backend implements [`TracerBuilder`], which only has to
//! produce the [`Tracer`] the telemetry layer writes to.

use opentelemetry_sdk::trace::Tracer;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::EngineError;
use crate::errors::EngineResult;

mod jaeger_tracing;
mod otlp_tracing;

use jaeger_tracing::JaegerConfig;
use otlp_tracing::OtlpTracingConfig;

/// Name of the env var holding a full env-filter directive.
pub const LOG_FILTER_VAR: &str = "AMBER_LOG";

/// Where traces go.
#[derive(Debug, Clone, PartialEq)]
pub enum TracingConfig {
    /// An OpenTelemetry collector over gRPC. `url` defaults to
    /// `grpc://127.0.0.1:4317`.
    Otlp {
        service_name: String,
        url: Option<String>,
        /// `>= 1` samples everything, `<= 0` almost nothing.
        sampling_ratio: f64,
    },
    /// A Jaeger agent. `endpoint` defaults to `127.0.0.1:6831`, or
    /// whatever `OTEL_EXPORTER_JAEGER_AGENT_HOST` and
    /// `OTEL_EXPORTER_JAEGER_AGENT_PORT` say.
    Jaeger {
        service_name: String,
        endpoint: Option<String>,
        sampling_ratio: f64,
    },
}

impl TracingConfig {
    fn builder(&self) -> Box<dyn TracerBuilder> {
        match self.clone() {
            Self::Otlp {
                service_name,
                url,
                sampling_ratio,
            } => Box::new(OtlpTracingConfig {
                service_name,
                url,
                sampling_ratio,
            }),
            Self::Jaeger {
                service_name,
                endpoint,
                sampling_ratio,
            } => Box::new(JaegerConfig {
                service_name,
                endpoint,
                sampling_ratio,
            }),
        }
    }
}

/// Trait that every export backend implements.
/// It should just return the proper `Tracer` for the backend.
trait TracerBuilder {
    fn build(&self) -> EngineResult<Tracer>;
}

fn get_log_level(level: Option<&str>) -> EngineResult<LevelFilter> {
    match level.map(str::to_lowercase).as_deref() {
        None => Ok(LevelFilter::ERROR),
        Some("trace") => Ok(LevelFilter::TRACE),
        Some("debug") => Ok(LevelFilter::DEBUG),
        Some("info") => Ok(LevelFilter::INFO),
        Some("warn") => Ok(LevelFilter::WARN),
        Some("error") => Ok(LevelFilter::ERROR),
        Some(other) => Err(EngineError::Config(format!("wrong log level: {other}"))),
    }
}

fn log_filter(directive: Option<String>, level: LevelFilter) -> EngineResult<EnvFilter> {
    match directive {
        Some(directive) => EnvFilter::try_new(&directive)
            .map_err(|err| EngineError::Config(format!("bad {LOG_FILTER_VAR}={directive:?}: {err}"))),
        None => Ok(EnvFilter::new(format!("amber={level}"))),
    }
}

/// Install the global subscriber.
///
/// Must be called from inside a tokio runtime when `config` is set,
/// since the exporters batch on it.
pub fn setup_tracing(config: Option<TracingConfig>, log_level: Option<&str>) -> EngineResult<()> {
    let log_level = get_log_level(log_level)?;
    let filter = log_filter(std::env::var(LOG_FILTER_VAR).ok(), log_level)?;

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(filter);

    if let Some(config) = config {
        let tracer = config.builder().build()?;
        let telemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            // Export every span from this crate regardless of log level.
            .with_filter(Targets::new().with_target("amber", LevelFilter::TRACE));
        set_global_subscriber(Registry::default().with(logs).with(telemetry));
    } else {
        set_global_subscriber(Registry::default().with(logs));
    }
    Ok(())
}

// Logs instead of failing when a subscriber is already installed,
// which happens in tests and when a node is started twice in one
// process.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse_case_insensitively() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(EngineError::Config(_))
    ));
}

#[test]
fn env_directive_replaces_level() {
    assert!(log_filter(Some("amber=trace,hyper=off".to_string()), LevelFilter::ERROR).is_ok());
    assert!(log_filter(Some("amber=[".to_string()), LevelFilter::ERROR).is_err());
    assert_eq!(
        log_filter(None, LevelFilter::INFO).unwrap().to_string(),
        "amber=info"
    );
}

#[test]
fn repeated_setup_is_harmless() {
    setup_tracing(None, Some("warn")).unwrap();
    setup_tracing(None, Some("warn")).unwrap();
}
