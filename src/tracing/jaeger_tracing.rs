use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::config;
use opentelemetry_sdk::trace::Sampler;
use opentelemetry_sdk::trace::Tracer;

use super::TracerBuilder;
use crate::errors::EngineError;
use crate::errors::EngineResult;

/// Send traces to a Jaeger agent.
///
/// An explicit endpoint takes precedence over the
/// `OTEL_EXPORTER_JAEGER_AGENT_HOST` and
/// `OTEL_EXPORTER_JAEGER_AGENT_PORT` env vars.
pub(super) struct JaegerConfig {
    pub(super) service_name: String,
    pub(super) endpoint: Option<String>,
    pub(super) sampling_ratio: f64,
}

impl TracerBuilder for JaegerConfig {
    fn build(&self) -> EngineResult<Tracer> {
        opentelemetry::global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
        let mut pipeline = opentelemetry_jaeger::new_agent_pipeline()
            .with_trace_config(config().with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio)))
            .with_service_name(self.service_name.clone());

        if let Some(endpoint) = self.endpoint.as_ref() {
            pipeline = pipeline.with_endpoint(endpoint);
        }

        pipeline
            .install_batch(Tokio)
            .map_err(|err| EngineError::Config(format!("error installing Jaeger tracer: {err}")))
    }
}
