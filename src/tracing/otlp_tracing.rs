use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::config;
use opentelemetry_sdk::trace::Sampler;
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_sdk::Resource;

use super::TracerBuilder;
use crate::errors::EngineError;
use crate::errors::EngineResult;

/// Send traces to an OpenTelemetry collector:
/// https://opentelemetry.io/docs/collector/
///
/// Only gRPC is supported, so enable it in the collector config.
pub(super) struct OtlpTracingConfig {
    pub(super) service_name: String,
    pub(super) url: Option<String>,
    pub(super) sampling_ratio: f64,
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> EngineResult<Tracer> {
        let mut exporter = opentelemetry_otlp::new_exporter().tonic();
        if let Some(endpoint) = self.url.as_ref() {
            exporter = exporter.with_endpoint(endpoint);
        }

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(|err| EngineError::Config(format!("error installing OTLP tracer: {err}")))
    }
}
