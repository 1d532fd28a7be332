//! Prometheus metrics.
//!
//! Instruments are created through the OpenTelemetry global meter
//! named `amber`. [`initialize_metrics`] installs a provider that
//! exports them into the default prometheus registry, which
//! [`encode_metrics`] renders in the text exposition format. Before
//! it is called every instrument is a no-op.
//!
//! | Instrument | Kind |
//! |---|---|
//! | `worker.process.duration` | histogram, seconds per batch |
//! | `controller.query.duration` | histogram, seconds per round |
//! | `controller.rpc.failures` | counter |
//! | `runtime.dead_letters` | counter |
//! | `deploy.workers` | counter, by `outcome` |

use opentelemetry::global;
use opentelemetry::metrics::Meter;
use opentelemetry_sdk::metrics::new_view;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::TextEncoder;

use crate::errors::EngineError;
use crate::errors::EngineResult;

/// The meter every instrument in this crate hangs off.
pub fn meter() -> Meter {
    global::meter("amber")
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> EngineResult<()> {
    // The default registry is a lazy static; this initializes it.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("amber")
        .build()
        .map_err(|err| EngineError::Metrics(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            new_view(
                // Must match histogram names.
                Instrument::new().name("*duration*"),
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| EngineError::Metrics(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Everything in the default registry, prometheus text format.
pub fn encode_metrics() -> EngineResult<String> {
    TextEncoder::new()
        .encode_to_string(&default_registry().gather())
        .map_err(|err| EngineError::Metrics(err.to_string()))
}

#[test]
fn encoding_works_before_initialization() {
    assert!(encode_metrics().is_ok());
}
