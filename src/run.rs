//! Process entry point.
//!
//! [`node_main`] is everything a node process does: set up logging
//! and metrics, start the runtime in its configured role and, on a
//! master, run statistics rounds on a timer and serve the HTTP API if
//! it is enabled. It then runs until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::config::Role;
use crate::controller::spawn_status_updates;
use crate::controller::ControllerRpc;
use crate::deploy::WorkerDeployer;
use crate::errors::prepend_tname;
use crate::errors::tracked_err;
use crate::errors::EngineResult;
use crate::errors::ErrorContext;
use crate::execution::WorkflowExecution;
use crate::metrics::initialize_metrics;
use crate::runtime::Runtime;
use crate::tracing::setup_tracing;
use crate::webserver::run_webserver;
use crate::webserver::ApiState;

/// Print panics from any thread as one block on stderr, each line
/// prefixed with the thread name.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let msg = if let Some(msg) = info.payload().downcast_ref::<String>() {
            tracked_err(msg)
        } else if let Some(msg) = info.payload().downcast_ref::<&str>() {
            tracked_err(msg)
        } else {
            tracked_err(&format!("{info}"))
        };
        let location = info
            .location()
            .map(|loc| format!("\npanicked at {loc}"))
            .unwrap_or_default();
        let msg = prepend_tname(format!("{msg}{location}"));
        let mut stderr = std::io::stderr().lock();
        std::io::Write::write_all(&mut stderr, msg.as_bytes())
            .unwrap_or_else(|err| eprintln!("Error printing error (that's not good): {err}"));
    }));
}

/// What a master drives workers with. The deployer and the controller
/// read and write the same execution model, so whatever is deployed
/// shows up in the next statistics round.
pub struct MasterServices {
    pub deployer: Arc<WorkerDeployer>,
    pub controller: Arc<ControllerRpc>,
}

impl MasterServices {
    pub fn new(runtime: &Runtime, rpc_timeout: Duration) -> Self {
        let state = WorkflowExecution::shared();
        Self {
            deployer: Arc::new(WorkerDeployer::new(runtime.clone(), state.clone())),
            controller: Arc::new(ControllerRpc::new(runtime.clone(), state, rpc_timeout)),
        }
    }
}

/// Run a node until ctrl-c.
pub async fn node_main(config: EngineConfig) -> EngineResult<()> {
    install_panic_hook();
    setup_tracing(config.tracing_config(), config.log_level.as_deref())
        .reraise("error setting up tracing")?;
    initialize_metrics().reraise("error setting up metrics")?;

    let runtime = Runtime::global(&config)
        .await
        .reraise("error starting runtime")?;

    let mut background = Vec::new();
    if runtime.role() == Role::Master {
        let services = MasterServices::new(&runtime, config.rpc_timeout);
        if let Some(period) = config.status_interval {
            background.push(spawn_status_updates(services.controller.clone(), period));
        }
        if config.api_enabled {
            let state = Arc::new(ApiState {
                runtime: runtime.clone(),
                controller: services.controller.clone(),
            });
            let port = config.api_port;
            let api = tokio::spawn(async move {
                if let Err(err) = run_webserver(state, port).await {
                    tracing::error!("{err}");
                }
            });
            background.push(api);
        }
    }

    tracing::info!("Node {} running as {}; ctrl-c to stop", runtime.address(), runtime.role());
    let stopped = tokio::signal::ctrl_c().await;

    for task in background {
        task.abort();
    }
    runtime.shutdown();
    stopped.reraise("error waiting for ctrl-c")
}

#[tokio::test]
async fn deployed_workers_show_up_in_timed_rounds() {
    use crate::controller::ExecutionStatsUpdate;
    use crate::deploy::OperatorConfig;
    use crate::identity::OperatorIdentity;
    use crate::identity::RegionIdentity;
    use crate::placement::LocationPreference;
    use crate::worker::executor::ExecutorSpec;

    let runtime = Runtime::start(&EngineConfig::default()).await.unwrap();
    let services = MasterServices::new(&runtime, Duration::from_secs(5));
    let mut updates = services.controller.subscribe();
    let ticker = spawn_status_updates(services.controller.clone(), Duration::from_millis(20));

    let op = OperatorIdentity::new("scan");
    services
        .deployer
        .schedule_region(
            RegionIdentity(7),
            &[OperatorConfig::with_workers(
                op.clone(),
                ExecutorSpec::native("pass-through"),
                2,
                LocationPreference::RoundRobin,
            )],
        )
        .await
        .unwrap();

    let update: Arc<ExecutionStatsUpdate> = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let update = updates.recv().await.unwrap();
            if update.regions.contains_key(&RegionIdentity(7)) && !update.partial {
                return update;
            }
        }
    })
    .await
    .unwrap();
    ticker.abort();
    runtime.shutdown();

    assert_eq!(update.regions[&RegionIdentity(7)][&op].worker_count, 2);
}
