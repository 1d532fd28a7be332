//! Turning operator configurations into live workers.
//!
//! Deployment of one operator happens in two phases. First worker
//! ids are checked to be unique and every worker is placed against a
//! single [`AddressInfo`] snapshot; if any of that fails nothing is
//! created and the error is returned. Then every worker is created at its address and
//! registered in the execution model exactly once.
//!
//! Creation does not wait for workers to be ready. A worker whose
//! node refused to start it is still registered, in the `Failed`
//! state, and listed in [`DeploymentReport::failed`] so "never
//! placed" and "placed but did not start" stay distinguishable.
//!
//! [`AddressInfo`]: crate::addresses::AddressInfo
//! [`PlacementError`]: crate::errors::PlacementError

use std::collections::HashSet;

use futures::future::join_all;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use serde::Deserialize;
use serde::Serialize;
use tracing::instrument;

use crate::addresses::NodeAddress;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::ErrorContext;
use crate::execution::ExecutionState;
use crate::identity::ActorVirtualIdentity;
use crate::identity::OperatorIdentity;
use crate::identity::RegionIdentity;
use crate::placement::resolve_location;
use crate::placement::LocationPreference;
use crate::recovery::FaultToleranceConfig;
use crate::recovery::StateRestoreConfig;
use crate::runtime::Runtime;
use crate::worker::executor::ExecutorSpec;
use crate::worker::WorkerSpec;
use crate::worker::WorkerState;

/// Sizing hints for one worker. Carried along for whatever hosts the
/// worker; placement ignores them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: ActorVirtualIdentity,
    #[serde(default)]
    pub resources: ResourceHints,
}

/// Everything the deployer needs to know about one physical
/// operator. Workers are placed in list order; the position in the
/// list is the worker index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub operator_id: OperatorIdentity,
    pub executor: ExecutorSpec,
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub location_preference: LocationPreference,
    #[serde(default)]
    pub fault_tolerance: Option<FaultToleranceConfig>,
    #[serde(default)]
    pub state_restore: Option<StateRestoreConfig>,
}

impl OperatorConfig {
    /// `count` workers with conventional identities and no hints.
    pub fn with_workers(
        operator_id: OperatorIdentity,
        executor: ExecutorSpec,
        count: usize,
        location_preference: LocationPreference,
    ) -> Self {
        let workers = (0..count)
            .map(|index| WorkerConfig {
                worker_id: ActorVirtualIdentity::worker(&operator_id, index),
                resources: ResourceHints::default(),
            })
            .collect();
        Self {
            operator_id,
            executor,
            workers,
            location_preference,
            fault_tolerance: None,
            state_restore: None,
        }
    }

    fn worker_spec(&self, worker: &WorkerConfig) -> WorkerSpec {
        WorkerSpec {
            worker_id: worker.worker_id.clone(),
            operator_id: self.operator_id.clone(),
            executor: self.executor.clone(),
            fault_tolerance: self.fault_tolerance.clone(),
            state_restore: self.state_restore.clone(),
        }
    }
}

/// Outcome of deploying one operator.
#[derive(Debug, Default)]
pub struct DeploymentReport {
    /// Workers whose node accepted them, with where they went.
    pub deployed: Vec<(ActorVirtualIdentity, NodeAddress)>,
    /// One [`EngineError::Deployment`] per worker that was placed but
    /// did not start.
    pub failed: Vec<EngineError>,
}

impl DeploymentReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct WorkerDeployer {
    runtime: Runtime,
    state: ExecutionState,
    outcomes: Counter<u64>,
}

impl WorkerDeployer {
    pub fn new(runtime: Runtime, state: ExecutionState) -> Self {
        let outcomes = crate::metrics::meter()
            .u64_counter("deploy.workers")
            .with_description("Workers the deployer tried to start, by outcome")
            .init();
        Self {
            runtime,
            state,
            outcomes,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Create the region's execution and deploy each operator into it.
    ///
    /// Stops at the first operator that can't be placed; operators
    /// deployed before it stay deployed.
    #[instrument(name = "schedule_region", skip(self, operators), fields(operators = operators.len()))]
    pub async fn schedule_region(
        &self,
        region: RegionIdentity,
        operators: &[OperatorConfig],
    ) -> EngineResult<Vec<DeploymentReport>> {
        self.state.write().await.init_region_execution(region)?;
        let mut reports = Vec::with_capacity(operators.len());
        for config in operators {
            let report = self
                .deploy_operator(region, config)
                .await
                .reraise(&format!("error scheduling {region}"))?;
            reports.push(report);
        }
        Ok(reports)
    }

    #[instrument(name = "deploy_operator", skip(self, config), fields(operator = %config.operator_id))]
    pub async fn deploy_operator(
        &self,
        region: RegionIdentity,
        config: &OperatorConfig,
    ) -> EngineResult<DeploymentReport> {
        let mut seen = HashSet::new();
        let repeated = config
            .workers
            .iter()
            .map(|worker| &worker.worker_id)
            .find(|id| !seen.insert(*id));
        if let Some(id) = repeated {
            return Err(EngineError::DuplicateWorker(id.clone())).reraise(&format!(
                "operator {} lists worker {id} more than once",
                config.operator_id
            ));
        }

        let addresses = self.runtime.registry().current_addresses();
        let placements = config
            .workers
            .iter()
            .enumerate()
            .map(|(index, worker)| {
                resolve_location(index, &config.location_preference, &addresses)
                    .map(|address| (worker, address))
            })
            .collect::<Result<Vec<_>, _>>()
            .reraise(&format!(
                "error placing operator {} with {} preference",
                config.operator_id, config.location_preference
            ))?;

        self.state
            .write()
            .await
            .init_operator_execution(region, config.operator_id.clone())?;

        let created = join_all(placements.into_iter().map(|(worker, address)| async move {
            let spec = config.worker_spec(worker);
            let result = self.runtime.create_worker(&address, spec).await;
            (worker.worker_id.clone(), address, result)
        }))
        .await;

        let mut report = DeploymentReport::default();
        let mut state = self.state.write().await;
        for (worker, address, result) in created {
            let execution = match state.register_worker(region, &config.operator_id, worker.clone()) {
                Ok(execution) => execution,
                Err(err) => {
                    tracing::error!("Can't register {worker}: {err}");
                    report.failed.push(err);
                    continue;
                }
            };
            execution.set_address(address.clone());
            match result {
                Ok(()) => {
                    tracing::debug!("Deployed {worker} at {address}");
                    self.outcomes.add(1, &[KeyValue::new("outcome", "deployed")]);
                    report.deployed.push((worker, address));
                }
                Err(err) => {
                    tracing::error!("{err}");
                    execution.set_state(WorkerState::Failed);
                    self.outcomes.add(1, &[KeyValue::new("outcome", "failed")]);
                    report.failed.push(err);
                }
            }
        }
        tracing::info!(
            "Deployed operator {} in {region}: {} started, {} failed",
            config.operator_id,
            report.deployed.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
async fn local_deployer() -> WorkerDeployer {
    let runtime = Runtime::start(&crate::config::EngineConfig::default())
        .await
        .unwrap();
    WorkerDeployer::new(runtime, crate::execution::WorkflowExecution::shared())
}

#[tokio::test]
async fn every_worker_is_registered_once() {
    let deployer = local_deployer().await;
    let op = OperatorIdentity::new("scan");
    let config = OperatorConfig::with_workers(
        op.clone(),
        ExecutorSpec::native("pass-through"),
        3,
        LocationPreference::RoundRobin,
    );
    let reports = deployer
        .schedule_region(RegionIdentity(1), &[config])
        .await
        .unwrap();
    assert!(reports[0].is_complete());
    assert_eq!(reports[0].deployed.len(), 3);

    let state = deployer.state().read().await;
    let op_exec = state.get_latest_operator_execution(&op).unwrap();
    assert_eq!(op_exec.worker_ids().count(), 3);
    for index in 0..3 {
        let worker = ActorVirtualIdentity::worker(&op, index);
        let execution = op_exec.get_worker_execution(&worker).unwrap();
        assert_eq!(execution.id(), &worker);
    }
}

#[tokio::test]
async fn bad_placement_creates_nothing() {
    let deployer = local_deployer().await;
    deployer
        .state()
        .write()
        .await
        .init_region_execution(RegionIdentity(1))
        .unwrap();
    let op = OperatorIdentity::new("sink");
    let config = OperatorConfig::with_workers(
        op.clone(),
        ExecutorSpec::native("pass-through"),
        2,
        LocationPreference::GoToSpecificNode("nowhere:9".to_string()),
    );
    let err = deployer
        .deploy_operator(RegionIdentity(1), &config)
        .await
        .unwrap_err();
    assert!(err.is_placement());
    assert!(err.to_string().contains("known hosts"));

    assert!(deployer.state().read().await.get_latest_operator_execution(&op).is_none());
    assert!(deployer
        .runtime
        .local_worker(&ActorVirtualIdentity::worker(&op, 0))
        .is_none());
}

#[tokio::test]
async fn failed_start_is_reported_not_dropped() {
    let deployer = local_deployer().await;
    deployer
        .state()
        .write()
        .await
        .init_region_execution(RegionIdentity(2))
        .unwrap();
    let op = OperatorIdentity::new("udf");
    let config = OperatorConfig::with_workers(
        op.clone(),
        ExecutorSpec::native("no-such-executor"),
        1,
        LocationPreference::PreferController,
    );
    let report = deployer
        .deploy_operator(RegionIdentity(2), &config)
        .await
        .unwrap();
    assert!(report.deployed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].is_deployment());

    let state = deployer.state().read().await;
    let worker = ActorVirtualIdentity::worker(&op, 0);
    assert_eq!(
        state.latest_worker_execution(&worker).unwrap().state(),
        WorkerState::Failed
    );
}

#[tokio::test]
async fn rescheduling_starts_a_new_generation() {
    let deployer = local_deployer().await;
    let op = OperatorIdentity::new("agg");
    let config = OperatorConfig::with_workers(
        op.clone(),
        ExecutorSpec::native("pass-through"),
        1,
        LocationPreference::PreferController,
    );
    deployer
        .schedule_region(RegionIdentity(1), &[config.clone()])
        .await
        .unwrap();
    deployer
        .schedule_region(RegionIdentity(2), &[config])
        .await
        .unwrap();

    let state = deployer.state().read().await;
    assert_eq!(state.get_all_region_executions().count(), 2);
    let worker = ActorVirtualIdentity::worker(&op, 0);
    assert_eq!(
        state.latest_worker_execution(&worker).unwrap().id(),
        &worker
    );
    assert!(state
        .get_region_execution(RegionIdentity(2))
        .unwrap()
        .get_operator_execution(&op)
        .unwrap()
        .get_worker_execution(&worker)
        .is_some());
}

#[tokio::test]
async fn repeated_worker_ids_create_nothing() {
    let deployer = local_deployer().await;
    deployer
        .state()
        .write()
        .await
        .init_region_execution(RegionIdentity(4))
        .unwrap();
    let op = OperatorIdentity::new("dup");
    let mut config = OperatorConfig::with_workers(
        op.clone(),
        ExecutorSpec::native("pass-through"),
        2,
        LocationPreference::PreferController,
    );
    config.workers[1].worker_id = config.workers[0].worker_id.clone();

    let err = deployer
        .deploy_operator(RegionIdentity(4), &config)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("more than once"), "{err}");
    assert!(deployer.state().read().await.get_latest_operator_execution(&op).is_none());
    assert!(deployer
        .runtime
        .local_worker(&ActorVirtualIdentity::worker(&op, 0))
        .is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn slow_interpreters_do_not_hold_up_deployment() {
    let deployer = local_deployer().await;
    deployer
        .state()
        .write()
        .await
        .init_region_execution(RegionIdentity(5))
        .unwrap();
    let op = OperatorIdentity::new("py");
    let script = r#"sleep 2; while read -r line; do echo '{}'; done"#;
    let config = OperatorConfig::with_workers(
        op.clone(),
        ExecutorSpec::cross_language("sh", vec!["-c".to_string(), script.to_string()]),
        2,
        LocationPreference::RoundRobin,
    );

    let started = std::time::Instant::now();
    let report = deployer
        .deploy_operator(RegionIdentity(5), &config)
        .await
        .unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(1));
    assert!(report.is_complete());

    for index in 0..2 {
        let worker = deployer
            .runtime
            .local_worker(&ActorVirtualIdentity::worker(&op, index))
            .unwrap();
        assert_ne!(worker.state(), WorkerState::Running);
        worker
            .wait_for_state(|s| s == WorkerState::Running, std::time::Duration::from_secs(10))
            .await
            .unwrap();
    }
}
