//! Controller side of the control plane.
//!
//! [`ControllerRpc::query_worker_statistics`] fans two queries out to
//! every targeted worker at once, a statistics query and a table
//! profile query, each bounded by the controller's timeout. As soon
//! as both of a worker's replies are in, its state, statistics and
//! profile are written to the model under one write guard. When every
//! worker is done, exactly one [`ExecutionStatsUpdate`] is published.
//!
//! A worker that fails a round keeps its last known numbers and is
//! marked stale. Updates built while any worker is not current carry
//! `partial: true` and list those workers, so observers never mistake
//! old numbers for fresh ones.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use futures::future::join_all;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

use crate::addresses::AddressInfo;
use crate::addresses::NodeAddress;
use crate::errors::EngineError;
use crate::errors::RpcFailure;
use crate::execution::ExecutionState;
use crate::execution::RegionStatistics;
use crate::execution::RegionTableProfiles;
use crate::execution::WorkflowExecution;
use crate::identity::ActorVirtualIdentity;
use crate::identity::RegionIdentity;
use crate::runtime::Runtime;
use crate::with_timer;
use crate::worker::ControlCommand;
use crate::worker::ControlReply;

/// How the controller reaches workers.
pub trait WorkerRpc: Send + Sync + 'static {
    fn ask(
        &self,
        worker: &ActorVirtualIdentity,
        command: ControlCommand,
        timeout: Duration,
    ) -> impl Future<Output = Result<ControlReply, RpcFailure>> + Send;

    fn addresses(&self) -> Arc<AddressInfo>;
}

impl WorkerRpc for Runtime {
    fn ask(
        &self,
        worker: &ActorVirtualIdentity,
        command: ControlCommand,
        timeout: Duration,
    ) -> impl Future<Output = Result<ControlReply, RpcFailure>> + Send {
        Runtime::ask(self, worker, command, timeout)
    }

    fn addresses(&self) -> Arc<AddressInfo> {
        self.registry().current_addresses()
    }
}

/// What observers get after each query round.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatsUpdate {
    pub round: u64,
    pub generated_at: DateTime<Utc>,
    /// Some workers' numbers are not from a successful round.
    pub partial: bool,
    pub regions: BTreeMap<RegionIdentity, RegionStatistics>,
    pub table_profiles: BTreeMap<RegionIdentity, RegionTableProfiles>,
    pub addresses: Vec<NodeAddress>,
    /// Workers that failed a round, or never answered one.
    pub stale_workers: Vec<ActorVirtualIdentity>,
}

/// Result of one [`ControllerRpc::query_worker_statistics`] call.
#[derive(Debug, Clone)]
pub struct StatisticsRound {
    pub round: u64,
    pub updated: Vec<ActorVirtualIdentity>,
    pub failed: Vec<(ActorVirtualIdentity, RpcFailure)>,
    /// The update that was published for this round.
    pub update: Arc<ExecutionStatsUpdate>,
}

enum Outcome {
    Updated,
    Failed(RpcFailure),
}

pub struct ControllerRpc<R = Runtime> {
    rpc: R,
    state: ExecutionState,
    timeout: Duration,
    round: AtomicU64,
    updates: broadcast::Sender<Arc<ExecutionStatsUpdate>>,
    query_duration: Histogram<f64>,
    rpc_failures: Counter<u64>,
}

impl<R: WorkerRpc> ControllerRpc<R> {
    pub fn new(rpc: R, state: ExecutionState, timeout: Duration) -> Self {
        let meter = crate::metrics::meter();
        let (updates, _) = broadcast::channel(16);
        Self {
            rpc,
            state,
            timeout,
            round: AtomicU64::new(0),
            updates,
            query_duration: meter
                .f64_histogram("controller.query.duration")
                .with_description("Seconds for one statistics round over all targeted workers")
                .init(),
            rpc_failures: meter
                .u64_counter("controller.rpc.failures")
                .with_description("Control requests that got no usable reply")
                .init(),
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Get every published update from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ExecutionStatsUpdate>> {
        self.updates.subscribe()
    }

    async fn targets(&self, filter: Option<&[ActorVirtualIdentity]>) -> Vec<ActorVirtualIdentity> {
        match filter {
            Some(workers) if !workers.is_empty() => workers.to_vec(),
            _ => self.state.read().await.all_worker_ids(),
        }
    }

    async fn ask_bounded(&self, worker: &ActorVirtualIdentity, command: ControlCommand) -> Result<ControlReply, RpcFailure> {
        // Whatever the transport does, never wait longer than this.
        tokio::time::timeout(self.timeout, self.rpc.ask(worker, command, self.timeout))
            .await
            .unwrap_or(Err(RpcFailure::Timeout(self.timeout)))
    }

    /// Ask both queries of one worker and write the answers back.
    async fn refresh_worker(&self, round: u64, worker: &ActorVirtualIdentity) -> Outcome {
        let (stats, profile) = tokio::join!(
            self.ask_bounded(worker, ControlCommand::QueryStatistics),
            self.ask_bounded(worker, ControlCommand::QueryTableProfile),
        );

        let reply = match (stats, profile) {
            (Ok(ControlReply::Statistics { state, stats }), Ok(ControlReply::TableProfile(profile))) => {
                Ok((state, stats, profile))
            }
            (Err(failure), _) | (_, Err(failure)) => Err(failure),
            (stats, profile) => Err(RpcFailure::Rejected(format!(
                "mismatched replies {stats:?} and {profile:?}"
            ))),
        };

        let mut model = self.state.write().await;
        let Some(execution) = model.latest_worker_execution_mut(worker) else {
            tracing::warn!("Queried {worker}, which is not in the execution model");
            return Outcome::Failed(RpcFailure::Unreachable);
        };
        match reply {
            Ok((state, stats, profile)) => {
                execution.set_state(state);
                execution.set_stats(stats);
                execution.set_table_profile(profile);
                execution.mark_current(round);
                Outcome::Updated
            }
            Err(failure) => {
                let err = EngineError::Rpc {
                    worker: worker.clone(),
                    failure: failure.clone(),
                };
                tracing::warn!("Statistics round {round}: {err}");
                execution.mark_stale(round, failure.to_string());
                Outcome::Failed(failure)
            }
        }
    }

    /// Refresh the model from the given workers, or from every known
    /// worker when `filter` is absent or empty, then publish one
    /// update.
    #[instrument(name = "query_worker_statistics", skip_all)]
    pub async fn query_worker_statistics(&self, filter: Option<&[ActorVirtualIdentity]>) -> StatisticsRound {
        let round = self.round.fetch_add(1, Ordering::Relaxed) + 1;
        let targets = self.targets(filter).await;
        tracing::debug!("Statistics round {round} over {} workers", targets.len());

        let outcomes = with_timer!(
            self.query_duration,
            [KeyValue::new("filtered", filter.is_some())],
            join_all(targets.iter().map(|worker| self.refresh_worker(round, worker))).await
        );

        let mut updated = Vec::new();
        let mut failed = Vec::new();
        for (worker, outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Outcome::Updated => updated.push(worker),
                Outcome::Failed(failure) => {
                    self.rpc_failures.add(1, &[]);
                    failed.push((worker, failure));
                }
            }
        }

        let update = Arc::new(self.build_update(round, &*self.state.read().await));
        if self.updates.send(update.clone()).is_err() {
            tracing::trace!("No observers for round {round}");
        }
        StatisticsRound {
            round,
            updated,
            failed,
            update,
        }
    }

    /// The update a round would publish right now, without asking any
    /// worker.
    pub async fn snapshot(&self) -> ExecutionStatsUpdate {
        let round = self.round.load(Ordering::Relaxed);
        self.build_update(round, &*self.state.read().await)
    }

    fn build_update(&self, round: u64, model: &WorkflowExecution) -> ExecutionStatsUpdate {
        let stale_workers: Vec<_> = model
            .all_worker_ids()
            .into_iter()
            .filter(|worker| {
                model
                    .latest_worker_execution(worker)
                    .map_or(false, |execution| !execution.freshness().is_current())
            })
            .collect();
        ExecutionStatsUpdate {
            round,
            generated_at: Utc::now(),
            partial: !stale_workers.is_empty(),
            regions: model.get_all_region_executions_stats(),
            table_profiles: model.get_all_region_executions_table_profiles(),
            addresses: self.rpc.addresses().all_addresses.clone(),
            stale_workers,
        }
    }

    /// Send `command` to the given workers, or to every known worker,
    /// all at once. Nothing is written to the model; state changes
    /// show up in the next statistics round.
    #[instrument(name = "send_control", skip(self, filter))]
    pub async fn send_control(
        &self,
        filter: Option<&[ActorVirtualIdentity]>,
        command: ControlCommand,
    ) -> Vec<(ActorVirtualIdentity, Result<ControlReply, RpcFailure>)> {
        let targets = self.targets(filter).await;
        let replies = join_all(
            targets
                .iter()
                .map(|worker| self.ask_bounded(worker, command.clone())),
        )
        .await;
        let results: Vec<_> = targets.into_iter().zip(replies).collect();
        for (worker, result) in &results {
            if let Err(failure) = result {
                self.rpc_failures.add(1, &[]);
                let err = EngineError::Rpc {
                    worker: worker.clone(),
                    failure: failure.clone(),
                };
                tracing::warn!("{command:?}: {err}");
            }
        }
        results
    }
}

/// Run a statistics round over every known worker once per `period`
/// until the returned task is aborted. A round that overruns the
/// period pushes the next one back instead of bunching them up.
pub fn spawn_status_updates<R: WorkerRpc>(controller: Arc<ControllerRpc<R>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let round = controller.query_worker_statistics(None).await;
            if !round.failed.is_empty() {
                tracing::debug!(
                    "Status round {} missed {} of {} workers",
                    round.round,
                    round.failed.len(),
                    round.failed.len() + round.updated.len()
                );
            }
        }
    })
}

#[cfg(test)]
mod fake {
    use std::collections::HashSet;

    use super::*;
    use crate::worker::WorkerState;
    use crate::worker::WorkerStatistics;

    /// Answers like a running worker, except for the workers in
    /// `silent`, which never answer at all.
    pub(super) struct FakeWorkers {
        pub(super) silent: HashSet<ActorVirtualIdentity>,
    }

    impl WorkerRpc for FakeWorkers {
        fn ask(
            &self,
            worker: &ActorVirtualIdentity,
            command: ControlCommand,
            _timeout: Duration,
        ) -> impl Future<Output = Result<ControlReply, RpcFailure>> + Send {
            let silent = self.silent.contains(worker);
            async move {
                if silent {
                    futures::future::pending::<()>().await;
                }
                Ok(match command {
                    ControlCommand::QueryStatistics => ControlReply::Statistics {
                        state: WorkerState::Running,
                        stats: WorkerStatistics {
                            input_tuple_count: 10,
                            output_tuple_count: 10,
                            ..Default::default()
                        },
                    },
                    ControlCommand::QueryTableProfile => ControlReply::TableProfile(None),
                    ControlCommand::Pause | ControlCommand::Resume => ControlReply::Ack,
                })
            }
        }

        fn addresses(&self) -> Arc<AddressInfo> {
            Arc::new(AddressInfo::solo(NodeAddress::new("ctl", 1)))
        }
    }
}

#[cfg(test)]
async fn controller_with(
    workers: usize,
    silent: &[usize],
) -> (ControllerRpc<fake::FakeWorkers>, Vec<ActorVirtualIdentity>) {
    use crate::identity::OperatorIdentity;

    let op = OperatorIdentity::new("scan");
    let ids: Vec<_> = (0..workers)
        .map(|index| ActorVirtualIdentity::worker(&op, index))
        .collect();
    let state = WorkflowExecution::shared();
    {
        let mut model = state.write().await;
        model.init_region_execution(RegionIdentity(1)).unwrap();
        model.init_operator_execution(RegionIdentity(1), op.clone()).unwrap();
        for id in &ids {
            model.register_worker(RegionIdentity(1), &op, id.clone()).unwrap();
        }
    }
    let rpc = fake::FakeWorkers {
        silent: silent.iter().map(|index| ids[*index].clone()).collect(),
    };
    (
        ControllerRpc::new(rpc, state, Duration::from_millis(100)),
        ids,
    )
}

#[tokio::test]
async fn one_publish_after_every_worker_is_written() {
    let (controller, ids) = controller_with(4, &[]).await;
    let mut updates = controller.subscribe();

    let round = controller.query_worker_statistics(None).await;
    assert_eq!(round.updated.len(), 4);
    assert!(round.failed.is_empty());

    let update = updates.try_recv().unwrap();
    assert!(updates.try_recv().is_err());
    assert!(!update.partial);
    let op_stats = &update.regions[&RegionIdentity(1)][&crate::identity::OperatorIdentity::new("scan")];
    assert_eq!(op_stats.worker_count, 4);
    assert_eq!(op_stats.stats.input_tuple_count, 40);

    let model = controller.state().read().await;
    for id in &ids {
        assert!(model.latest_worker_execution(id).unwrap().freshness().is_current());
    }
}

#[tokio::test]
async fn one_silent_worker_does_not_hold_up_the_rest() {
    let (controller, ids) = controller_with(3, &[1]).await;
    let mut updates = controller.subscribe();

    let round = controller.query_worker_statistics(None).await;
    assert_eq!(round.updated, vec![ids[0].clone(), ids[2].clone()]);
    assert_eq!(
        round.failed,
        vec![(ids[1].clone(), RpcFailure::Timeout(Duration::from_millis(100)))]
    );

    let update = updates.try_recv().unwrap();
    assert!(updates.try_recv().is_err());
    assert!(update.partial);
    assert_eq!(update.stale_workers, vec![ids[1].clone()]);
}

#[tokio::test]
async fn stale_worker_keeps_last_known_numbers() {
    let (controller, ids) = controller_with(2, &[]).await;
    controller.query_worker_statistics(None).await;

    // Same model, but now worker 0 stops answering.
    let silent = fake::FakeWorkers {
        silent: [ids[0].clone()].into_iter().collect(),
    };
    let controller = ControllerRpc::new(silent, controller.state().clone(), Duration::from_millis(50));
    let round = controller.query_worker_statistics(None).await;
    assert_eq!(round.failed.len(), 1);

    let model = controller.state().read().await;
    let stale = model.latest_worker_execution(&ids[0]).unwrap();
    assert_eq!(stale.stats().input_tuple_count, 10);
    assert!(!stale.freshness().is_current());
}

#[tokio::test]
async fn filter_limits_the_round() {
    let (controller, ids) = controller_with(3, &[]).await;
    let round = controller
        .query_worker_statistics(Some(&ids[..1]))
        .await;
    assert_eq!(round.updated, vec![ids[0].clone()]);
    // The others never reported, so the view is partial.
    assert!(round.update.partial);
    assert_eq!(round.update.stale_workers.len(), 2);

    let round = controller.query_worker_statistics(Some(&[][..])).await;
    assert_eq!(round.updated.len(), 3);
    assert!(!round.update.partial);
}

#[tokio::test]
async fn status_updates_keep_coming_on_a_timer() {
    let (controller, _ids) = controller_with(2, &[]).await;
    let controller = Arc::new(controller);
    let mut updates = controller.subscribe();
    let ticker = spawn_status_updates(controller.clone(), Duration::from_millis(20));

    let rounds = tokio::time::timeout(Duration::from_secs(5), async {
        let mut rounds = Vec::new();
        while rounds.len() < 3 {
            rounds.push(updates.recv().await.unwrap().round);
        }
        rounds
    })
    .await
    .unwrap();
    ticker.abort();
    assert_eq!(rounds, vec![1, 2, 3]);

    let model = controller.state().read().await;
    assert!(model
        .all_worker_ids()
        .iter()
        .all(|id| model.latest_worker_execution(id).unwrap().freshness().is_current()));
}

#[tokio::test]
async fn control_fans_out_to_every_worker() {
    let (controller, ids) = controller_with(3, &[2]).await;
    let results = controller.send_control(None, ControlCommand::Pause).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], (ids[0].clone(), Ok(ControlReply::Ack)));
    assert!(results[2].1.is_err());
}

#[tokio::test]
async fn queries_real_workers_through_the_runtime() {
    use crate::deploy::OperatorConfig;
    use crate::deploy::WorkerDeployer;
    use crate::placement::LocationPreference;
    use crate::worker::executor::ExecutorSpec;

    let runtime = Runtime::start(&crate::config::EngineConfig::default())
        .await
        .unwrap();
    let state = WorkflowExecution::shared();
    let deployer = WorkerDeployer::new(runtime.clone(), state.clone());
    let op = crate::identity::OperatorIdentity::new("count");
    deployer
        .schedule_region(
            RegionIdentity(1),
            &[OperatorConfig::with_workers(
                op.clone(),
                ExecutorSpec::native("pass-through"),
                2,
                LocationPreference::RoundRobin,
            )],
        )
        .await
        .unwrap();

    let controller = ControllerRpc::new(runtime, state, Duration::from_secs(5));
    let round = controller.query_worker_statistics(None).await;
    assert_eq!(round.updated.len(), 2);
    assert_eq!(round.update.addresses.len(), 1);
}
