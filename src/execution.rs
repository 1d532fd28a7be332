//! Execution-state model: what is running where.
//!
//! ```text
//! WorkflowExecution
//!  └─ RegionExecution        one per scheduled region
//!      └─ OperatorExecution  one per operator in that region
//!          └─ WorkerExecution  one per worker, in worker index order
//! ```
//!
//! An operator can be scheduled more than once in the same workflow
//! run, each time in a new region execution. Every such execution is
//! a generation; lookups by operator or worker identity resolve to
//! the newest one.
//!
//! The whole tree is shared as an [`ExecutionState`]. Every mutation
//! goes through the methods here while holding the write guard, so a
//! reader never sees half of a worker's update.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::addresses::NodeAddress;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::identity::ActorVirtualIdentity;
use crate::identity::OperatorIdentity;
use crate::identity::RegionIdentity;
use crate::worker::profile::TableProfile;
use crate::worker::WorkerState;
use crate::worker::WorkerStatistics;

/// The shared, lockable model.
pub type ExecutionState = Arc<RwLock<WorkflowExecution>>;

/// Whether a worker's numbers came from the latest query round.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Freshness {
    #[default]
    NeverReported,
    Current {
        round: u64,
    },
    /// Last known data is kept but didn't come from the latest round.
    Stale {
        since_round: u64,
        reason: String,
    },
}

impl Freshness {
    pub fn is_current(&self) -> bool {
        matches!(self, Self::Current { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerExecution {
    id: ActorVirtualIdentity,
    address: Option<NodeAddress>,
    state: WorkerState,
    stats: WorkerStatistics,
    table_profile: Option<TableProfile>,
    freshness: Freshness,
}

impl WorkerExecution {
    fn new(id: ActorVirtualIdentity) -> Self {
        Self {
            id,
            address: None,
            state: WorkerState::Uninitialized,
            stats: WorkerStatistics::default(),
            table_profile: None,
            freshness: Freshness::NeverReported,
        }
    }

    pub fn id(&self) -> &ActorVirtualIdentity {
        &self.id
    }

    /// Node the worker was placed on.
    pub fn address(&self) -> Option<&NodeAddress> {
        self.address.as_ref()
    }

    pub fn set_address(&mut self, address: NodeAddress) {
        self.address = Some(address);
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> &WorkerStatistics {
        &self.stats
    }

    pub fn table_profile(&self) -> Option<&TableProfile> {
        self.table_profile.as_ref()
    }

    pub fn freshness(&self) -> &Freshness {
        &self.freshness
    }

    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
    }

    pub fn set_stats(&mut self, stats: WorkerStatistics) {
        self.stats = stats;
    }

    pub fn set_table_profile(&mut self, profile: Option<TableProfile>) {
        self.table_profile = profile;
    }

    pub fn mark_current(&mut self, round: u64) {
        self.freshness = Freshness::Current { round };
    }

    /// Keep the last known data but flag it. A worker that stays
    /// unreachable keeps the round it first went stale in.
    pub fn mark_stale(&mut self, round: u64, reason: impl Into<String>) {
        let since_round = match self.freshness {
            Freshness::Stale { since_round, .. } => since_round,
            _ => round,
        };
        self.freshness = Freshness::Stale {
            since_round,
            reason: reason.into(),
        };
    }
}

/// Aggregated view of one operator's workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorStatistics {
    pub state: WorkerState,
    pub stats: WorkerStatistics,
    pub worker_count: usize,
    /// Workers whose numbers above are not from the latest round.
    pub stale_workers: Vec<ActorVirtualIdentity>,
}

pub type RegionStatistics = BTreeMap<OperatorIdentity, OperatorStatistics>;

pub type RegionTableProfiles = BTreeMap<OperatorIdentity, BTreeMap<ActorVirtualIdentity, TableProfile>>;

/// Combine worker states into one operator state.
fn aggregate_state(states: impl Iterator<Item = WorkerState>) -> WorkerState {
    let states: Vec<_> = states.collect();
    let all = |s: WorkerState| !states.is_empty() && states.iter().all(|x| *x == s);
    let any = |s: WorkerState| states.contains(&s);
    if any(WorkerState::Failed) {
        WorkerState::Failed
    } else if all(WorkerState::Completed) {
        WorkerState::Completed
    } else if any(WorkerState::Running) {
        WorkerState::Running
    } else if any(WorkerState::Paused) {
        WorkerState::Paused
    } else if any(WorkerState::Initializing) {
        WorkerState::Initializing
    } else if any(WorkerState::Completed) {
        // Some done, the rest not started yet.
        WorkerState::Running
    } else {
        WorkerState::Uninitialized
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorExecution {
    operator_id: OperatorIdentity,
    workers: Vec<WorkerExecution>,
    #[serde(skip)]
    index: HashMap<ActorVirtualIdentity, usize>,
}

impl OperatorExecution {
    fn new(operator_id: OperatorIdentity) -> Self {
        Self {
            operator_id,
            workers: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn operator_id(&self) -> &OperatorIdentity {
        &self.operator_id
    }

    /// Register a worker. Each identity can be registered once per
    /// operator execution.
    pub fn init_worker_execution(&mut self, worker: ActorVirtualIdentity) -> EngineResult<&mut WorkerExecution> {
        if self.index.contains_key(&worker) {
            return Err(EngineError::DuplicateWorker(worker));
        }
        let pos = self.workers.len();
        self.index.insert(worker.clone(), pos);
        self.workers.push(WorkerExecution::new(worker));
        Ok(&mut self.workers[pos])
    }

    pub fn get_worker_execution(&self, worker: &ActorVirtualIdentity) -> Option<&WorkerExecution> {
        self.index.get(worker).map(|pos| &self.workers[*pos])
    }

    pub fn get_worker_execution_mut(&mut self, worker: &ActorVirtualIdentity) -> Option<&mut WorkerExecution> {
        match self.index.get(worker) {
            Some(pos) => self.workers.get_mut(*pos),
            None => None,
        }
    }

    /// Worker identities in worker index order.
    pub fn worker_ids(&self) -> impl Iterator<Item = &ActorVirtualIdentity> {
        self.workers.iter().map(WorkerExecution::id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerExecution> {
        self.workers.iter()
    }

    pub fn aggregated_stats(&self) -> OperatorStatistics {
        let mut stats = WorkerStatistics::default();
        for worker in &self.workers {
            stats += worker.stats;
        }
        OperatorStatistics {
            state: aggregate_state(self.workers.iter().map(WorkerExecution::state)),
            stats,
            worker_count: self.workers.len(),
            stale_workers: self
                .workers
                .iter()
                .filter(|w| matches!(w.freshness, Freshness::Stale { .. }))
                .map(|w| w.id.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionExecution {
    region_id: RegionIdentity,
    operators: Vec<OperatorExecution>,
    #[serde(skip)]
    index: HashMap<OperatorIdentity, usize>,
}

impl RegionExecution {
    fn new(region_id: RegionIdentity) -> Self {
        Self {
            region_id,
            operators: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn region_id(&self) -> RegionIdentity {
        self.region_id
    }

    pub fn get_operator_execution(&self, operator: &OperatorIdentity) -> Option<&OperatorExecution> {
        self.index.get(operator).map(|pos| &self.operators[*pos])
    }

    fn get_operator_execution_mut(&mut self, operator: &OperatorIdentity) -> Option<&mut OperatorExecution> {
        match self.index.get(operator) {
            Some(pos) => self.operators.get_mut(*pos),
            None => None,
        }
    }

    pub fn get_all_operator_executions(&self) -> impl Iterator<Item = &OperatorExecution> {
        self.operators.iter()
    }

    pub fn stats(&self) -> RegionStatistics {
        self.operators
            .iter()
            .map(|op| (op.operator_id.clone(), op.aggregated_stats()))
            .collect()
    }
}

/// Root of the model for one workflow run.
#[derive(Debug, Default, Serialize)]
pub struct WorkflowExecution {
    regions: Vec<RegionExecution>,
    #[serde(skip)]
    region_index: HashMap<RegionIdentity, usize>,
    /// Region holding the newest generation of each operator.
    #[serde(skip)]
    latest_operator: HashMap<OperatorIdentity, RegionIdentity>,
    /// Operator execution holding the newest registration of each
    /// worker.
    #[serde(skip)]
    latest_worker: HashMap<ActorVirtualIdentity, (RegionIdentity, OperatorIdentity)>,
}

impl WorkflowExecution {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh model ready to share.
    pub fn shared() -> ExecutionState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn init_region_execution(&mut self, region: RegionIdentity) -> EngineResult<&mut RegionExecution> {
        if self.region_index.contains_key(&region) {
            return Err(EngineError::DuplicateRegion(region));
        }
        let pos = self.regions.len();
        self.region_index.insert(region, pos);
        self.regions.push(RegionExecution::new(region));
        Ok(&mut self.regions[pos])
    }

    pub fn get_region_execution(&self, region: RegionIdentity) -> Option<&RegionExecution> {
        self.region_index.get(&region).map(|pos| &self.regions[*pos])
    }

    fn get_region_execution_mut(&mut self, region: RegionIdentity) -> Option<&mut RegionExecution> {
        match self.region_index.get(&region) {
            Some(pos) => self.regions.get_mut(*pos),
            None => None,
        }
    }

    /// Regions in the order they were scheduled.
    pub fn get_all_region_executions(&self) -> impl Iterator<Item = &RegionExecution> {
        self.regions.iter()
    }

    /// Start a new generation of `operator` inside `region`.
    pub fn init_operator_execution(
        &mut self,
        region: RegionIdentity,
        operator: OperatorIdentity,
    ) -> EngineResult<&mut OperatorExecution> {
        let region_exec = self
            .get_region_execution_mut(region)
            .ok_or(EngineError::UnknownRegion(region))?;
        if region_exec.index.contains_key(&operator) {
            return Err(EngineError::DuplicateOperator { region, operator });
        }
        let pos = region_exec.operators.len();
        region_exec.index.insert(operator.clone(), pos);
        region_exec.operators.push(OperatorExecution::new(operator.clone()));
        self.latest_operator.insert(operator, region);

        let region_exec = self
            .get_region_execution_mut(region)
            .ok_or(EngineError::UnknownRegion(region))?;
        Ok(&mut region_exec.operators[pos])
    }

    /// Newest generation of `operator`.
    pub fn get_latest_operator_execution(&self, operator: &OperatorIdentity) -> Option<&OperatorExecution> {
        let region = self.latest_operator.get(operator)?;
        self.get_region_execution(*region)?
            .get_operator_execution(operator)
    }

    /// Register `worker` in the execution of `operator` in `region`.
    ///
    /// Registering the same identity in a newer generation makes that
    /// one the worker's latest execution; registering it twice in the
    /// same operator execution is an error.
    pub fn register_worker(
        &mut self,
        region: RegionIdentity,
        operator: &OperatorIdentity,
        worker: ActorVirtualIdentity,
    ) -> EngineResult<&mut WorkerExecution> {
        let op_exec = self
            .get_region_execution_mut(region)
            .ok_or(EngineError::UnknownRegion(region))?
            .get_operator_execution_mut(operator)
            .ok_or_else(|| EngineError::UnknownOperator(operator.clone()))?;
        op_exec.init_worker_execution(worker.clone())?;
        self.latest_worker
            .insert(worker.clone(), (region, operator.clone()));
        self.latest_worker_execution_mut(&worker)
            .ok_or(EngineError::UnknownWorker(worker))
    }

    /// Newest execution of `worker`, scoped under its operator.
    pub fn latest_worker_execution(&self, worker: &ActorVirtualIdentity) -> Option<&WorkerExecution> {
        let (region, operator) = self.latest_worker.get(worker)?;
        self.get_region_execution(*region)?
            .get_operator_execution(operator)?
            .get_worker_execution(worker)
    }

    pub fn latest_worker_execution_mut(&mut self, worker: &ActorVirtualIdentity) -> Option<&mut WorkerExecution> {
        let (region, operator) = self.latest_worker.get(worker)?.clone();
        self.get_region_execution_mut(region)?
            .get_operator_execution_mut(&operator)?
            .get_worker_execution_mut(worker)
    }

    /// Every worker known to any operator execution of any region,
    /// each once, in scheduling order.
    pub fn all_worker_ids(&self) -> Vec<ActorVirtualIdentity> {
        let mut seen = HashSet::new();
        self.regions
            .iter()
            .flat_map(|region| region.operators.iter())
            .flat_map(OperatorExecution::worker_ids)
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    pub fn get_all_region_executions_stats(&self) -> BTreeMap<RegionIdentity, RegionStatistics> {
        self.regions
            .iter()
            .map(|region| (region.region_id, region.stats()))
            .collect()
    }

    /// Table profiles of every worker that reported one.
    pub fn get_all_region_executions_table_profiles(&self) -> BTreeMap<RegionIdentity, RegionTableProfiles> {
        self.regions
            .iter()
            .map(|region| {
                let profiles = region
                    .operators
                    .iter()
                    .map(|op| {
                        let by_worker = op
                            .workers
                            .iter()
                            .filter_map(|w| w.table_profile.clone().map(|p| (w.id.clone(), p)))
                            .collect();
                        (op.operator_id.clone(), by_worker)
                    })
                    .collect();
                (region.region_id, profiles)
            })
            .collect()
    }

    /// Drop everything, ready for a new run.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
fn op(name: &str) -> OperatorIdentity {
    OperatorIdentity::new(name)
}

#[cfg(test)]
fn wid(name: &str) -> ActorVirtualIdentity {
    ActorVirtualIdentity::new(name)
}

#[test]
fn register_then_lookup_returns_same_worker() {
    let mut model = WorkflowExecution::new();
    model.init_region_execution(RegionIdentity(0)).unwrap();
    model
        .init_operator_execution(RegionIdentity(0), op("scan"))
        .unwrap();
    model
        .register_worker(RegionIdentity(0), &op("scan"), wid("Worker:scan-0"))
        .unwrap()
        .set_state(WorkerState::Running);

    let found = model.latest_worker_execution(&wid("Worker:scan-0")).unwrap();
    assert_eq!(found.id(), &wid("Worker:scan-0"));
    assert_eq!(found.state(), WorkerState::Running);
    let again = model.latest_worker_execution(&wid("Worker:scan-0")).unwrap();
    assert_eq!(again.id(), found.id());

    let via_operator = model
        .get_latest_operator_execution(&op("scan"))
        .unwrap()
        .get_worker_execution(&wid("Worker:scan-0"))
        .unwrap();
    assert_eq!(via_operator.state(), WorkerState::Running);
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut model = WorkflowExecution::new();
    model.init_region_execution(RegionIdentity(0)).unwrap();
    model
        .init_operator_execution(RegionIdentity(0), op("scan"))
        .unwrap();
    model
        .register_worker(RegionIdentity(0), &op("scan"), wid("Worker:scan-0"))
        .unwrap()
        .set_state(WorkerState::Completed);
    let err = model
        .register_worker(RegionIdentity(0), &op("scan"), wid("Worker:scan-0"))
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateWorker(_)));
    // The original entry is untouched.
    assert_eq!(
        model
            .latest_worker_execution(&wid("Worker:scan-0"))
            .unwrap()
            .state(),
        WorkerState::Completed
    );
}

#[test]
fn latest_generation_wins() {
    let mut model = WorkflowExecution::new();
    for region in [RegionIdentity(1), RegionIdentity(2)] {
        model.init_region_execution(region).unwrap();
        model.init_operator_execution(region, op("join")).unwrap();
        model
            .register_worker(region, &op("join"), wid("Worker:join-0"))
            .unwrap();
    }
    model
        .latest_worker_execution_mut(&wid("Worker:join-0"))
        .unwrap()
        .set_state(WorkerState::Paused);

    let latest = model.get_latest_operator_execution(&op("join")).unwrap();
    assert_eq!(
        latest.get_worker_execution(&wid("Worker:join-0")).unwrap().state(),
        WorkerState::Paused
    );
    let first = model
        .get_region_execution(RegionIdentity(1))
        .unwrap()
        .get_operator_execution(&op("join"))
        .unwrap();
    assert_eq!(
        first.get_worker_execution(&wid("Worker:join-0")).unwrap().state(),
        WorkerState::Uninitialized
    );
    assert_eq!(model.all_worker_ids(), vec![wid("Worker:join-0")]);
}

#[test]
fn unknown_parents_are_errors() {
    let mut model = WorkflowExecution::new();
    assert!(matches!(
        model.init_operator_execution(RegionIdentity(9), op("x")),
        Err(EngineError::UnknownRegion(_))
    ));
    model.init_region_execution(RegionIdentity(9)).unwrap();
    assert!(matches!(
        model.init_region_execution(RegionIdentity(9)),
        Err(EngineError::DuplicateRegion(_))
    ));
    assert!(matches!(
        model.register_worker(RegionIdentity(9), &op("x"), wid("w")),
        Err(EngineError::UnknownOperator(_))
    ));
}

#[test]
fn operator_stats_sum_workers_and_list_stale() {
    let mut model = WorkflowExecution::new();
    model.init_region_execution(RegionIdentity(0)).unwrap();
    model
        .init_operator_execution(RegionIdentity(0), op("map"))
        .unwrap();
    for i in 0..3 {
        let worker = model
            .register_worker(RegionIdentity(0), &op("map"), wid(&format!("Worker:map-{i}")))
            .unwrap();
        worker.set_state(WorkerState::Running);
        worker.set_stats(WorkerStatistics {
            input_tuple_count: 10,
            output_tuple_count: 5,
            ..Default::default()
        });
        worker.mark_current(1);
    }
    let stale = model.latest_worker_execution_mut(&wid("Worker:map-2")).unwrap();
    stale.mark_stale(2, "timeout");
    stale.mark_stale(3, "timeout");
    assert_eq!(
        stale.freshness(),
        &Freshness::Stale {
            since_round: 2,
            reason: "timeout".to_string()
        }
    );

    let stats = model.get_all_region_executions_stats();
    let map = &stats[&RegionIdentity(0)][&op("map")];
    assert_eq!(map.worker_count, 3);
    assert_eq!(map.stats.input_tuple_count, 30);
    assert_eq!(map.stats.output_tuple_count, 15);
    assert_eq!(map.state, WorkerState::Running);
    assert_eq!(map.stale_workers, vec![wid("Worker:map-2")]);
}

#[test]
fn aggregate_state_rules() {
    use WorkerState::*;
    assert_eq!(aggregate_state([Running, Failed].into_iter()), Failed);
    assert_eq!(aggregate_state([Completed, Completed].into_iter()), Completed);
    assert_eq!(aggregate_state([Completed, Paused].into_iter()), Paused);
    assert_eq!(aggregate_state([Initializing, Uninitialized].into_iter()), Initializing);
    assert_eq!(aggregate_state(std::iter::empty()), Uninitialized);
}
