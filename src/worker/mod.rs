//! Worker actors.
//!
//! A worker is a tokio task that owns one [`Executor`] and talks to
//! the rest of the process only through its mailbox. Control
//! requests carry a oneshot for the reply. Data batches are
//! fire-and-forget. The lifecycle state is published on a watch
//! channel so creation never has to wait for readiness; callers that
//! care observe [`WorkerHandle::state`] or
//! [`WorkerHandle::wait_for_state`].
//!
//! ```text
//! Uninitialized -> (Initializing ->) Running <-> Paused -> Completed
//!                                    any state  ->        Failed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use seahash::SeaHasher;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::instrument;

use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::RpcFailure;
use crate::identity::ActorVirtualIdentity;
use crate::identity::OperatorIdentity;
use crate::recovery::replay;
use crate::recovery::FaultToleranceConfig;
use crate::recovery::RecoveryLog;
use crate::recovery::StateRestoreConfig;
use crate::runtime::DeadLetters;
use crate::with_timer;

pub mod executor;
pub mod profile;

use self::executor::Executor;
use self::executor::ExecutorSpec;
use self::executor::PassThrough;
use self::profile::TableProfile;
use self::profile::TableProfileManager;

/// One record flowing through the dataflow.
///
/// Fields are kept sorted by name, so two equal tuples always encode
/// to the same bytes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tuple(Map<String, Value>);

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only JSON objects are tuples.
    pub fn from_value(value: Value) -> EngineResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(EngineError::Executor(format!(
                "a tuple must be a JSON object; got {other}"
            ))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn digest(&self) -> u64 {
        let mut hasher = SeaHasher::new();
        for (name, value) in &self.0 {
            hasher.write(name.as_bytes());
            hasher.write(value.to_string().as_bytes());
        }
        hasher.finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Uninitialized,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkerState {
    /// No further transitions out of this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Throughput counters a worker reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerStatistics {
    pub input_tuple_count: u64,
    pub output_tuple_count: u64,
    pub data_processing_time_ns: u64,
    pub control_processing_time_ns: u64,
    pub idle_time_ns: u64,
}

impl std::ops::AddAssign for WorkerStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tuple_count += rhs.input_tuple_count;
        self.output_tuple_count += rhs.output_tuple_count;
        self.data_processing_time_ns += rhs.data_processing_time_ns;
        self.control_processing_time_ns += rhs.control_processing_time_ns;
        self.idle_time_ns += rhs.idle_time_ns;
    }
}

/// Requests on the worker RPC surface. Queries have no side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    QueryStatistics,
    QueryTableProfile,
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlReply {
    Statistics {
        state: WorkerState,
        stats: WorkerStatistics,
    },
    TableProfile(Option<TableProfile>),
    Ack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPayload {
    Batch(Vec<Tuple>),
    EndOfInput,
}

impl DataPayload {
    fn describe(&self) -> String {
        match self {
            Self::Batch(batch) => format!("batch of {} tuples", batch.len()),
            Self::EndOfInput => "end of input".to_string(),
        }
    }
}

/// Everything needed to start one worker, wherever it is placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub worker_id: ActorVirtualIdentity,
    pub operator_id: OperatorIdentity,
    pub executor: ExecutorSpec,
    #[serde(default)]
    pub fault_tolerance: Option<FaultToleranceConfig>,
    #[serde(default)]
    pub state_restore: Option<StateRestoreConfig>,
}

type ControlResult = Result<ControlReply, RpcFailure>;

enum Mail {
    Control {
        command: ControlCommand,
        reply: oneshot::Sender<ControlResult>,
    },
    Data(DataPayload),
}

/// Address of a running worker actor inside this process.
#[derive(Clone)]
pub struct WorkerHandle {
    id: ActorVirtualIdentity,
    mailbox: mpsc::UnboundedSender<Mail>,
    state: watch::Receiver<WorkerState>,
    outputs: broadcast::Sender<Arc<Vec<Tuple>>>,
    dead_letters: DeadLetters,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl WorkerHandle {
    pub fn id(&self) -> &ActorVirtualIdentity {
        &self.id
    }

    /// Send a control request and wait at most `timeout` for the
    /// reply. A request the actor can no longer take is a dead letter.
    pub async fn ask(&self, command: ControlCommand, timeout: Duration) -> ControlResult {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(mail)) = self.mailbox.send(Mail::Control { command, reply }) {
            if let Mail::Control { command, .. } = mail {
                self.dead_letters
                    .publish(&self.id, format!("control request {command:?}"), "worker has stopped");
            }
            return Err(RpcFailure::Disconnected);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcFailure::Disconnected),
            Err(_) => Err(RpcFailure::Timeout(timeout)),
        }
    }

    /// Deliver a data message. Undeliverable data goes to the dead
    /// letters.
    pub fn send_data(&self, payload: DataPayload) {
        if let Err(mpsc::error::SendError(Mail::Data(payload))) = self.mailbox.send(Mail::Data(payload)) {
            self.dead_letters
                .publish(&self.id, payload.describe(), "worker has stopped");
        }
    }

    /// Latest published lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait until the lifecycle state satisfies `pred`.
    pub async fn wait_for_state(
        &self,
        pred: impl Fn(WorkerState) -> bool,
        timeout: Duration,
    ) -> Result<WorkerState, RpcFailure> {
        let mut state = self.state.clone();
        let waiting = async {
            loop {
                let current = *state.borrow_and_update();
                if pred(current) {
                    return Ok(current);
                }
                if state.changed().await.is_err() {
                    // The actor is gone; its last state is final.
                    let last = *state.borrow();
                    return if pred(last) {
                        Ok(last)
                    } else {
                        Err(RpcFailure::Disconnected)
                    };
                }
            }
        };
        tokio::time::timeout(timeout, waiting)
            .await
            .unwrap_or(Err(RpcFailure::Timeout(timeout)))
    }

    /// Receive every output batch from now on.
    pub fn subscribe_outputs(&self) -> broadcast::Receiver<Arc<Vec<Tuple>>> {
        self.outputs.subscribe()
    }
}

/// Start a worker and return right away.
///
/// The executor is built before anything else; if that fails no
/// actor is started and the error is returned. Everything after that,
/// including the interpreter handshake of a cross-language executor,
/// replay and opening the fault-tolerance log, happens inside the
/// actor and is only visible through its state.
#[instrument(name = "spawn_worker", skip_all, fields(worker = %spec.worker_id))]
pub fn spawn_worker(spec: WorkerSpec, dead_letters: DeadLetters) -> EngineResult<WorkerHandle> {
    if let Some(ft) = &spec.fault_tolerance {
        if ft.checkpoint_interval == 0 {
            return Err(EngineError::Config(format!(
                "checkpoint interval for {} must be positive",
                spec.worker_id
            )));
        }
    }
    let executor = spec.executor.build()?;

    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(WorkerState::Uninitialized);
    let (outputs, _) = broadcast::channel(64);

    let meter = crate::metrics::meter();
    let actor = WorkerActor {
        labels: vec![KeyValue::new("operator", spec.operator_id.0.clone())],
        id: spec.worker_id.clone(),
        executor,
        log: None,
        checkpoint_interval: spec.fault_tolerance.as_ref().map(|ft| ft.checkpoint_interval),
        tuple_count: 0,
        since_checkpoint: 0,
        state: state_tx,
        stats: WorkerStatistics::default(),
        profile: TableProfileManager::new(),
        outputs: outputs.clone(),
        held: VecDeque::new(),
        dead_letters: dead_letters.clone(),
        process_duration: meter
            .f64_histogram("worker.process.duration")
            .with_description("Seconds spent processing one input batch")
            .init(),
    };
    tokio::spawn(actor.run(mailbox_rx, spec.fault_tolerance, spec.state_restore));

    Ok(WorkerHandle {
        id: spec.worker_id,
        mailbox: mailbox_tx,
        state: state_rx,
        outputs,
        dead_letters,
    })
}

struct WorkerActor {
    id: ActorVirtualIdentity,
    executor: Box<dyn Executor>,
    log: Option<RecoveryLog>,
    checkpoint_interval: Option<u64>,
    /// Input tuples reflected in the executor state, replay included.
    tuple_count: u64,
    since_checkpoint: u64,
    state: watch::Sender<WorkerState>,
    stats: WorkerStatistics,
    profile: TableProfileManager,
    outputs: broadcast::Sender<Arc<Vec<Tuple>>>,
    /// Data that arrived while initializing or paused.
    held: VecDeque<DataPayload>,
    dead_letters: DeadLetters,
    process_duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl WorkerActor {
    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<Mail>,
        fault_tolerance: Option<FaultToleranceConfig>,
        state_restore: Option<StateRestoreConfig>,
    ) {
        match self.initialize(&mut mailbox, fault_tolerance, state_restore).await {
            Ok(()) => {
                self.set_state(WorkerState::Running);
                tracing::debug!("Worker {} running", self.id);
                self.drain_held(&mut mailbox).await;
            }
            Err(err) => self.fail(err),
        }

        loop {
            let waiting = Instant::now();
            let Some(mail) = mailbox.recv().await else {
                break;
            };
            self.stats.idle_time_ns += waiting.elapsed().as_nanos() as u64;
            match mail {
                Mail::Control { command, reply } => {
                    self.answer(command, reply);
                    // A resume releases whatever was held.
                    self.drain_held(&mut mailbox).await;
                }
                Mail::Data(payload) => self.on_data(&mut mailbox, payload).await,
            }
        }
        tracing::debug!("Worker {} mailbox closed in state {}", self.id, self.state());
    }

    /// Open the executor, replay if asked to, then open the
    /// fault-tolerance log.
    async fn initialize(
        &mut self,
        mailbox: &mut mpsc::UnboundedReceiver<Mail>,
        fault_tolerance: Option<FaultToleranceConfig>,
        state_restore: Option<StateRestoreConfig>,
    ) -> EngineResult<()> {
        if state_restore.is_some() || self.executor.is_blocking() {
            self.set_state(WorkerState::Initializing);
        }
        self.with_executor(mailbox, |executor| executor.open()).await?;

        let mut replayed_up_to = None;
        if let Some(restore) = state_restore {
            let id = self.id.clone();
            let path = RecoveryLog::path_for(&restore.log_dir, &self.id);
            let outcome = self
                .offload(mailbox, move |executor| replay(&id, executor, &restore))
                .await
                .map_err(|err| EngineError::Replay {
                    worker: self.id.clone(),
                    reason: format!("replay task failed: {err}"),
                })??;
            self.tuple_count = outcome.tuple_count;
            replayed_up_to = Some((path, outcome.last_seq));
        }

        if let Some(ft) = fault_tolerance {
            let id = self.id.clone();
            let mut log = tokio::task::spawn_blocking(move || RecoveryLog::init(&ft.log_dir, &id))
                .await
                .map_err(|err| EngineError::Executor(format!("recovery log task failed: {err}")))??;
            let restored = replayed_up_to.is_some();
            // Continue right after what was replayed from this same log.
            if let Some((path, last_seq)) = replayed_up_to {
                if log.path() == path && log.last_seq() > last_seq {
                    log.discard_after(last_seq)?;
                }
            }
            self.log = Some(log);
            // Replaying this log later has to start from the restored
            // state, wherever that state came from.
            if restored {
                self.checkpoint(mailbox).await?;
            }
        }
        Ok(())
    }

    /// Run `job` with the executor on a blocking thread. Control
    /// requests are still answered and data is held until it is done.
    async fn offload<T, F>(
        &mut self,
        mailbox: &mut mpsc::UnboundedReceiver<Mail>,
        job: F,
    ) -> Result<EngineResult<T>, JoinError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Executor) -> EngineResult<T> + Send + 'static,
    {
        // Stand-in while the real executor is on the blocking thread.
        let mut executor = std::mem::replace(&mut self.executor, Box::new(PassThrough));
        let task = tokio::task::spawn_blocking(move || {
            let res = job(executor.as_mut());
            (executor, res)
        });
        tokio::pin!(task);

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                Some(mail) = mailbox.recv() => match mail {
                    Mail::Control { command, reply } => self.answer(command, reply),
                    Mail::Data(payload) => self.held.push_back(payload),
                },
            }
        };
        let (executor, res) = joined?;
        self.executor = executor;
        Ok(res)
    }

    /// Run `job` right here, or through [`Self::offload`] if the
    /// executor blocks.
    async fn with_executor<T, F>(&mut self, mailbox: &mut mpsc::UnboundedReceiver<Mail>, job: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Executor) -> EngineResult<T> + Send + 'static,
    {
        if !self.executor.is_blocking() {
            return job(self.executor.as_mut());
        }
        self.offload(mailbox, job)
            .await
            .map_err(|err| EngineError::Executor(format!("executor task of {} failed: {err}", self.id)))?
    }

    fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    fn fail(&mut self, err: EngineError) {
        tracing::error!("Worker {} failed: {err}", self.id);
        self.set_state(WorkerState::Failed);
        for payload in self.held.drain(..) {
            self.dead_letters
                .publish(&self.id, payload.describe(), "worker failed");
        }
    }

    fn answer(&mut self, command: ControlCommand, reply: oneshot::Sender<ControlResult>) {
        let started = Instant::now();
        let result = self.on_control(command);
        self.stats.control_processing_time_ns += started.elapsed().as_nanos() as u64;
        // The asker may have timed out already.
        let _ = reply.send(result);
    }

    /// Never touches the executor; it may be off on a blocking
    /// thread.
    fn on_control(&mut self, command: ControlCommand) -> ControlResult {
        let state = self.state();
        match command {
            ControlCommand::QueryStatistics => Ok(ControlReply::Statistics {
                state,
                stats: self.stats,
            }),
            ControlCommand::QueryTableProfile => {
                Ok(ControlReply::TableProfile(self.profile.table_profile()))
            }
            ControlCommand::Pause => match state {
                WorkerState::Running | WorkerState::Paused => {
                    self.set_state(WorkerState::Paused);
                    Ok(ControlReply::Ack)
                }
                other => Err(RpcFailure::Rejected(format!("can't pause a worker that is {other}"))),
            },
            ControlCommand::Resume => match state {
                WorkerState::Paused | WorkerState::Running => {
                    self.set_state(WorkerState::Running);
                    Ok(ControlReply::Ack)
                }
                other => Err(RpcFailure::Rejected(format!("can't resume a worker that is {other}"))),
            },
        }
    }

    async fn on_data(&mut self, mailbox: &mut mpsc::UnboundedReceiver<Mail>, payload: DataPayload) {
        match self.state() {
            // Behind anything already held, to keep arrival order.
            WorkerState::Running
            | WorkerState::Paused
            | WorkerState::Uninitialized
            | WorkerState::Initializing => {
                self.held.push_back(payload);
                self.drain_held(mailbox).await;
            }
            state @ (WorkerState::Completed | WorkerState::Failed) => self.dead_letters.publish(
                &self.id,
                payload.describe(),
                format!("worker is {state}"),
            ),
        }
    }

    /// Process held data in arrival order while still running.
    async fn drain_held(&mut self, mailbox: &mut mpsc::UnboundedReceiver<Mail>) {
        while self.state() == WorkerState::Running {
            let Some(payload) = self.held.pop_front() else {
                break;
            };
            if let Err(err) = self.process(mailbox, payload).await {
                self.fail(err);
            }
        }
    }

    async fn process(&mut self, mailbox: &mut mpsc::UnboundedReceiver<Mail>, payload: DataPayload) -> EngineResult<()> {
        match payload {
            DataPayload::Batch(batch) => {
                if let Some(log) = self.log.as_mut() {
                    log.append_batch(&batch)?;
                }
                let count = batch.len() as u64;
                let started = Instant::now();
                let outputs = with_timer!(
                    self.process_duration,
                    self.labels,
                    self.with_executor(mailbox, move |executor| process_batch(executor, batch))
                        .await
                )?;
                self.stats.data_processing_time_ns += started.elapsed().as_nanos() as u64;
                self.stats.input_tuple_count += count;
                self.tuple_count += count;
                self.since_checkpoint += count;
                self.emit(outputs);

                if let Some(interval) = self.checkpoint_interval {
                    if self.since_checkpoint >= interval {
                        self.checkpoint(mailbox).await?;
                    }
                }
            }
            DataPayload::EndOfInput => {
                let outputs = self
                    .with_executor(mailbox, |executor| executor.on_finish(0))
                    .await?;
                self.emit(outputs);
                if self.log.is_some() {
                    self.checkpoint(mailbox).await?;
                }
                self.set_state(WorkerState::Completed);
                tracing::debug!("Worker {} completed", self.id);
            }
        }
        Ok(())
    }

    fn emit(&mut self, outputs: Vec<Tuple>) {
        if outputs.is_empty() {
            return;
        }
        for tuple in &outputs {
            self.profile.update(tuple);
        }
        self.stats.output_tuple_count += outputs.len() as u64;
        // No receivers is fine.
        let _ = self.outputs.send(Arc::new(outputs));
    }

    async fn checkpoint(&mut self, mailbox: &mut mpsc::UnboundedReceiver<Mail>) -> EngineResult<()> {
        if self.log.is_none() {
            return Ok(());
        }
        let state = self
            .with_executor(mailbox, |executor| executor.snapshot())
            .await?;
        if let Some(log) = self.log.as_mut() {
            log.write_checkpoint(log.last_seq(), self.tuple_count, &state)?;
            self.since_checkpoint = 0;
        }
        Ok(())
    }
}

fn process_batch(executor: &mut dyn Executor, batch: Vec<Tuple>) -> EngineResult<Vec<Tuple>> {
    let mut outputs = Vec::new();
    for tuple in batch {
        outputs.extend(executor.process_tuple(tuple, 0)?);
    }
    Ok(outputs)
}

#[cfg(test)]
fn rows(values: &[i64]) -> DataPayload {
    DataPayload::Batch(
        values
            .iter()
            .map(|v| Tuple::from_value(serde_json::json!({ "v": v })).unwrap())
            .collect(),
    )
}

#[cfg(test)]
fn test_spec(name: &str, executor: &str) -> WorkerSpec {
    WorkerSpec {
        worker_id: ActorVirtualIdentity::new(name),
        operator_id: OperatorIdentity::new("op"),
        executor: ExecutorSpec::native(executor),
        fault_tolerance: None,
        state_restore: None,
    }
}

#[cfg(test)]
const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn fresh_worker_runs_and_counts() {
    let worker = spawn_worker(test_spec("Worker:w-0", "pass-through"), DeadLetters::start()).unwrap();
    worker
        .wait_for_state(|s| s == WorkerState::Running, WAIT)
        .await
        .unwrap();

    worker.send_data(rows(&[1, 2, 3]));
    let reply = worker.ask(ControlCommand::QueryStatistics, WAIT).await.unwrap();
    match reply {
        ControlReply::Statistics { state, stats } => {
            assert_eq!(state, WorkerState::Running);
            assert_eq!(stats.input_tuple_count, 3);
            assert_eq!(stats.output_tuple_count, 3);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let reply = worker.ask(ControlCommand::QueryTableProfile, WAIT).await.unwrap();
    match reply {
        ControlReply::TableProfile(Some(profile)) => assert_eq!(profile.global.row_count, 3),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn pause_holds_batches_until_resume() {
    let worker = spawn_worker(test_spec("Worker:w-1", "pass-through"), DeadLetters::start()).unwrap();
    let mut outputs = worker.subscribe_outputs();
    worker
        .wait_for_state(|s| s == WorkerState::Running, WAIT)
        .await
        .unwrap();

    assert_eq!(worker.ask(ControlCommand::Pause, WAIT).await, Ok(ControlReply::Ack));
    worker.send_data(rows(&[1]));
    worker.send_data(rows(&[2]));
    match worker.ask(ControlCommand::QueryStatistics, WAIT).await.unwrap() {
        ControlReply::Statistics { state, stats } => {
            assert_eq!(state, WorkerState::Paused);
            assert_eq!(stats.input_tuple_count, 0);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    assert_eq!(worker.ask(ControlCommand::Resume, WAIT).await, Ok(ControlReply::Ack));
    let first = outputs.recv().await.unwrap();
    let second = outputs.recv().await.unwrap();
    assert_eq!(first[0].get("v"), Some(&serde_json::json!(1)));
    assert_eq!(second[0].get("v"), Some(&serde_json::json!(2)));
}

#[tokio::test]
async fn end_of_input_completes_and_rejects_more() {
    let dead_letters = DeadLetters::start();
    let worker = spawn_worker(test_spec("Worker:w-2", "pass-through"), dead_letters.clone()).unwrap();
    worker.send_data(rows(&[1]));
    worker.send_data(DataPayload::EndOfInput);
    worker
        .wait_for_state(|s| s == WorkerState::Completed, WAIT)
        .await
        .unwrap();

    worker.send_data(rows(&[2]));
    // Round trip so the batch above is handled.
    worker.ask(ControlCommand::QueryStatistics, WAIT).await.unwrap();
    let letters = dead_letters.wait_for(1, WAIT).await;
    assert_eq!(letters[0].recipient, "Worker:w-2");
    assert!(matches!(
        worker.ask(ControlCommand::Pause, WAIT).await,
        Err(RpcFailure::Rejected(_))
    ));
}

#[tokio::test]
async fn unknown_executor_does_not_start() {
    let err = spawn_worker(test_spec("Worker:w-3", "no-such-thing"), DeadLetters::start()).unwrap_err();
    assert!(matches!(err, EngineError::Executor(_)));
}

#[tokio::test]
async fn restored_worker_runs_after_replay() {
    let dir = tempfile::tempdir().unwrap();
    let ft = FaultToleranceConfig {
        log_dir: dir.path().to_path_buf(),
        checkpoint_interval: 2,
    };

    let mut spec = test_spec("Worker:count-0", "running-count");
    spec.fault_tolerance = Some(ft.clone());
    let first = spawn_worker(spec.clone(), DeadLetters::start()).unwrap();
    first.send_data(rows(&[1, 2, 3]));
    first.send_data(rows(&[4]));
    first.send_data(DataPayload::EndOfInput);
    first
        .wait_for_state(|s| s == WorkerState::Completed, WAIT)
        .await
        .unwrap();

    spec.state_restore = Some(StateRestoreConfig {
        log_dir: dir.path().to_path_buf(),
        replay_up_to: None,
    });
    spec.fault_tolerance = None;
    let second = spawn_worker(spec, DeadLetters::start()).unwrap();
    let mut outputs = second.subscribe_outputs();
    // Queued behind the replay.
    second.send_data(rows(&[5]));
    second
        .wait_for_state(|s| s == WorkerState::Running, WAIT)
        .await
        .unwrap();
    let out = outputs.recv().await.unwrap();
    assert_eq!(out[0].get("count"), Some(&serde_json::json!(5)));
}

#[tokio::test]
async fn failed_replay_never_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = test_spec("Worker:lost-0", "running-count");
    spec.state_restore = Some(StateRestoreConfig {
        log_dir: dir.path().to_path_buf(),
        replay_up_to: None,
    });
    let dead_letters = DeadLetters::start();
    let worker = spawn_worker(spec, dead_letters.clone()).unwrap();
    worker.send_data(rows(&[1]));
    let state = worker.wait_for_state(WorkerState::is_terminal, WAIT).await.unwrap();
    assert_eq!(state, WorkerState::Failed);

    assert!(!dead_letters.wait_for(1, WAIT).await.is_empty());
    match worker.ask(ControlCommand::QueryStatistics, WAIT).await.unwrap() {
        ControlReply::Statistics { state, stats } => {
            assert_eq!(state, WorkerState::Failed);
            assert_eq!(stats.input_tuple_count, 0);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn restore_into_a_new_log_carries_state_forward() {
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let log_to = |dir: &tempfile::TempDir| FaultToleranceConfig {
        log_dir: dir.path().to_path_buf(),
        checkpoint_interval: 10,
    };
    let restore_from = |dir: &tempfile::TempDir| StateRestoreConfig {
        log_dir: dir.path().to_path_buf(),
        replay_up_to: None,
    };

    let mut spec = test_spec("Worker:moved-0", "running-count");
    spec.fault_tolerance = Some(log_to(&first_dir));
    let first = spawn_worker(spec.clone(), DeadLetters::start()).unwrap();
    first.send_data(rows(&[1, 2, 3, 4]));
    first.send_data(DataPayload::EndOfInput);
    first
        .wait_for_state(|s| s == WorkerState::Completed, WAIT)
        .await
        .unwrap();

    // Restored from the first log, logging to the second.
    spec.state_restore = Some(restore_from(&first_dir));
    spec.fault_tolerance = Some(log_to(&second_dir));
    let second = spawn_worker(spec.clone(), DeadLetters::start()).unwrap();
    let mut outputs = second.subscribe_outputs();
    second.send_data(rows(&[5]));
    let out = outputs.recv().await.unwrap();
    assert_eq!(out[0].get("count"), Some(&serde_json::json!(5)));

    // The second log alone is enough to get back to the same state.
    spec.state_restore = Some(restore_from(&second_dir));
    spec.fault_tolerance = None;
    let third = spawn_worker(spec, DeadLetters::start()).unwrap();
    let mut outputs = third.subscribe_outputs();
    third.send_data(rows(&[6]));
    let out = outputs.recv().await.unwrap();
    assert_eq!(out[0].get("count"), Some(&serde_json::json!(6)));
}

#[cfg(unix)]
#[tokio::test]
async fn data_waits_for_a_slow_replay() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = test_spec("Worker:slow-0", "pass-through");
    spec.fault_tolerance = Some(FaultToleranceConfig {
        log_dir: dir.path().to_path_buf(),
        checkpoint_interval: 1,
    });
    let first = spawn_worker(spec.clone(), DeadLetters::start()).unwrap();
    first.send_data(rows(&[1]));
    first.send_data(DataPayload::EndOfInput);
    first
        .wait_for_state(|s| s == WorkerState::Completed, WAIT)
        .await
        .unwrap();

    // Takes a second to restore; answers everything else with one
    // fixed tuple.
    let script = r#"while read -r line; do case "$line" in *restore*) sleep 1;; esac; echo '{"outputs":[{"v":0}]}'; done"#;
    spec.executor = ExecutorSpec::cross_language("sh", vec!["-c".to_string(), script.to_string()]);
    spec.fault_tolerance = None;
    spec.state_restore = Some(StateRestoreConfig {
        log_dir: dir.path().to_path_buf(),
        replay_up_to: None,
    });
    let second = spawn_worker(spec, DeadLetters::start()).unwrap();
    let mut outputs = second.subscribe_outputs();
    second.send_data(rows(&[2]));

    match second.ask(ControlCommand::QueryStatistics, WAIT).await.unwrap() {
        ControlReply::Statistics { state, stats } => {
            assert_eq!(state, WorkerState::Initializing);
            assert_eq!(stats.input_tuple_count, 0);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    second
        .wait_for_state(|s| s == WorkerState::Running, WAIT)
        .await
        .unwrap();
    let out = outputs.recv().await.unwrap();
    assert_eq!(out[0].get("v"), Some(&serde_json::json!(0)));
    match second.ask(ControlCommand::QueryStatistics, WAIT).await.unwrap() {
        ControlReply::Statistics { state, stats } => {
            assert_eq!(state, WorkerState::Running);
            assert_eq!(stats.input_tuple_count, 1);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn interpreter_handshake_happens_after_creation() {
    let script = r#"sleep 1; while read -r line; do echo '{}'; done"#;
    let mut spec = test_spec("Worker:py-0", "pass-through");
    spec.executor = ExecutorSpec::cross_language("sh", vec!["-c".to_string(), script.to_string()]);

    let started = Instant::now();
    let worker = spawn_worker(spec, DeadLetters::start()).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_ne!(worker.state(), WorkerState::Running);
    worker
        .wait_for_state(|s| s == WorkerState::Running, WAIT)
        .await
        .unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn unresponsive_interpreter_fails_the_worker() {
    let mut spec = test_spec("Worker:hung-0", "pass-through");
    spec.executor = ExecutorSpec::cross_language("sh", vec!["-c".to_string(), "exec sleep 30".to_string()])
        .with_call_timeout(Duration::from_millis(200));
    let worker = spawn_worker(spec, DeadLetters::start()).unwrap();
    let state = worker.wait_for_state(WorkerState::is_terminal, WAIT).await.unwrap();
    assert_eq!(state, WorkerState::Failed);
}
