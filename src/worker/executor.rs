//! Operator logic run inside a worker.
//!
//! The control plane does not care what an operator computes. It only
//! needs the iterator-style contract in [`Executor`] and a way to
//! snapshot and restore state for recovery.
//!
//! Two flavors exist. Native executors are Rust types looked up by
//! name. Cross-language executors proxy every call to an external
//! interpreter process over newline-delimited JSON on its stdio.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::runtime::Handle;

use super::Tuple;
use crate::errors::EngineError;
use crate::errors::EngineResult;

/// Iterator-style processing contract every operator implements.
pub trait Executor: Send {
    /// One-time setup. Runs inside the worker while it is
    /// initializing, never during creation.
    fn open(&mut self) -> EngineResult<()> {
        Ok(())
    }

    /// Whether calls wait on something outside this process. Workers
    /// drive such executors from a blocking thread.
    fn is_blocking(&self) -> bool {
        false
    }

    /// Consume one input tuple that arrived on `port`, producing
    /// zero or more outputs.
    fn process_tuple(&mut self, tuple: Tuple, port: usize) -> EngineResult<Vec<Tuple>>;

    /// Called once when `port` has no more input.
    fn on_finish(&mut self, _port: usize) -> EngineResult<Vec<Tuple>> {
        Ok(Vec::new())
    }

    /// Serialize the operator state for a checkpoint.
    fn snapshot(&mut self) -> EngineResult<Value> {
        Ok(Value::Null)
    }

    /// Replace the operator state with a checkpointed one.
    fn restore(&mut self, _state: Value) -> EngineResult<()> {
        Ok(())
    }
}

/// Runtime flavor of a physical operator. This is a static property
/// of the operator, not of where its workers are placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flavor", rename_all = "snake_case")]
pub enum ExecutorKind {
    Native { name: String },
    CrossLanguage {
        program: String,
        args: Vec<String>,
        /// How long the interpreter gets to answer one call.
        #[serde(default = "default_call_timeout_ms")]
        call_timeout_ms: u64,
    },
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub kind: ExecutorKind,
    #[serde(default)]
    pub params: Value,
}

impl ExecutorSpec {
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            kind: ExecutorKind::Native { name: name.into() },
            params: Value::Null,
        }
    }

    pub fn cross_language(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: ExecutorKind::CrossLanguage {
                program: program.into(),
                args,
                call_timeout_ms: default_call_timeout_ms(),
            },
            params: Value::Null,
        }
    }

    /// Bound every call to a cross-language interpreter. No effect on
    /// native executors.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        if let ExecutorKind::CrossLanguage { call_timeout_ms, .. } = &mut self.kind {
            *call_timeout_ms = timeout.as_millis() as u64;
        }
        self
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, ExecutorKind::Native { .. })
    }

    /// Instantiate the executor. Any failure here means the worker
    /// cannot start. Cross-language interpreters are started here but
    /// not yet talked to, so this never waits on them.
    pub fn build(&self) -> EngineResult<Box<dyn Executor>> {
        match &self.kind {
            ExecutorKind::Native { name } => match name.as_str() {
                PassThrough::NAME => Ok(Box::new(PassThrough)),
                RunningCount::NAME => Ok(Box::new(RunningCount::new(&self.params)?)),
                unknown => Err(EngineError::Executor(format!(
                    "no native executor named {unknown:?}"
                ))),
            },
            ExecutorKind::CrossLanguage {
                program,
                args,
                call_timeout_ms,
            } => Ok(Box::new(ProxyExecutor::spawn(
                program,
                args,
                &self.params,
                Duration::from_millis(*call_timeout_ms),
            )?)),
        }
    }
}

/// Emits every input unchanged.
pub struct PassThrough;

impl PassThrough {
    pub const NAME: &'static str = "pass-through";
}

impl Executor for PassThrough {
    fn process_tuple(&mut self, tuple: Tuple, _port: usize) -> EngineResult<Vec<Tuple>> {
        Ok(vec![tuple])
    }
}

/// Tags every input with how many tuples were seen so far.
///
/// The count is the operator state, so a restored worker continues
/// numbering where the checkpoint left off.
pub struct RunningCount {
    field: String,
    count: u64,
}

impl RunningCount {
    pub const NAME: &'static str = "running-count";

    fn new(params: &Value) -> EngineResult<Self> {
        let field = match params.get("field") {
            None => "count".to_string(),
            Some(Value::String(field)) => field.clone(),
            Some(other) => {
                return Err(EngineError::Executor(format!(
                    "running-count `field` must be a string; got {other}"
                )))
            }
        };
        Ok(Self { field, count: 0 })
    }
}

impl Executor for RunningCount {
    fn process_tuple(&mut self, mut tuple: Tuple, _port: usize) -> EngineResult<Vec<Tuple>> {
        self.count += 1;
        tuple.insert(self.field.clone(), json!(self.count));
        Ok(vec![tuple])
    }

    fn snapshot(&mut self) -> EngineResult<Value> {
        Ok(json!({ "count": self.count }))
    }

    fn restore(&mut self, state: Value) -> EngineResult<()> {
        self.count = state
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::Executor(format!("bad running-count state {state}")))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProxyResponse {
    #[serde(default)]
    outputs: Vec<Tuple>,
    #[serde(default)]
    state: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Forwards the executor contract to an external interpreter.
///
/// Each request is one JSON object per line on the child's stdin
/// with an `op` of `open`, `tuple`, `finish`, `snapshot` or
/// `restore`. The child answers each with one line within the call
/// timeout, or it is killed.
///
/// Calls block the calling thread until the interpreter answers, so
/// workers only drive this from a blocking thread; see
/// [`Executor::is_blocking`].
pub struct ProxyExecutor {
    program: String,
    params: Value,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    runtime: Handle,
    call_timeout: Duration,
}

impl ProxyExecutor {
    /// Start the interpreter process. Nothing is said to it until
    /// [`Executor::open`].
    fn spawn(program: &str, args: &[String], params: &Value, call_timeout: Duration) -> EngineResult<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            EngineError::Executor(format!("can't start interpreter {program:?} outside a runtime: {err}"))
        })?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                EngineError::Executor(format!("can't start interpreter {program:?}: {err}"))
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EngineError::Executor(format!(
                "interpreter {program:?} has no stdio pipes"
            )));
        };
        tracing::debug!(program, pid = ?child.id(), "Started cross-language executor");

        Ok(Self {
            program: program.to_string(),
            params: params.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            runtime,
            call_timeout,
        })
    }

    fn call(&mut self, request: Value) -> EngineResult<ProxyResponse> {
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        let runtime = self.runtime.clone();
        let timeout = self.call_timeout;
        let reply = match runtime.block_on(tokio::time::timeout(timeout, self.exchange(&line))) {
            Ok(reply) => reply?,
            Err(_) => {
                // The pipe is out of step with the requests now.
                if let Err(err) = self.child.start_kill() {
                    tracing::trace!(program = %self.program, "Interpreter already gone: {err}");
                }
                return Err(EngineError::Executor(format!(
                    "interpreter {:?} did not answer within {timeout:?}",
                    self.program
                )));
            }
        };
        let response: ProxyResponse = serde_json::from_str(&reply)?;
        match response.error {
            Some(err) => Err(EngineError::Executor(format!(
                "interpreter {:?} raised: {err}",
                self.program
            ))),
            None => Ok(response),
        }
    }

    async fn exchange(&mut self, line: &str) -> EngineResult<String> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| self.broken(err))?;
        self.stdin.flush().await.map_err(|err| self.broken(err))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .await
            .map_err(|err| self.broken(err))?;
        if read == 0 {
            return Err(EngineError::Executor(format!(
                "interpreter {:?} exited",
                self.program
            )));
        }
        Ok(reply)
    }

    fn broken(&self, err: std::io::Error) -> EngineError {
        EngineError::Executor(format!("pipe to interpreter {:?} broke: {err}", self.program))
    }
}

impl Executor for ProxyExecutor {
    fn open(&mut self) -> EngineResult<()> {
        let params = self.params.clone();
        self.call(json!({ "op": "open", "params": params }))?;
        Ok(())
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn process_tuple(&mut self, tuple: Tuple, port: usize) -> EngineResult<Vec<Tuple>> {
        Ok(self
            .call(json!({ "op": "tuple", "tuple": tuple, "port": port }))?
            .outputs)
    }

    fn on_finish(&mut self, port: usize) -> EngineResult<Vec<Tuple>> {
        Ok(self.call(json!({ "op": "finish", "port": port }))?.outputs)
    }

    fn snapshot(&mut self) -> EngineResult<Value> {
        Ok(self.call(json!({ "op": "snapshot" }))?.state)
    }

    fn restore(&mut self, state: Value) -> EngineResult<()> {
        self.call(json!({ "op": "restore", "state": state }))?;
        Ok(())
    }
}

#[test]
fn unknown_native_executor_is_an_error() {
    let err = ExecutorSpec::native("sort-merge").build().err().unwrap();
    assert!(matches!(err, EngineError::Executor(_)));
}

#[test]
fn running_count_snapshots_and_restores() {
    let spec = ExecutorSpec::native(RunningCount::NAME);
    let mut first = spec.build().unwrap();
    for _ in 0..3 {
        first.process_tuple(Tuple::new(), 0).unwrap();
    }
    let state = first.snapshot().unwrap();

    let mut second = spec.build().unwrap();
    second.restore(state).unwrap();
    let out = second.process_tuple(Tuple::new(), 0).unwrap();
    assert_eq!(out[0].get("count"), Some(&json!(4)));
}

#[test]
fn running_count_rejects_bad_state() {
    let mut exec = ExecutorSpec::native(RunningCount::NAME).build().unwrap();
    assert!(exec.restore(json!({"count": "many"})).is_err());
}

#[tokio::test]
async fn missing_interpreter_fails_to_build() {
    let spec = ExecutorSpec::cross_language("/nonexistent/amber-interpreter", Vec::new());
    assert!(matches!(spec.build(), Err(EngineError::Executor(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn proxy_executor_speaks_json_lines() {
    // Answers every request with one fixed output tuple.
    let script = r#"while read -r line; do echo '{"outputs":[{"y":1}],"state":{"n":1}}'; done"#;
    let spec = ExecutorSpec::cross_language("sh", vec!["-c".to_string(), script.to_string()]);
    let mut exec = spec.build().unwrap();
    assert!(exec.is_blocking());
    let (out, state) = tokio::task::spawn_blocking(move || {
        exec.open().unwrap();
        let out = exec.process_tuple(Tuple::new(), 0).unwrap();
        (out, exec.snapshot().unwrap())
    })
    .await
    .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].get("y"), Some(&json!(1)));
    assert_eq!(state, json!({"n": 1}));
}

#[cfg(unix)]
#[tokio::test]
async fn silent_interpreter_is_cut_off() {
    let spec = ExecutorSpec::cross_language("sh", vec!["-c".to_string(), "exec sleep 30".to_string()])
        .with_call_timeout(Duration::from_millis(200));
    let mut exec = spec.build().unwrap();
    let started = std::time::Instant::now();
    let err = tokio::task::spawn_blocking(move || exec.open())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.to_string().contains("did not answer"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn executor_spec_json_shape() {
    let spec: ExecutorSpec =
        serde_json::from_str(r#"{"kind":{"flavor":"native","name":"pass-through"}}"#).unwrap();
    assert!(spec.is_native());
    assert_eq!(spec.params, Value::Null);
}
