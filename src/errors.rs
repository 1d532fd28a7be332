//! Error taxonomy for the control plane.
//!
//! Errors are split the way they propagate:
//!
//! - [`PlacementError`]: a location preference can't be satisfied.
//!   Fatal to the whole operator deployment.
//! - [`EngineError::Deployment`]: an address was chosen but the
//!   worker did not start there. Contained and reported per worker.
//! - [`EngineError::Rpc`]: a single worker did not answer a control
//!   request. Contained and reported per worker.
//! - [`EngineError::Replay`]: a worker could not rebuild its state
//!   from its recovery log. Fatal to that worker's startup.
//!
//! Use [`ErrorContext::reraise`] to add a caller-tracked message to
//! an error while keeping the original as the cause.

use std::panic::Location;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::addresses::NodeAddress;
use crate::identity::ActorVirtualIdentity;
use crate::identity::OperatorIdentity;
use crate::identity::RegionIdentity;

/// Result type used everywhere in the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// A location preference could not be resolved to a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("can't place worker {worker_index} round-robin: no cluster nodes are known")]
    NoNodes { worker_index: usize },
    #[error(
        "requested node {requested} is not part of the cluster; known hosts: [{}]",
        join_hosts(.known_hosts)
    )]
    UnknownNode {
        requested: NodeAddress,
        known_hosts: Vec<NodeAddress>,
    },
    #[error("requested node address {requested:?} is invalid: {reason}")]
    InvalidAddress { requested: String, reason: String },
}

fn join_hosts(hosts: &[NodeAddress]) -> String {
    hosts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a single control request to a worker did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcFailure {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("connection to the hosting node was lost")]
    Disconnected,
    #[error("worker is not known to this runtime")]
    Unreachable,
    #[error("worker rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error("worker {worker} was placed at {address} but failed to start: {reason}")]
    Deployment {
        worker: ActorVirtualIdentity,
        address: NodeAddress,
        reason: String,
    },
    #[error("control request to {worker} failed: {failure}")]
    Rpc {
        worker: ActorVirtualIdentity,
        failure: RpcFailure,
    },
    #[error("worker {worker} failed to restore its state: {reason}")]
    Replay {
        worker: ActorVirtualIdentity,
        reason: String,
    },
    #[error("worker {0} is already registered in this operator execution")]
    DuplicateWorker(ActorVirtualIdentity),
    #[error("region {0} already has an execution")]
    DuplicateRegion(RegionIdentity),
    #[error("operator {operator} already has an execution in region {region}")]
    DuplicateOperator {
        region: RegionIdentity,
        operator: OperatorIdentity,
    },
    #[error("no execution for region {0}")]
    UnknownRegion(RegionIdentity),
    #[error("no execution for operator {0}")]
    UnknownOperator(OperatorIdentity),
    #[error("no execution for worker {0}")]
    UnknownWorker(ActorVirtualIdentity),
    #[error("executor error: {0}")]
    Executor(String),
    #[error("cluster error: {0}")]
    Cluster(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("metrics error: {0}")]
    Metrics(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("{context}\nCaused by => {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Strip every [`EngineError::Context`] layer.
    pub fn root(&self) -> &EngineError {
        let mut err = self;
        while let EngineError::Context { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn is_placement(&self) -> bool {
        matches!(self.root(), EngineError::Placement(_))
    }

    pub fn is_deployment(&self) -> bool {
        matches!(self.root(), EngineError::Deployment { .. })
    }

    pub fn is_replay(&self) -> bool {
        matches!(self.root(), EngineError::Replay { .. })
    }
}

/// Add a caller-tracked message on top of an existing error.
pub trait ErrorContext<T> {
    /// Make the existing error the cause of a new error with this
    /// message.
    ///
    /// Example:
    ///     log.open(path).reraise("error opening recovery log")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> EngineResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<EngineError>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> EngineResult<T> {
        let caller = Location::caller();
        self.map_err(|err| EngineError::Context {
            context: prepend_caller(caller, msg),
            source: Box::new(err.into()),
        })
    }
}

/// Use this function to create a cluster error with location tracking.
#[track_caller]
pub(crate) fn tracked_err(msg: &str) -> EngineError {
    let caller = Location::caller();
    EngineError::Cluster(prepend_caller(caller, msg))
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn reraise_keeps_category_reachable() {
    let res: Result<(), PlacementError> = Err(PlacementError::NoNodes { worker_index: 3 });
    let err = res.reraise("error placing operator").unwrap_err();
    assert!(err.is_placement());
    let msg = err.to_string();
    assert!(msg.contains("error placing operator"));
    assert!(msg.contains("errors.rs"));
    assert!(msg.contains("Caused by => can't place worker 3"));
}

#[test]
fn unknown_node_lists_known_hosts() {
    let err = PlacementError::UnknownNode {
        requested: NodeAddress::new("d", 1),
        known_hosts: vec![NodeAddress::new("a", 1), NodeAddress::new("b", 2)],
    };
    assert_eq!(
        err.to_string(),
        "requested node d:1 is not part of the cluster; known hosts: [a:1, b:2]"
    );
}

#[test]
fn prepend_tname_prefixes_every_line() {
    let out = std::thread::Builder::new()
        .name("ctl".to_string())
        .spawn(|| prepend_tname("a\nb".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out, "<ctl> a\n<ctl> b\n");
}
