//! Control plane of a distributed dataflow engine.
//!
//! Given a compiled plan, this crate places each operator's workers
//! on cluster nodes, starts them (fresh or restored from a recovery
//! log), keeps a model of what runs where, and lets the controller
//! query and steer every worker concurrently.
//!
//! Roughly leaves first:
//!
//! - [`addresses`]: the current cluster membership.
//! - [`placement`]: location preferences to node addresses.
//! - [`worker`]: worker actors and their executors.
//! - [`recovery`]: fault-tolerance logs and replay.
//! - [`execution`]: the workflow, region, operator, worker model.
//! - [`deploy`]: operator configurations to live workers.
//! - [`controller`]: statistics fan-out and fan-in.
//! - [`runtime`] and [`cluster`]: the message-passing runtime and its
//!   wire protocol.
//! - [`run`]: process entry point.

pub mod addresses;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod deploy;
pub mod errors;
pub mod execution;
pub mod identity;
pub mod macros;
pub mod metrics;
pub mod placement;
pub mod recovery;
pub mod run;
pub mod runtime;
pub mod tracing;
pub mod webserver;
pub mod worker;
