//! Process-wide message-passing runtime.
//!
//! A [`Runtime`] is the one place a process keeps track of the
//! workers it can reach. Workers are addressed by
//! [`ActorVirtualIdentity`]; the runtime's dispatch table maps each
//! to either a local [`WorkerHandle`] or the node hosting it, so
//! callers never deal with threads or sockets.
//!
//! A master binds its configured address, seeds membership with
//! itself and accepts joins. A worker node binds an ephemeral port
//! on its own host and joins the master. Both keep the
//! [`AddressRegistry`] current from membership changes and sink
//! undeliverable messages into [`DeadLetters`].
//!
//! Construct one explicitly with [`Runtime::start`] and pass it
//! around, or use [`Runtime::global`] to get the single lazily
//! started instance for this process.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::addresses::AddressInfo;
use crate::addresses::AddressRegistry;
use crate::addresses::NodeAddress;
use crate::cluster::connect;
use crate::cluster::spawn_link;
use crate::cluster::LinkEvent;
use crate::cluster::NodeLink;
use crate::cluster::Reply;
use crate::cluster::Request;
use crate::cluster::WireMessage;
use crate::config::EngineConfig;
use crate::config::Role;
use crate::errors::tracked_err;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::ErrorContext;
use crate::errors::RpcFailure;
use crate::identity::ActorVirtualIdentity;
use crate::worker::spawn_worker;
use crate::worker::ControlCommand;
use crate::worker::ControlReply;
use crate::worker::DataPayload;
use crate::worker::WorkerHandle;
use crate::worker::WorkerSpec;

mod dead_letters;

pub use dead_letters::DeadLetter;
pub use dead_letters::DeadLetters;

/// Where a worker lives, from this process's point of view.
#[derive(Debug, Clone)]
enum Route {
    Local(WorkerHandle),
    Remote(NodeAddress),
}

struct RuntimeInner {
    role: Role,
    address: NodeAddress,
    registry: AddressRegistry,
    dead_letters: DeadLetters,
    rpc_timeout: Duration,
    directory: Mutex<HashMap<ActorVirtualIdentity, Route>>,
    /// Connections to other nodes by the address they advertise.
    links: Mutex<HashMap<NodeAddress, NodeLink>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle on the runtime. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

static GLOBAL: OnceCell<Runtime> = OnceCell::const_new();

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Nothing here leaves the maps half-updated on panic.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Runtime {
    /// The process-wide runtime, started from `config` on first use.
    /// Later calls return the same instance and ignore `config`.
    pub async fn global(config: &EngineConfig) -> EngineResult<Runtime> {
        GLOBAL
            .get_or_try_init(|| Runtime::start(config))
            .await
            .cloned()
    }

    /// Start a runtime in the role `config` asks for.
    #[instrument(name = "runtime_start", skip_all, fields(role = %config.role))]
    pub async fn start(config: &EngineConfig) -> EngineResult<Runtime> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let dead_letters = DeadLetters::start();

        let (address, listener) = if !config.cluster_mode {
            (config.master.clone(), None)
        } else {
            let bind_host = match config.role {
                Role::Master => config.master.host.clone(),
                Role::Worker => config.local_host.clone(),
            };
            let bind_port = match config.role {
                Role::Master => config.master.port,
                Role::Worker => 0,
            };
            let listener = TcpListener::bind((bind_host.as_str(), bind_port))
                .await
                .reraise(&format!("can't bind {bind_host}:{bind_port}"))?;
            let port = listener.local_addr()?.port();
            (NodeAddress::new(bind_host, port), Some(listener))
        };

        let controller = match config.role {
            Role::Master => address.clone(),
            Role::Worker => config.master.clone(),
        };
        let seed = match config.role {
            Role::Master => AddressInfo::solo(address.clone()),
            Role::Worker => AddressInfo::new(controller.clone(), [controller.clone(), address.clone()]),
        };

        let runtime = Runtime {
            inner: Arc::new(RuntimeInner {
                role: config.role,
                address,
                registry: AddressRegistry::new(seed),
                dead_letters,
                rpc_timeout: config.rpc_timeout,
                directory: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        runtime.track(tokio::spawn(runtime.clone().event_loop(events_rx)));
        if let Some(listener) = listener {
            runtime.track(tokio::spawn(runtime.clone().accept_loop(listener)));
        }
        if config.cluster_mode && config.role == Role::Worker {
            runtime.join(&config.master, config.join_retries).await?;
        }

        tracing::info!(
            "Started {} runtime at {} (cluster mode: {})",
            runtime.role(),
            runtime.address(),
            config.cluster_mode
        );
        Ok(runtime)
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Address this node advertises.
    pub fn address(&self) -> &NodeAddress {
        &self.inner.address
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.inner.registry
    }

    pub fn dead_letters(&self) -> &DeadLetters {
        &self.inner.dead_letters
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.inner.rpc_timeout
    }

    fn track(&self, task: JoinHandle<()>) {
        lock(&self.inner.tasks).push(task);
    }

    fn link_to(&self, address: &NodeAddress) -> Option<NodeLink> {
        lock(&self.inner.links).get(address).cloned()
    }

    fn route(&self, worker: &ActorVirtualIdentity) -> Option<Route> {
        lock(&self.inner.directory).get(worker).cloned()
    }

    /// The local handle of `worker`, if it lives in this process.
    pub fn local_worker(&self, worker: &ActorVirtualIdentity) -> Option<WorkerHandle> {
        match self.route(worker)? {
            Route::Local(handle) => Some(handle),
            Route::Remote(_) => None,
        }
    }

    /// Start a worker on the node at `address`.
    ///
    /// Returns once the hosting node has started the worker actor,
    /// not once the worker is ready. A failure here means the
    /// placement was fine but the worker did not start.
    #[instrument(name = "create_worker", skip(self, spec), fields(worker = %spec.worker_id))]
    pub async fn create_worker(&self, address: &NodeAddress, spec: WorkerSpec) -> EngineResult<()> {
        let worker = spec.worker_id.clone();
        let failed = |reason: String| EngineError::Deployment {
            worker: worker.clone(),
            address: address.clone(),
            reason,
        };

        if address == self.address() {
            let handle = spawn_worker(spec, self.inner.dead_letters.clone())
                .map_err(|err| failed(err.to_string()))?;
            lock(&self.inner.directory).insert(worker.clone(), Route::Local(handle));
            return Ok(());
        }

        let link = self
            .link_to(address)
            .ok_or_else(|| failed("no connection to that node".to_string()))?;
        match link
            .request(Request::CreateWorker(spec), self.inner.rpc_timeout)
            .await
        {
            Ok(Reply::Created) => {
                lock(&self.inner.directory).insert(worker.clone(), Route::Remote(address.clone()));
                Ok(())
            }
            Ok(Reply::Failed(reason)) => Err(failed(reason)),
            Ok(other) => Err(failed(format!("unexpected reply {other:?}"))),
            Err(failure) => Err(failed(failure.to_string())),
        }
    }

    /// Send `command` to `worker` wherever it is and wait at most
    /// `timeout` for the reply. Requests that can't be sent at all are
    /// dead letters.
    pub async fn ask(
        &self,
        worker: &ActorVirtualIdentity,
        command: ControlCommand,
        timeout: Duration,
    ) -> Result<ControlReply, RpcFailure> {
        match self.route(worker) {
            None => {
                self.inner
                    .dead_letters
                    .publish(worker, format!("control request {command:?}"), "unknown worker");
                Err(RpcFailure::Unreachable)
            }
            Some(Route::Local(handle)) => handle.ask(command, timeout).await,
            Some(Route::Remote(address)) => {
                let Some(link) = self.link_to(&address) else {
                    self.inner.dead_letters.publish(
                        worker,
                        format!("control request {command:?}"),
                        format!("node {address}: {}", RpcFailure::Disconnected),
                    );
                    return Err(RpcFailure::Disconnected);
                };
                let request = Request::Control {
                    worker: worker.clone(),
                    command,
                    timeout_ms: timeout.as_millis() as u64,
                };
                match link.request(request, timeout).await? {
                    Reply::Control(result) => result,
                    Reply::Failed(reason) => Err(RpcFailure::Rejected(reason)),
                    Reply::Created => Err(RpcFailure::Rejected("unexpected reply".to_string())),
                }
            }
        }
    }

    /// Deliver data to `worker`. Anything undeliverable is a dead
    /// letter.
    pub fn send_data(&self, worker: &ActorVirtualIdentity, payload: DataPayload) {
        match self.route(worker) {
            Some(Route::Local(handle)) => handle.send_data(payload),
            Some(Route::Remote(address)) => {
                let sent = match self.link_to(&address) {
                    Some(link) => link.send(WireMessage::Data {
                        worker: worker.clone(),
                        payload,
                    }),
                    None => Err(RpcFailure::Disconnected),
                };
                if let Err(failure) = sent {
                    self.inner
                        .dead_letters
                        .publish(worker, "data message", format!("node {address}: {failure}"));
                }
            }
            None => self
                .inner
                .dead_letters
                .publish(worker, "data message", "unknown worker"),
        }
    }

    /// Stop accepting connections, close every link and drop all
    /// local workers.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down runtime at {}", self.address());
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        for (_, link) in lock(&self.inner.links).drain() {
            link.close();
        }
        lock(&self.inner.directory).clear();
    }

    async fn join(&self, master: &NodeAddress, retries: u32) -> EngineResult<()> {
        let mut membership = self.inner.registry.subscribe();
        let link = connect(master, retries, self.inner.events.clone())
            .await
            .reraise(&format!("can't join master at {master}"))?;
        lock(&self.inner.links).insert(master.clone(), link.clone());
        link.send(WireMessage::Join {
            address: self.address().clone(),
        })
        .map_err(|failure| tracked_err(&format!("can't send join to {master}: {failure}")))?;

        // The master answers with the new membership.
        match tokio::time::timeout(self.inner.rpc_timeout, membership.changed()).await {
            Ok(Ok(())) => tracing::info!("Joined cluster at {master}"),
            _ => tracing::warn!("No membership from {master} yet; continuing with the seed view"),
        }
        Ok(())
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted connection from {peer}");
                    if let Err(err) = spawn_link(stream, self.inner.events.clone()) {
                        tracing::warn!("Can't set up link to {peer}: {err}");
                    }
                }
                Err(err) => tracing::error!("Accept error: {err}"),
            }
        }
    }

    async fn event_loop(self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Frame { link, message } => self.on_frame(link, message),
                LinkEvent::Closed { link } => self.on_closed(link),
            }
        }
    }

    fn on_frame(&self, link: NodeLink, message: WireMessage) {
        match message {
            WireMessage::Join { address } => {
                tracing::info!("Node {address} joined from {}", link.peer());
                lock(&self.inner.links).insert(address, link);
                self.publish_membership();
            }
            WireMessage::Membership { info } => self.inner.registry.publish(info),
            WireMessage::Request { id, body } => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    let reply = runtime.serve(body).await;
                    link.reply(id, reply);
                });
            }
            WireMessage::Data { worker, payload } => match self.local_worker(&worker) {
                Some(handle) => handle.send_data(payload),
                None => self
                    .inner
                    .dead_letters
                    .publish(&worker, "data message", "no such worker on this node"),
            },
            WireMessage::Reply { id, .. } => {
                tracing::debug!("Stray reply {id} from {}", link.peer());
            }
        }
    }

    /// Answer a request another node sent us.
    async fn serve(&self, request: Request) -> Reply {
        match request {
            Request::CreateWorker(spec) => {
                let worker = spec.worker_id.clone();
                match spawn_worker(spec, self.inner.dead_letters.clone()) {
                    Ok(handle) => {
                        lock(&self.inner.directory).insert(worker, Route::Local(handle));
                        Reply::Created
                    }
                    Err(err) => {
                        tracing::error!("Can't start worker {worker}: {err}");
                        Reply::Failed(err.to_string())
                    }
                }
            }
            Request::Control {
                worker,
                command,
                timeout_ms,
            } => {
                let result = match self.local_worker(&worker) {
                    Some(handle) => handle.ask(command, Duration::from_millis(timeout_ms)).await,
                    None => {
                        self.inner.dead_letters.publish(
                            &worker,
                            format!("control request {command:?}"),
                            "no such worker on this node",
                        );
                        Err(RpcFailure::Unreachable)
                    }
                };
                Reply::Control(result)
            }
        }
    }

    fn on_closed(&self, link: NodeLink) {
        let gone: Vec<NodeAddress> = {
            let mut links = lock(&self.inner.links);
            let gone = links
                .iter()
                .filter(|(_, known)| **known == link)
                .map(|(address, _)| address.clone())
                .collect::<Vec<_>>();
            for address in &gone {
                links.remove(address);
            }
            gone
        };
        if gone.is_empty() {
            return;
        }
        for address in &gone {
            tracing::warn!("Lost connection to node {address}");
        }
        match self.role() {
            Role::Master => self.publish_membership(),
            Role::Worker => {
                // Nobody else will tell us the master is gone.
                let current = self.inner.registry.current_addresses();
                if gone.contains(&current.controller) {
                    let remaining = current
                        .all_addresses
                        .iter()
                        .filter(|address| !gone.contains(address))
                        .cloned();
                    self.inner
                        .registry
                        .publish(AddressInfo::new(current.controller.clone(), remaining));
                }
            }
        }
    }

    /// Recompute membership from the joined nodes and tell everyone.
    fn publish_membership(&self) {
        let links: BTreeMap<NodeAddress, NodeLink> = lock(&self.inner.links)
            .iter()
            .map(|(address, link)| (address.clone(), link.clone()))
            .collect();
        let info = AddressInfo::new(
            self.address().clone(),
            std::iter::once(self.address().clone()).chain(links.keys().cloned()),
        );
        self.inner.registry.publish(info.clone());
        for (address, link) in links {
            if let Err(failure) = link.send(WireMessage::Membership { info: info.clone() }) {
                tracing::debug!("Can't send membership to {address}: {failure}");
            }
        }
    }
}

#[cfg(test)]
fn local_spec(name: &str) -> WorkerSpec {
    WorkerSpec {
        worker_id: ActorVirtualIdentity::new(name),
        operator_id: crate::identity::OperatorIdentity::new("op"),
        executor: crate::worker::executor::ExecutorSpec::native("pass-through"),
        fault_tolerance: None,
        state_restore: None,
    }
}

#[tokio::test]
async fn local_runtime_routes_by_identity() {
    let runtime = Runtime::start(&EngineConfig::default()).await.unwrap();
    assert_eq!(runtime.registry().current_addresses().all_addresses.len(), 1);

    let here = runtime.address().clone();
    runtime
        .create_worker(&here, local_spec("Worker:op-0"))
        .await
        .unwrap();
    let worker = ActorVirtualIdentity::new("Worker:op-0");
    runtime
        .local_worker(&worker)
        .unwrap()
        .wait_for_state(|state| state == crate::worker::WorkerState::Running, Duration::from_secs(5))
        .await
        .unwrap();
    runtime.send_data(
        &worker,
        DataPayload::Batch(vec![crate::worker::Tuple::new()]),
    );
    match runtime
        .ask(&worker, ControlCommand::QueryStatistics, Duration::from_secs(5))
        .await
        .unwrap()
    {
        ControlReply::Statistics { stats, .. } => assert_eq!(stats.input_tuple_count, 1),
        other => panic!("unexpected reply {other:?}"),
    }
    runtime.shutdown();
}

#[tokio::test]
async fn unknown_workers_are_unreachable_and_dead_lettered() {
    let runtime = Runtime::start(&EngineConfig::default()).await.unwrap();
    let ghost = ActorVirtualIdentity::new("Worker:ghost-0");
    assert_eq!(
        runtime
            .ask(&ghost, ControlCommand::QueryStatistics, Duration::from_millis(50))
            .await,
        Err(RpcFailure::Unreachable)
    );
    runtime.send_data(&ghost, DataPayload::EndOfInput);
    let letters = runtime
        .dead_letters()
        .wait_for(2, Duration::from_secs(5))
        .await;
    assert_eq!(letters.len(), 2);
    assert_eq!(letters[0].recipient, "Worker:ghost-0");
    assert_eq!(letters[0].message, "control request QueryStatistics");
    assert_eq!(letters[1].message, "data message");
}

#[tokio::test]
async fn worker_drops_a_lost_master_from_membership() {
    let mut config = EngineConfig::default();
    config.cluster_mode = true;
    config.master = "127.0.0.1:0".parse().unwrap();
    let master = Runtime::start(&config).await.unwrap();

    config.role = Role::Worker;
    config.master = master.address().clone();
    config.local_host = "127.0.0.1".to_string();
    config.join_retries = 3;
    let worker = Runtime::start(&config).await.unwrap();
    let lost = master.address().clone();
    assert!(worker.registry().current_addresses().contains(&lost));

    master.shutdown();
    let mut membership = worker.registry().subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while membership.borrow_and_update().contains(&lost) {
            membership.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert_eq!(
        worker.registry().current_addresses().all_addresses,
        vec![worker.address().clone()]
    );
    worker.shutdown();
}

#[tokio::test]
async fn creating_on_an_unconnected_node_is_a_deployment_error() {
    let runtime = Runtime::start(&EngineConfig::default()).await.unwrap();
    let err = runtime
        .create_worker(&NodeAddress::new("elsewhere", 1), local_spec("Worker:op-1"))
        .await
        .unwrap_err();
    assert!(err.is_deployment());
    assert!(!err.is_placement());
}

#[tokio::test]
async fn global_runtime_is_started_once() {
    let config = EngineConfig::default();
    let first = Runtime::global(&config).await.unwrap();
    let second = Runtime::global(&config).await.unwrap();
    assert!(Arc::ptr_eq(&first.inner, &second.inner));
}
