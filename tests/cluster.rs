//! A master and two worker nodes in one process, talking over
//! loopback TCP.

use std::collections::BTreeSet;
use std::time::Duration;

use amber::config::EngineConfig;
use amber::config::Role;
use amber::controller::ControllerRpc;
use amber::deploy::OperatorConfig;
use amber::deploy::WorkerDeployer;
use amber::errors::RpcFailure;
use amber::execution::WorkflowExecution;
use amber::identity::ActorVirtualIdentity;
use amber::identity::OperatorIdentity;
use amber::identity::RegionIdentity;
use amber::placement::LocationPreference;
use amber::runtime::Runtime;
use amber::worker::executor::ExecutorSpec;
use amber::worker::ControlCommand;
use amber::worker::ControlReply;
use amber::worker::DataPayload;
use amber::worker::Tuple;
use amber::worker::WorkerState;

fn master_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.cluster_mode = true;
    config.master = "127.0.0.1:0".parse().unwrap();
    config.rpc_timeout = Duration::from_secs(5);
    config
}

fn worker_config(master: &Runtime) -> EngineConfig {
    let mut config = master_config();
    config.role = Role::Worker;
    config.master = master.address().clone();
    config.local_host = "127.0.0.1".to_string();
    config.join_retries = 3;
    config
}

async fn wait_for_members(runtime: &Runtime, count: usize) {
    let mut membership = runtime.registry().subscribe();
    let waiting = async {
        while membership.borrow_and_update().all_addresses.len() != count {
            membership.changed().await.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(10), waiting)
        .await
        .unwrap_or_else(|_| panic!("cluster never reached {count} members"));
}

async fn statistics(runtime: &Runtime, worker: &ActorVirtualIdentity) -> Result<ControlReply, RpcFailure> {
    runtime
        .ask(worker, ControlCommand::QueryStatistics, Duration::from_secs(5))
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_round_trip() {
    let master = Runtime::start(&master_config()).await.unwrap();
    assert_eq!(master.role(), Role::Master);
    assert_ne!(master.address().port, 0);

    let node_a = Runtime::start(&worker_config(&master)).await.unwrap();
    let node_b = Runtime::start(&worker_config(&master)).await.unwrap();
    wait_for_members(&master, 3).await;
    wait_for_members(&node_a, 3).await;
    assert_eq!(
        node_a.registry().current_addresses().controller,
        *master.address()
    );

    // Round-robin over three nodes puts one worker on each.
    let state = WorkflowExecution::shared();
    let deployer = WorkerDeployer::new(master.clone(), state.clone());
    let op = OperatorIdentity::new("count");
    let mut config = OperatorConfig::with_workers(
        op.clone(),
        ExecutorSpec::native("running-count"),
        3,
        LocationPreference::RoundRobin,
    );
    config.executor.params = serde_json::json!({ "field": "n" });
    let report = deployer
        .schedule_region(RegionIdentity(1), &[config])
        .await
        .unwrap()
        .remove(0);
    assert!(report.is_complete(), "{:?}", report.failed);
    let hosts: BTreeSet<_> = report.deployed.iter().map(|(_, address)| address.clone()).collect();
    assert_eq!(hosts.len(), 3);

    // Data sent through the master reaches remote workers.
    let workers: Vec<_> = (0..3).map(|index| ActorVirtualIdentity::worker(&op, index)).collect();
    for worker in &workers {
        master.send_data(worker, DataPayload::Batch(vec![Tuple::new(), Tuple::new()]));
    }
    for worker in &workers {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match statistics(&master, worker).await.unwrap() {
                ControlReply::Statistics { state, stats } if stats.input_tuple_count == 2 => {
                    assert_eq!(state, WorkerState::Running);
                    break;
                }
                _ if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => panic!("{worker} never processed its batch: {other:?}"),
            }
        }
    }

    let controller = ControllerRpc::new(master.clone(), state.clone(), Duration::from_secs(5));
    let round = controller.query_worker_statistics(None).await;
    assert_eq!(round.updated.len(), 3);
    assert!(!round.update.partial);
    let op_stats = &round.update.regions[&RegionIdentity(1)][&op];
    assert_eq!(op_stats.stats.input_tuple_count, 6);
    assert_eq!(op_stats.stats.output_tuple_count, 6);

    // Losing a node shrinks membership and makes its worker stale.
    let lost = state
        .read()
        .await
        .latest_worker_execution(&workers[0])
        .and_then(|execution| execution.address().cloned())
        .unwrap();
    let (lost_node, survivor) = if lost == *node_a.address() {
        (node_a, node_b)
    } else if lost == *node_b.address() {
        (node_b, node_a)
    } else {
        // Worker 0 is on the master; take down node a instead.
        (node_a, node_b)
    };
    let lost_address = lost_node.address().clone();
    lost_node.shutdown();
    wait_for_members(&master, 2).await;
    assert!(!master.registry().current_addresses().contains(&lost_address));
    assert!(master.registry().current_addresses().contains(survivor.address()));

    let round = controller.query_worker_statistics(None).await;
    assert_eq!(round.updated.len(), 2);
    assert_eq!(round.failed.len(), 1);
    assert_eq!(round.failed[0].1, RpcFailure::Disconnected);
    assert!(round.update.partial);
    assert_eq!(round.update.stale_workers.len(), 1);

    survivor.shutdown();
    master.shutdown();
}

#[tokio::test]
async fn worker_without_a_master_gives_up() {
    let mut config = master_config();
    config.role = Role::Worker;
    // Nothing listens on the discard port.
    config.master = "127.0.0.1:9".parse().unwrap();
    config.local_host = "127.0.0.1".to_string();
    config.join_retries = 2;
    let err = Runtime::start(&config).await.err().unwrap();
    assert!(err.to_string().contains("can't join master"));
}
