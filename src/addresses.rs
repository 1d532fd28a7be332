//! The cluster view: which nodes are reachable right now.
//!
//! [`AddressRegistry`] holds the current [`AddressInfo`] behind a
//! watch channel. Membership changes publish a whole new snapshot, so
//! a reader either sees the old list or the new one and never a
//! partially updated one. Callers that make several placement
//! decisions should take one snapshot with
//! [`AddressRegistry::current_addresses`] and use it for all of them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::errors::PlacementError;

/// Network address of one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Accepts `host:port` and the long form `amber://<system>@host:port`.
impl FromStr for NodeAddress {
    type Err = PlacementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| PlacementError::InvalidAddress {
            requested: s.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = s.trim();
        let without_scheme = match trimmed.split_once("://") {
            Some((_scheme, rest)) => rest,
            None => trimmed,
        };
        let host_port = match without_scheme.rsplit_once('@') {
            Some((_system, rest)) => rest,
            None => without_scheme,
        };
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|err| invalid(&format!("bad port: {err}")))?;
        Ok(Self::new(host, port))
    }
}

/// Read-only snapshot of the cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    /// Address of the node hosting the controller.
    pub controller: NodeAddress,
    /// Every reachable node, controller included unless a worker node
    /// lost its connection to it. Sorted and without
    /// duplicates so round-robin placement is repeatable.
    pub all_addresses: Vec<NodeAddress>,
}

impl AddressInfo {
    pub fn new(controller: NodeAddress, all_addresses: impl IntoIterator<Item = NodeAddress>) -> Self {
        let mut all_addresses: Vec<_> = all_addresses.into_iter().collect();
        all_addresses.sort();
        all_addresses.dedup();
        Self {
            controller,
            all_addresses,
        }
    }

    /// A cluster made only of the controller.
    pub fn solo(controller: NodeAddress) -> Self {
        Self::new(controller.clone(), [controller])
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.all_addresses.binary_search(address).is_ok()
    }
}

/// Holds the latest [`AddressInfo`].
///
/// Cheap to clone; all clones observe the same membership.
#[derive(Debug, Clone)]
pub struct AddressRegistry {
    tx: Arc<watch::Sender<Arc<AddressInfo>>>,
}

impl AddressRegistry {
    pub fn new(initial: AddressInfo) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// The current cluster view. No side effects.
    pub fn current_addresses(&self) -> Arc<AddressInfo> {
        self.tx.borrow().clone()
    }

    /// Replace the cluster view wholesale.
    pub fn publish(&self, info: AddressInfo) {
        tracing::debug!(
            controller = %info.controller,
            nodes = info.all_addresses.len(),
            "Publishing cluster addresses"
        );
        self.tx.send_replace(Arc::new(info));
    }

    /// Get notified on every membership change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AddressInfo>> {
        self.tx.subscribe()
    }
}

#[test]
fn parse_short_and_long_forms() {
    assert_eq!(
        "10.0.0.1:2552".parse::<NodeAddress>().unwrap(),
        NodeAddress::new("10.0.0.1", 2552)
    );
    assert_eq!(
        "amber://Amber@node-b:2600".parse::<NodeAddress>().unwrap(),
        NodeAddress::new("node-b", 2600)
    );
}

#[test]
fn parse_rejects_garbage() {
    assert!(matches!(
        "node-b".parse::<NodeAddress>(),
        Err(PlacementError::InvalidAddress { .. })
    ));
    assert!("node-b:http".parse::<NodeAddress>().is_err());
    assert!(":80".parse::<NodeAddress>().is_err());
}

#[test]
fn address_info_sorts_and_dedups() {
    let c = NodeAddress::new("c", 1);
    let info = AddressInfo::new(
        c.clone(),
        [c.clone(), NodeAddress::new("a", 1), c.clone()],
    );
    assert_eq!(info.all_addresses, vec![NodeAddress::new("a", 1), c.clone()]);
    assert!(info.contains(&c));
}

#[test]
fn registry_swaps_snapshots() {
    let a = NodeAddress::new("a", 1);
    let registry = AddressRegistry::new(AddressInfo::solo(a.clone()));
    let before = registry.current_addresses();
    registry.publish(AddressInfo::new(a.clone(), [a.clone(), NodeAddress::new("b", 1)]));
    // The old snapshot is untouched.
    assert_eq!(before.all_addresses.len(), 1);
    assert_eq!(registry.current_addresses().all_addresses.len(), 2);
}
