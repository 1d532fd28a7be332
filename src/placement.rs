//! Location policy: where a worker should run.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::addresses::AddressInfo;
use crate::addresses::NodeAddress;
use crate::errors::PlacementError;

/// Placement policy declared on a physical operator.
///
/// Immutable once scheduling starts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "address", rename_all = "snake_case")]
pub enum LocationPreference {
    /// Run next to the controller.
    PreferController,
    /// Run on exactly this node; fail if the node is not a member.
    GoToSpecificNode(String),
    /// Spread workers across all nodes by worker index.
    #[default]
    RoundRobin,
}

impl fmt::Display for LocationPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreferController => write!(f, "prefer-controller"),
            Self::GoToSpecificNode(addr) => write!(f, "go-to-specific-node({addr})"),
            Self::RoundRobin => write!(f, "round-robin"),
        }
    }
}

/// Pick the node for the `worker_index`th worker.
///
/// There are no retries and no fallbacks between policies. An error
/// here means the worker must not be created.
pub fn resolve_location(
    worker_index: usize,
    preference: &LocationPreference,
    addresses: &AddressInfo,
) -> Result<NodeAddress, PlacementError> {
    match preference {
        LocationPreference::PreferController => Ok(addresses.controller.clone()),
        LocationPreference::GoToSpecificNode(requested) => {
            let requested: NodeAddress = requested.parse()?;
            if addresses.contains(&requested) {
                Ok(requested)
            } else {
                Err(PlacementError::UnknownNode {
                    requested,
                    known_hosts: addresses.all_addresses.clone(),
                })
            }
        }
        LocationPreference::RoundRobin => {
            let count = addresses.all_addresses.len();
            if count == 0 {
                return Err(PlacementError::NoNodes { worker_index });
            }
            Ok(addresses.all_addresses[worker_index % count].clone())
        }
    }
}

#[cfg(test)]
fn nodes(names: &[&str]) -> Vec<NodeAddress> {
    names.iter().map(|n| NodeAddress::new(*n, 2552)).collect()
}

#[test]
fn round_robin_cycles_over_nodes() {
    let all = nodes(&["a", "b", "c"]);
    let info = AddressInfo::new(all[0].clone(), all.clone());
    let placed: Vec<_> = (0..5)
        .map(|i| resolve_location(i, &LocationPreference::RoundRobin, &info).unwrap())
        .collect();
    assert_eq!(
        placed,
        vec![
            all[0].clone(),
            all[1].clone(),
            all[2].clone(),
            all[0].clone(),
            all[1].clone()
        ]
    );
}

#[test]
fn round_robin_is_repeatable_for_any_size() {
    for n in 1..7 {
        let names: Vec<String> = (0..n).map(|i| format!("node{i}")).collect();
        let all: Vec<_> = names.iter().map(|h| NodeAddress::new(h.clone(), 1)).collect();
        let info = AddressInfo::new(all[0].clone(), all.clone());
        for i in 0..20 {
            let first = resolve_location(i, &LocationPreference::RoundRobin, &info).unwrap();
            let second = resolve_location(i, &LocationPreference::RoundRobin, &info).unwrap();
            assert_eq!(first, second);
            assert_eq!(first, info.all_addresses[i % n]);
        }
    }
}

#[test]
fn round_robin_fails_without_nodes() {
    let info = AddressInfo {
        controller: NodeAddress::new("a", 1),
        all_addresses: Vec::new(),
    };
    assert_eq!(
        resolve_location(4, &LocationPreference::RoundRobin, &info),
        Err(PlacementError::NoNodes { worker_index: 4 })
    );
}

#[test]
fn prefer_controller_ignores_node_list() {
    let all = nodes(&["a", "b", "c"]);
    let controller = NodeAddress::new("ctl", 9);
    let info = AddressInfo::new(controller.clone(), all);
    for i in 0..4 {
        assert_eq!(
            resolve_location(i, &LocationPreference::PreferController, &info).unwrap(),
            controller
        );
    }
}

#[test]
fn specific_node_must_be_known() {
    let all = nodes(&["a", "b"]);
    let info = AddressInfo::new(all[0].clone(), all.clone());

    let found = resolve_location(
        0,
        &LocationPreference::GoToSpecificNode("amber://Amber@b:2552".to_string()),
        &info,
    );
    assert_eq!(found.unwrap(), all[1]);

    let missing = resolve_location(
        0,
        &LocationPreference::GoToSpecificNode("z:2552".to_string()),
        &info,
    );
    assert_eq!(
        missing,
        Err(PlacementError::UnknownNode {
            requested: NodeAddress::new("z", 2552),
            known_hosts: all,
        })
    );
}

#[test]
fn preference_json_shape() {
    let json = serde_json::to_string(&LocationPreference::GoToSpecificNode("a:1".into())).unwrap();
    assert_eq!(json, r#"{"type":"go_to_specific_node","address":"a:1"}"#);
    let back: LocationPreference = serde_json::from_str(r#"{"type":"round_robin"}"#).unwrap();
    assert_eq!(back, LocationPreference::RoundRobin);
}
