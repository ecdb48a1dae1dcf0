//! Canonical node identities.
//!
//! An exit span records where a service called out to, not who answered. When a
//! downstream service is instrumented, the extractor learns which service sits
//! behind an address and records it in the [`DestinationMap`]; resolution
//! collapses such external nodes onto that service.

use crate::model::{ConnectionNode, DestinationMap};
use std::collections::HashSet;
use tracing::warn;

/// The node a connection endpoint stands for once destination mappings are
/// followed. A cyclic mapping yields the starting node unchanged.
pub fn resolve_node<'a>(
    node: &'a ConnectionNode,
    destination_map: &'a DestinationMap,
) -> &'a ConnectionNode {
    let mut current = node;
    let mut visited: HashSet<&str> = HashSet::new();

    while let ConnectionNode::External(external) = current {
        let address = external.destination_address.as_str();
        let Some(mapped) = destination_map.get(address) else {
            return current;
        };
        if !visited.insert(address) {
            warn!("Cyclic destination mapping through {}", address);
            return node;
        }
        current = mapped;
    }

    current
}

/// Identity string of a node: the service name, or the destination address
/// for externals nothing maps onto.
pub fn resolve_id(node: &ConnectionNode, destination_map: &DestinationMap) -> String {
    node_id(resolve_node(node, destination_map))
}

/// Identity of a node without destination resolution.
pub fn node_id(node: &ConnectionNode) -> String {
    match node {
        ConnectionNode::Service(service) => service.service_name.clone(),
        ConnectionNode::External(external) => external.destination_address.clone(),
    }
}

pub fn edge_id(
    source: &ConnectionNode,
    destination: &ConnectionNode,
    destination_map: &DestinationMap,
) -> String {
    format_edge_id(
        &resolve_id(source, destination_map),
        &resolve_id(destination, destination_map),
    )
}

pub fn format_edge_id(source_id: &str, target_id: &str) -> String {
    format!("{}~{}", source_id, target_id)
}
