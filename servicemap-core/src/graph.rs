use crate::anomaly::ServiceAnomaly;
use crate::cursor::TraceSampleCursor;
use crate::identity::{node_id, resolve_node};
use crate::model::{ConnectionNode, DestinationMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Graph element wrapper: renderers expect everything under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element<T> {
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: String,
    #[serde(flatten)]
    pub node: ConnectionNode,
    #[serde(
        rename = "serviceAnomalyStats",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_anomaly_stats: Option<ServiceAnomaly>,
}

impl NodeData {
    /// Fold another sighting of the same node into this one. Service details
    /// win over external ones; missing agent, environment and anomaly data are
    /// filled in from `other`.
    pub fn absorb(&mut self, other: NodeData) {
        if let ConnectionNode::Service(theirs) = other.node {
            if let ConnectionNode::Service(mine) = &mut self.node {
                if mine.agent_name.is_empty() {
                    mine.agent_name = theirs.agent_name;
                }
                if mine.environment.is_none() {
                    mine.environment = theirs.environment;
                }
            } else {
                self.node = ConnectionNode::Service(theirs);
            }
        }
        if self.service_anomaly_stats.is_none() {
            self.service_anomaly_stats = other.service_anomaly_stats;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeData {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bidirectional: bool,
}

impl EdgeData {
    pub fn new(source: String, target: String) -> Self {
        Self {
            id: crate::identity::format_edge_id(&source, &target),
            source,
            target,
            bidirectional: false,
        }
    }
}

/// The service map as handed to a renderer. `after` continues pagination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMapGraph {
    pub nodes: Vec<Element<NodeData>>,
    pub edges: Vec<Element<EdgeData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<TraceSampleCursor>,
}

impl ServiceMapGraph {
    /// Assemble from identity-keyed nodes and edges; output is sorted by id.
    pub fn from_parts(
        nodes: BTreeMap<String, NodeData>,
        edges: BTreeMap<String, EdgeData>,
        after: Option<TraceSampleCursor>,
    ) -> Self {
        Self {
            nodes: nodes.into_values().map(|data| Element { data }).collect(),
            edges: collapse_inverse_edges(edges.into_values())
                .into_iter()
                .map(|data| Element { data })
                .collect(),
            after,
        }
    }

    /// Union with a later page. Nodes and edges are matched by id; `after`
    /// moves to the later page's cursor.
    pub fn merge(&mut self, other: ServiceMapGraph) {
        let mut nodes: BTreeMap<String, NodeData> = BTreeMap::new();
        for element in self.nodes.drain(..).chain(other.nodes) {
            insert_node(&mut nodes, element.data);
        }

        let mut edges: BTreeMap<String, EdgeData> = BTreeMap::new();
        for element in self.edges.drain(..).chain(other.edges) {
            let edge = element.data;
            edges
                .entry(edge.id.clone())
                .and_modify(|existing| existing.bidirectional |= edge.bidirectional)
                .or_insert(edge);
        }

        *self = ServiceMapGraph::from_parts(nodes, edges, other.after);
    }

    /// Collapse external nodes onto the services `destination_map` maps them
    /// to. Edges follow their endpoints; any that become self-loops are dropped.
    pub fn resolve_destinations(&mut self, destination_map: &DestinationMap) {
        if destination_map.is_empty() {
            return;
        }

        let mut renamed: HashMap<String, String> = HashMap::new();
        let mut nodes: BTreeMap<String, NodeData> = BTreeMap::new();
        for element in self.nodes.drain(..) {
            let mut data = element.data;
            let resolved = resolve_node(&data.node, destination_map).clone();
            let id = node_id(&resolved);
            if id != data.id {
                renamed.insert(data.id.clone(), id.clone());
                data = NodeData {
                    id,
                    node: resolved,
                    service_anomaly_stats: None,
                };
            }
            insert_node(&mut nodes, data);
        }
        if renamed.is_empty() {
            self.nodes = nodes.into_values().map(|data| Element { data }).collect();
            return;
        }

        let mut edges: BTreeMap<String, EdgeData> = BTreeMap::new();
        for element in self.edges.drain(..) {
            let edge = element.data;
            let source = renamed.get(&edge.source).cloned().unwrap_or(edge.source);
            let target = renamed.get(&edge.target).cloned().unwrap_or(edge.target);
            if source == target {
                continue;
            }
            let mut resolved = EdgeData::new(source, target);
            resolved.bidirectional = edge.bidirectional;
            edges
                .entry(resolved.id.clone())
                .and_modify(|existing| existing.bidirectional |= resolved.bidirectional)
                .or_insert(resolved);
        }

        *self = ServiceMapGraph::from_parts(nodes, edges, self.after.take());
    }

    pub fn node(&self, id: &str) -> Option<&NodeData> {
        self.nodes.iter().map(|e| &e.data).find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&EdgeData> {
        self.edges.iter().map(|e| &e.data).find(|n| n.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

pub fn insert_node(nodes: &mut BTreeMap<String, NodeData>, node: NodeData) {
    match nodes.get_mut(&node.id) {
        Some(existing) => existing.absorb(node),
        None => {
            nodes.insert(node.id.clone(), node);
        }
    }
}

/// Replace `a~b` + `b~a` pairs with the lexically smaller edge marked
/// bidirectional. Result is sorted by id.
pub fn collapse_inverse_edges(edges: impl IntoIterator<Item = EdgeData>) -> Vec<EdgeData> {
    let mut by_pair: BTreeMap<(String, String), EdgeData> = BTreeMap::new();

    for edge in edges {
        let key = if edge.source <= edge.target {
            (edge.source.clone(), edge.target.clone())
        } else {
            (edge.target.clone(), edge.source.clone())
        };
        match by_pair.get_mut(&key) {
            Some(existing) => {
                let inverse = existing.id != edge.id;
                let bidirectional = existing.bidirectional || edge.bidirectional || inverse;
                if edge.id < existing.id {
                    *existing = edge;
                }
                existing.bidirectional = bidirectional;
            }
            None => {
                by_pair.insert(key, edge);
            }
        }
    }

    let mut result: Vec<EdgeData> = by_pair.into_values().collect();
    result.sort_by(|a, b| a.id.cmp(&b.id));
    result
}
