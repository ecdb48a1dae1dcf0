//! Connection extraction.
//!
//! Fetches the span and transaction documents of a chunk of traces and walks
//! each event up its parent chain. Every event gets a *path*: the sequence of
//! locations (services, then possibly an external destination) the request
//! travelled through to reach it. Consecutive locations on a path are
//! connections.

use crate::error::Result;
use crate::model::{
    Connection, ConnectionNode, DestinationMap, ExternalNode, PROCESSOR_EVENT, ServiceNode,
    TIMESTAMP, TRACE_ID, TimeRange, terms_filter,
};
use serde::Deserialize;
use serde_json::{Value, json};
use servicemap_client::{SearchClient, SearchRequest};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct ExtractRequest {
    pub trace_ids: Vec<String>,
    pub service_name: Option<String>,
    pub environment: Option<String>,
    pub time_range: TimeRange,
}

/// What one chunk of traces contributed. Not deduplicated across chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionsChunk {
    pub connections: Vec<Connection>,
    pub discovered_services: Vec<ServiceNode>,
    pub destination_map: DestinationMap,
}

#[derive(Debug, Default, Deserialize)]
struct IdField {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NameField {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceField {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    environment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SpanField {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    span_type: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DestinationField {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TraceDocument {
    #[serde(default)]
    transaction: Option<IdField>,
    #[serde(default)]
    span: Option<SpanField>,
    #[serde(default)]
    parent: Option<IdField>,
    #[serde(default)]
    service: Option<ServiceField>,
    #[serde(default)]
    agent: Option<NameField>,
    #[serde(default)]
    destination: Option<DestinationField>,
}

/// A span or transaction reduced to what path building needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub id: String,
    pub parent_id: Option<String>,
    pub service: ServiceNode,
    /// Set for exit spans: where the span called out to.
    pub exit: Option<ExternalNode>,
}

impl TraceEvent {
    fn from_document(doc: TraceDocument) -> Option<Self> {
        let span = doc.span.unwrap_or_default();
        let id = span
            .id
            .clone()
            .or_else(|| doc.transaction.and_then(|t| t.id))?;
        let service = doc.service.unwrap_or_default();
        let service_name = service.name?;

        let exit = doc
            .destination
            .and_then(|d| d.address)
            .filter(|address| !address.is_empty() && span.id.is_some())
            .map(|address| ExternalNode {
                destination_address: address,
                span_type: span.span_type.unwrap_or_default(),
                span_subtype: span.subtype.unwrap_or_default(),
            });

        Some(TraceEvent {
            id,
            parent_id: doc.parent.and_then(|p| p.id),
            service: ServiceNode {
                service_name,
                agent_name: doc.agent.and_then(|a| a.name).unwrap_or_default(),
                environment: service.environment,
            },
            exit,
        })
    }
}

pub struct ConnectionExtractor {
    client: Arc<dyn SearchClient>,
    indices: Vec<String>,
    max_documents: usize,
}

impl ConnectionExtractor {
    pub fn new(client: Arc<dyn SearchClient>, indices: Vec<String>, max_documents: usize) -> Self {
        Self {
            client,
            indices,
            max_documents,
        }
    }

    pub async fn extract_from_traces(&self, request: &ExtractRequest) -> Result<ConnectionsChunk> {
        if request.trace_ids.is_empty() {
            return Ok(ConnectionsChunk::default());
        }

        let body = build_events_query(request, self.max_documents);
        let response = self
            .client
            .search(SearchRequest::new(self.indices.clone(), body))
            .await?;

        let documents: Vec<TraceDocument> = response.sources()?;
        let total = documents.len();
        if total >= self.max_documents {
            warn!(
                "Chunk of {} traces hit the {} document limit, connections may be incomplete",
                request.trace_ids.len(),
                self.max_documents
            );
        }
        let events: Vec<TraceEvent> = documents
            .into_iter()
            .filter_map(TraceEvent::from_document)
            .collect();
        debug!(
            "Fetched {} documents ({} usable) for {} traces",
            total,
            events.len(),
            request.trace_ids.len()
        );

        Ok(reconstruct_connections(
            &events,
            request.service_name.as_deref(),
            request.environment.as_deref(),
        ))
    }
}

pub fn build_events_query(request: &ExtractRequest, max_documents: usize) -> Value {
    json!({
        "size": max_documents,
        "_source": [
            "trace.id", "transaction.id", "span.id", "parent.id",
            "service.name", "service.environment", "agent.name",
            "span.type", "span.subtype", "destination.address"
        ],
        "query": {
            "bool": {
                "filter": [
                    terms_filter(TRACE_ID, &request.trace_ids),
                    terms_filter(PROCESSOR_EVENT, &["span".to_string(), "transaction".to_string()]),
                    request.time_range.range_filter(TIMESTAMP)
                ]
            }
        },
        "sort": [{ TIMESTAMP: { "order": "asc" } }]
    })
}

/// Build paths for every event and turn them into connections.
///
/// With `service_name` or `environment` set, only paths passing through a
/// matching service contribute connections and discovered services. The
/// destination map is always complete.
pub fn reconstruct_connections(
    events: &[TraceEvent],
    service_name: Option<&str>,
    environment: Option<&str>,
) -> ConnectionsChunk {
    let by_id: HashMap<&str, &TraceEvent> = events.iter().map(|e| (e.id.as_str(), e)).collect();
    let mut paths: HashMap<&str, Vec<ConnectionNode>> = HashMap::new();
    let mut all_paths: Vec<Vec<ConnectionNode>> = Vec::new();
    let mut destination_map = DestinationMap::new();

    for event in events {
        // unprocessed ancestors, nearest first
        let mut chain: Vec<&TraceEvent> = Vec::new();
        let mut on_chain: HashSet<&str> = HashSet::new();
        let mut cursor = Some(event.id.as_str());
        while let Some(id) = cursor {
            if paths.contains_key(id) {
                break;
            }
            let Some(&current) = by_id.get(id) else { break };
            if !on_chain.insert(id) {
                warn!("Cyclic parent chain at event {}", id);
                break;
            }
            chain.push(current);
            cursor = current.parent_id.as_deref().filter(|parent| *parent != id);
        }

        for current in chain.into_iter().rev() {
            let parent = current
                .parent_id
                .as_deref()
                .and_then(|id| by_id.get(id))
                .filter(|parent| paths.contains_key(parent.id.as_str()));

            let mut path = parent
                .and_then(|p| paths.get(p.id.as_str()))
                .cloned()
                .unwrap_or_default();

            if let Some(parent) = parent
                && let Some(exit) = &parent.exit
                && (parent.service.service_name != current.service.service_name
                    || parent.service.environment != current.service.environment)
            {
                destination_map.insert(
                    exit.destination_address.clone(),
                    current.service.clone().into(),
                );
            }

            let location = ConnectionNode::Service(current.service.clone());
            if path.last() != Some(&location) {
                path.push(location);
            }

            if let Some(exit) = &current.exit {
                let mut outgoing = path.clone();
                outgoing.push(exit.clone().into());
                all_paths.push(outgoing);
            }

            all_paths.push(path.clone());
            paths.insert(current.id.as_str(), path);
        }
    }

    let matches = |node: &ConnectionNode| match node {
        ConnectionNode::Service(service) => {
            service_name.is_none_or(|name| service.service_name == name)
                && environment.is_none_or(|env| service.environment.as_deref() == Some(env))
        }
        ConnectionNode::External(_) => false,
    };
    let filtered = service_name.is_some() || environment.is_some();

    let mut connections: BTreeSet<Connection> = BTreeSet::new();
    let mut discovered: BTreeSet<ServiceNode> = BTreeSet::new();
    let mut reached: HashSet<&str> = HashSet::new();

    for path in all_paths
        .iter()
        .filter(|path| !filtered || path.iter().any(matches))
    {
        for pair in path.windows(2) {
            connections.insert(Connection::new(pair[0].clone(), pair[1].clone()));
        }
        for node in path {
            match node {
                ConnectionNode::Service(service) => {
                    discovered.insert(service.clone());
                }
                ConnectionNode::External(external) => {
                    reached.insert(external.destination_address.as_str());
                }
            }
        }
    }
    // Mapped services only surface through a destination on a kept path.
    discovered.extend(
        destination_map
            .iter()
            .filter(|(address, _)| reached.contains(address.as_str()))
            .filter_map(|(_, node)| node.as_service().cloned()),
    );

    ConnectionsChunk {
        connections: connections.into_iter().collect(),
        discovered_services: discovered.into_iter().collect(),
        destination_map,
    }
}
