//! Map assembly.
//!
//! One call samples trace ids, extracts connections from them in concurrent
//! chunks while the service inventory is fetched, attaches anomaly data and
//! merges everything into a deduplicated graph.

use crate::anomaly::{Anomalies, AnomaliesRequest, AnomalyJoiner, best_by_service, left_join};
use crate::config::Config;
use crate::cursor::TraceSampleCursor;
use crate::error::Result;
use crate::extractor::{ConnectionExtractor, ConnectionsChunk, ExtractRequest};
use crate::graph::{EdgeData, NodeData, ServiceMapGraph, insert_node};
use crate::identity::{node_id, resolve_node};
use crate::model::{ConnectionNode, DestinationMap, ServiceNode, TimeRange};
use crate::sampler::{SampleRequest, TraceSampler};
use crate::services::{ServiceInventory, ServicesRequest};
use futures::future::try_join_all;
use serde_json::Value;
use servicemap_client::{MlClient, SearchClient};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ServiceMapRequest {
    pub service_name: Option<String>,
    pub environment: Option<String>,
    pub time_range: TimeRange,
    pub filters: Vec<Value>,
    pub after: Option<TraceSampleCursor>,
    pub exclude_trace_ids: HashSet<String>,
}

/// One assembled page together with the trace ids it was built from and the
/// destination mappings learned from them.
#[derive(Debug, Clone, Default)]
pub struct ServiceMapPage {
    pub graph: ServiceMapGraph,
    pub trace_ids: Vec<String>,
    pub destination_map: DestinationMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Start,
    Sampling,
    Extracting,
    Merging,
    Done,
}

fn advance(state: &mut AssemblyState, next: AssemblyState) {
    let from = *state;
    debug!(?from, to = ?next, "service map assembly");
    *state = next;
}

pub struct ServiceMapService {
    sampler: TraceSampler,
    extractor: ConnectionExtractor,
    inventory: ServiceInventory,
    anomalies: AnomalyJoiner,
    max_traces_per_request: usize,
}

impl ServiceMapService {
    pub fn new(
        search: Arc<dyn SearchClient>,
        ml: Option<Arc<dyn MlClient>>,
        config: &Config,
    ) -> Self {
        let trace_indices = config.indices.trace_indices();
        let ml = if config.ml_enabled { ml } else { None };

        Self {
            sampler: TraceSampler::new(search.clone(), trace_indices.clone()),
            extractor: ConnectionExtractor::new(
                search.clone(),
                trace_indices,
                config.service_map.max_documents_per_request,
            ),
            inventory: ServiceInventory::new(search, config.indices.service_indices()),
            anomalies: AnomalyJoiner::new(ml),
            max_traces_per_request: config.service_map.max_traces_per_request.max(1),
        }
    }

    pub async fn get_service_map(&self, request: &ServiceMapRequest) -> Result<ServiceMapGraph> {
        Ok(self.get_service_map_page(request).await?.graph)
    }

    pub async fn get_service_map_page(&self, request: &ServiceMapRequest) -> Result<ServiceMapPage> {
        let mut state = AssemblyState::Start;

        advance(&mut state, AssemblyState::Sampling);
        let sample = self
            .sampler
            .sample(&SampleRequest {
                after: request.after.clone(),
                service_name: request.service_name.clone(),
                environment: request.environment.clone(),
                filters: request.filters.clone(),
                time_range: request.time_range,
                exclude_trace_ids: request.exclude_trace_ids.clone(),
            })
            .await?;

        advance(&mut state, AssemblyState::Extracting);
        let extract_requests: Vec<ExtractRequest> = sample
            .trace_ids
            .chunks(self.max_traces_per_request)
            .map(|chunk| ExtractRequest {
                trace_ids: chunk.to_vec(),
                service_name: request.service_name.clone(),
                environment: request.environment.clone(),
                time_range: request.time_range,
            })
            .collect();
        debug!(
            "Extracting {} traces in {} chunks",
            sample.trace_ids.len(),
            extract_requests.len()
        );

        let services_request = ServicesRequest {
            service_name: request.service_name.clone(),
            environment: request.environment.clone(),
            time_range: request.time_range,
        };
        let extraction = try_join_all(
            extract_requests
                .iter()
                .map(|chunk| self.extractor.extract_from_traces(chunk)),
        );
        let (chunks, services) = tokio::try_join!(
            extraction,
            self.inventory.get_services(&services_request)
        )?;

        let service_names: Vec<String> = services
            .iter()
            .chain(chunks.iter().flat_map(|c| c.discovered_services.iter()))
            .map(|s| s.service_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let anomalies = self
            .anomalies
            .get_anomalies(&AnomaliesRequest {
                service_names,
                time_range: request.time_range,
            })
            .await?;

        advance(&mut state, AssemblyState::Merging);
        let destination_map = merge_destination_maps(&chunks);
        let graph = transform_service_map(chunks, services, anomalies, sample.after);
        debug!(
            "Assembled {} nodes and {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );

        advance(&mut state, AssemblyState::Done);
        Ok(ServiceMapPage {
            graph,
            trace_ids: sample.trace_ids,
            destination_map,
        })
    }
}

/// Union of the chunk destination maps. A later chunk wins on conflict.
pub fn merge_destination_maps(chunks: &[ConnectionsChunk]) -> DestinationMap {
    let mut destination_map = DestinationMap::new();
    for chunk in chunks {
        destination_map.extend(chunk.destination_map.clone());
    }
    destination_map
}

/// Merge extraction chunks, the service inventory and anomaly data into the
/// final graph. Nodes and edges come out sorted by id.
pub fn transform_service_map(
    chunks: Vec<ConnectionsChunk>,
    services: Vec<ServiceNode>,
    anomalies: Option<Anomalies>,
    after: Option<TraceSampleCursor>,
) -> ServiceMapGraph {
    let destination_map = merge_destination_maps(&chunks);

    let mut nodes: BTreeMap<String, NodeData> = BTreeMap::new();
    let mut edges: BTreeMap<String, EdgeData> = BTreeMap::new();

    // Inventory first, so its agent names win over extracted ones.
    for service in services {
        insert_node(&mut nodes, node_data(ConnectionNode::Service(service)));
    }

    for chunk in &chunks {
        for service in &chunk.discovered_services {
            insert_node(&mut nodes, node_data(ConnectionNode::Service(service.clone())));
        }

        for connection in &chunk.connections {
            let source = resolve_node(&connection.source, &destination_map);
            let destination = resolve_node(&connection.destination, &destination_map);
            let source_id = node_id(source);
            let destination_id = node_id(destination);
            if source_id == destination_id {
                continue;
            }

            insert_node(&mut nodes, node_data(source.clone()));
            insert_node(&mut nodes, node_data(destination.clone()));

            let edge = EdgeData::new(source_id, destination_id);
            edges.entry(edge.id.clone()).or_insert(edge);
        }
    }

    if let Some(anomalies) = anomalies {
        let rows = left_join(&anomalies.job_categories, &anomalies.scores);
        let best = best_by_service(&rows);
        for node in nodes.values_mut() {
            if let Some(service) = node.node.as_service()
                && let Some(anomaly) = best.get(&service.service_name)
            {
                node.service_anomaly_stats = Some(anomaly.clone());
            }
        }
    }

    ServiceMapGraph::from_parts(nodes, edges, after)
}

fn node_data(node: ConnectionNode) -> NodeData {
    NodeData {
        id: node_id(&node),
        node,
        service_anomaly_stats: None,
    }
}
