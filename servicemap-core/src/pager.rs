use crate::assembler::{ServiceMapRequest, ServiceMapService};
use crate::cursor::TraceSampleCursor;
use crate::error::Result;
use crate::graph::ServiceMapGraph;
use crate::model::DestinationMap;
use tracing::info;

/// Upper bound on pages fetched by one collection.
pub const MAX_REQUESTS: usize = 5;

/// Fetch pages until the sampler runs out of buckets or `max_requests` pages
/// have been assembled, merging them into one graph. Trace ids inspected on
/// earlier pages are excluded from later ones. A destination learned on any
/// page resolves externals recorded on every other page.
pub async fn collect_service_map(
    service: &ServiceMapService,
    mut request: ServiceMapRequest,
    max_requests: usize,
) -> Result<ServiceMapGraph> {
    let mut merged: Option<ServiceMapGraph> = None;
    let mut destination_map = DestinationMap::new();

    for page_number in 1..=max_requests.max(1) {
        let page = service.get_service_map_page(&request).await?;
        let after = page.graph.after.clone();
        info!(
            "Page {}: {} traces, {} nodes, {} edges",
            page_number,
            page.trace_ids.len(),
            page.graph.nodes.len(),
            page.graph.edges.len()
        );

        request.exclude_trace_ids.extend(page.trace_ids);
        destination_map.extend(page.destination_map);
        match merged.as_mut() {
            Some(graph) => graph.merge(page.graph),
            None => merged = Some(page.graph),
        }

        match after {
            Some(cursor @ TraceSampleCursor::After(_)) => request.after = Some(cursor),
            _ => break,
        }
    }

    let mut graph = merged.unwrap_or_default();
    graph.resolve_destinations(&destination_map);
    Ok(graph)
}
