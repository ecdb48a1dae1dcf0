use crate::error::Result;
use crate::model::{AGENT_NAME, SERVICE_NAME, ServiceNode, TIMESTAMP, TimeRange, term_filter};
use serde::Deserialize;
use serde_json::{Value, json};
use servicemap_client::{SearchClient, SearchRequest};
use std::sync::Arc;
use tracing::debug;

pub const MAX_SERVICES: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct ServicesRequest {
    pub service_name: Option<String>,
    pub environment: Option<String>,
    pub time_range: TimeRange,
}

#[derive(Debug, Default, Deserialize)]
struct ServicesAggregation {
    #[serde(default)]
    buckets: Vec<ServiceBucket>,
}

#[derive(Debug, Deserialize)]
struct ServiceBucket {
    key: String,
    #[serde(default)]
    agent_name: AgentAggregation,
}

#[derive(Debug, Default, Deserialize)]
struct AgentAggregation {
    #[serde(default)]
    buckets: Vec<AgentBucket>,
}

#[derive(Debug, Deserialize)]
struct AgentBucket {
    key: String,
}

/// Service inventory: every service that reported data in the window, with
/// its agent.
pub struct ServiceInventory {
    client: Arc<dyn SearchClient>,
    indices: Vec<String>,
}

impl ServiceInventory {
    pub fn new(client: Arc<dyn SearchClient>, indices: Vec<String>) -> Self {
        Self { client, indices }
    }

    pub async fn get_services(&self, request: &ServicesRequest) -> Result<Vec<ServiceNode>> {
        let body = build_services_query(request);
        let response = self
            .client
            .search(SearchRequest::new(self.indices.clone(), body))
            .await?;

        let services: ServicesAggregation = response.aggregation("services")?.unwrap_or_default();
        debug!("Service inventory returned {} services", services.buckets.len());

        Ok(services
            .buckets
            .into_iter()
            .map(|bucket| ServiceNode {
                service_name: bucket.key,
                agent_name: bucket
                    .agent_name
                    .buckets
                    .into_iter()
                    .next()
                    .map(|b| b.key)
                    .unwrap_or_default(),
                environment: request.environment.clone(),
            })
            .collect())
    }
}

pub fn build_services_query(request: &ServicesRequest) -> Value {
    let mut filter = vec![request.time_range.range_filter(TIMESTAMP)];
    if let Some(service_name) = &request.service_name {
        filter.push(term_filter(SERVICE_NAME, service_name.as_str()));
    }

    json!({
        "size": 0,
        "query": { "bool": { "filter": filter } },
        "aggs": {
            "services": {
                "terms": { "field": SERVICE_NAME, "size": MAX_SERVICES },
                "aggs": {
                    "agent_name": { "terms": { "field": AGENT_NAME } }
                }
            }
        }
    })
}
