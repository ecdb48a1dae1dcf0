use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A search against one or more indices. `body` is the raw query DSL.
#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub index: Vec<String>,
    pub body: Value,
}

impl SearchRequest {
    pub fn new(index: Vec<String>, body: Value) -> Self {
        Self { index, body }
    }

    /// Comma-joined index list as used in the `/_search` path.
    pub fn index_path(&self) -> String {
        self.index.join(",")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub hits: Hits,
    #[serde(default)]
    pub aggregations: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hits {
    #[serde(default)]
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(rename = "_source", default)]
    pub source: Value,
}

impl SearchResponse {
    /// Decode the named top-level aggregation. Missing aggregations are `None`.
    pub fn aggregation<T: DeserializeOwned>(&self, name: &str) -> serde_json::Result<Option<T>> {
        match self.aggregations.as_ref().and_then(|aggs| aggs.get(name)) {
            Some(agg) => serde_json::from_value(agg.clone()).map(Some),
            None => Ok(None),
        }
    }

    /// Decode every hit's `_source`.
    pub fn sources<T: DeserializeOwned>(&self) -> serde_json::Result<Vec<T>> {
        self.hits
            .hits
            .iter()
            .map(|hit| serde_json::from_value(hit.source.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlJob {
    pub job_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MlJobsResponse {
    #[serde(default)]
    pub jobs: Vec<MlJob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MlCapabilities {
    pub enabled: bool,
    pub licensed: bool,
}

impl MlCapabilities {
    pub fn is_available(&self) -> bool {
        self.enabled && self.licensed
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertParams {
    #[serde(rename = "serviceName", default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSummary {
    pub id: String,
    #[serde(default)]
    pub params: AlertParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindAlertsResponse {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub data: Vec<AlertSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertState {
    #[serde(rename = "alertInstances", default)]
    pub alert_instances: Option<HashMap<String, Value>>,
}

impl AlertState {
    pub fn has_violations(&self) -> bool {
        self.alert_instances
            .as_ref()
            .map(|instances| !instances.is_empty())
            .unwrap_or(false)
    }
}
