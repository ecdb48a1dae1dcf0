use crate::error::Result;
use crate::result::{AlertState, AlertSummary, MlCapabilities, MlJob, SearchRequest, SearchResponse};
use async_trait::async_trait;
use serde_json::Value;

/// Query interface over span/transaction/error documents.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, request: SearchRequest) -> Result<SearchResponse>;
}

/// Machine-learning backend: job metadata and anomaly results.
#[async_trait]
pub trait MlClient: Send + Sync {
    async fn capabilities(&self) -> Result<MlCapabilities>;

    /// Anomaly detection jobs belonging to `group`. An unknown group yields no jobs.
    async fn jobs_by_group(&self, group: &str) -> Result<Vec<MlJob>>;

    /// Search the anomaly results index.
    async fn search(&self, body: Value) -> Result<SearchResponse>;
}

/// Alerting backend used for the per-service alert summary.
#[async_trait]
pub trait AlertsClient: Send + Sync {
    async fn find_alerts(&self, consumer: &str) -> Result<Vec<AlertSummary>>;

    async fn alert_state(&self, id: &str) -> Result<AlertState>;
}
