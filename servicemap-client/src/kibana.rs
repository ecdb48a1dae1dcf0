use crate::error::Result;
use crate::http::HttpBackend;
use crate::result::{AlertState, AlertSummary, FindAlertsResponse};
use crate::search::AlertsClient;
use async_trait::async_trait;
use tracing::debug;

const FIND_PAGE_SIZE: &str = "1000";

/// Alerting client speaking to the Kibana alerts API.
#[derive(Clone)]
pub struct KibanaAlertsClient {
    http: HttpBackend,
}

impl KibanaAlertsClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            http: HttpBackend::new(base_url, timeout_secs)?,
        })
    }

    pub fn with_basic_auth(mut self, username: String, password: String) -> Self {
        self.http = self.http.with_basic_auth(username, password);
        self
    }
}

#[async_trait]
impl AlertsClient for KibanaAlertsClient {
    async fn find_alerts(&self, consumer: &str) -> Result<Vec<AlertSummary>> {
        let filter = format!("alert.attributes.consumer:\"{}\"", consumer);
        let builder = self
            .http
            .get("api/alerts/_find")?
            .query(&[("filter", filter.as_str()), ("per_page", FIND_PAGE_SIZE)]);
        let response: FindAlertsResponse = self.http.send_json(builder).await?;
        debug!("Found {} alerts for consumer {}", response.total, consumer);
        Ok(response.data)
    }

    async fn alert_state(&self, id: &str) -> Result<AlertState> {
        let builder = self.http.get(&format!("api/alerts/alert/{}/state", id))?;
        self.http.send_json(builder).await
    }
}
