use crate::error::{ClientError, Result};
use crate::http::HttpBackend;
use crate::result::{MlCapabilities, MlJob, MlJobsResponse, SearchRequest, SearchResponse};
use crate::search::{MlClient, SearchClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_ML_RESULTS_INDEX: &str = ".ml-anomalies-*";

/// Elasticsearch-backed search and ML client.
#[derive(Clone)]
pub struct ElasticsearchClient {
    http: HttpBackend,
    ml_results_index: String,
}

impl ElasticsearchClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, 30)
    }

    pub fn with_timeout(base_url: &str, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            http: HttpBackend::new(base_url, timeout_secs)?,
            ml_results_index: DEFAULT_ML_RESULTS_INDEX.to_string(),
        })
    }

    pub fn with_basic_auth(mut self, username: String, password: String) -> Self {
        self.http = self.http.with_basic_auth(username, password);
        self
    }

    pub fn with_ml_results_index(mut self, index: String) -> Self {
        self.ml_results_index = index;
        self
    }
}

#[async_trait]
impl SearchClient for ElasticsearchClient {
    async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        if request.index.is_empty() {
            return Err(ClientError::Other("search requires at least one index".into()));
        }
        let path = format!("{}/_search", request.index_path());
        debug!("POST {} on {}", path, self.http.base_url());
        let builder = self.http.post(&path)?.json(&request.body);
        self.http.send_json(builder).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct XpackInfo {
    #[serde(default)]
    features: XpackFeatures,
    #[serde(default)]
    license: Option<XpackLicense>,
}

#[derive(Debug, Default, Deserialize)]
struct XpackFeatures {
    #[serde(default)]
    ml: Option<XpackFeature>,
}

#[derive(Debug, Default, Deserialize)]
struct XpackFeature {
    #[serde(default)]
    available: bool,
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct XpackLicense {
    #[serde(default)]
    status: String,
}

#[async_trait]
impl MlClient for ElasticsearchClient {
    async fn capabilities(&self) -> Result<MlCapabilities> {
        let builder = self
            .http
            .get("_xpack")?
            .query(&[("categories", "features,license")]);
        let info: XpackInfo = self.http.send_json(builder).await?;

        let ml = info.features.ml.unwrap_or_default();
        let license_active = info
            .license
            .map(|license| license.status == "active")
            .unwrap_or(false);

        Ok(MlCapabilities {
            enabled: ml.enabled,
            licensed: ml.available && license_active,
        })
    }

    async fn jobs_by_group(&self, group: &str) -> Result<Vec<MlJob>> {
        let builder = self.http.get(&format!("_ml/anomaly_detectors/{}", group))?;
        match self.http.send_json::<MlJobsResponse>(builder).await {
            Ok(response) => Ok(response.jobs),
            Err(e) if e.status() == Some(404) => {
                debug!("No ML jobs in group {}", group);
                Ok(Vec::new())
            }
            Err(e) => {
                warn!("Unable to get ML jobs for group {}: {}", group, e);
                Err(e)
            }
        }
    }

    async fn search(&self, body: Value) -> Result<SearchResponse> {
        SearchClient::search(self, SearchRequest::new(vec![self.ml_results_index.clone()], body)).await
    }
}
