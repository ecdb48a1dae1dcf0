use crate::error::{ClientError, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Shared reqwest plumbing for the backend clients.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    credentials: Option<(String, String)>,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        let client = Client::builder()
            .user_agent(concat!("servicemap/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs((timeout_secs / 2).max(1)))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url,
            credentials: None,
        })
    }

    pub fn with_basic_auth(mut self, username: String, password: String) -> Self {
        self.credentials = Some((username, password));
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` below the base URL, keeping any path prefix the base carries.
    pub fn url(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", joined, e)))
    }

    pub fn get(&self, path: &str) -> Result<RequestBuilder> {
        Ok(self.authorize(self.client.get(self.url(path)?)))
    }

    pub fn post(&self, path: &str) -> Result<RequestBuilder> {
        Ok(self.authorize(self.client.post(self.url(path)?)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    /// Send a request and decode a JSON body, mapping non-2xx to `StatusError`.
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        debug!("{} returned {}: {}", url, status, body);
        Err(ClientError::StatusError {
            status: status.as_u16(),
            body,
        })
    }
}
