use crate::error::{Result, ServiceMapError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/servicemap/config.json";
const ENV_PREFIX: &str = "SERVICEMAP_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Indices {
    pub span: String,
    pub transaction: String,
    pub error: String,
    pub ml_results: String,
}

impl Default for Indices {
    fn default() -> Self {
        Self {
            span: "apm-*-span".to_string(),
            transaction: "apm-*-transaction".to_string(),
            error: "apm-*-error".to_string(),
            ml_results: ".ml-anomalies-*".to_string(),
        }
    }
}

impl Indices {
    /// Indices holding spans and transactions, the documents traces are made of.
    pub fn trace_indices(&self) -> Vec<String> {
        split_indices(&[&self.span, &self.transaction])
    }

    /// Indices any service could have reported to.
    pub fn service_indices(&self) -> Vec<String> {
        split_indices(&[&self.transaction, &self.span, &self.error])
    }
}

fn split_indices(patterns: &[&String]) -> Vec<String> {
    let mut indices: Vec<String> = Vec::new();
    for index in patterns
        .iter()
        .flat_map(|p| p.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        if !indices.iter().any(|existing| existing == index) {
            indices.push(index.to_string());
        }
    }
    indices
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceMapSettings {
    pub enabled: bool,
    /// Trace ids per extraction query.
    pub max_traces_per_request: usize,
    /// Documents fetched per extraction query.
    pub max_documents_per_request: usize,
    /// Window used when the caller gives no start time.
    pub initial_time_range_ms: i64,
}

impl Default for ServiceMapSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_traces_per_request: 50,
            max_documents_per_request: 10_000,
            initial_time_range_ms: 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub elasticsearch_url: String,
    pub kibana_url: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub indices: Indices,
    pub service_map: ServiceMapSettings,
    pub ml_enabled: bool,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            elasticsearch_url: "http://localhost:9200".to_string(),
            kibana_url: None,
            username: None,
            password: None,
            indices: Indices::default(),
            service_map: ServiceMapSettings::default(),
            ml_enabled: true,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from `path` (or the default location), then apply
    /// `SERVICEMAP_*` environment overrides. A missing default file is not an
    /// error; a missing explicit file is.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let explicit = path.is_some();
        let path = expand_path(path.unwrap_or(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else if explicit {
            return Err(ServiceMapError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        } else {
            debug!("No config at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            ServiceMapError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply `SERVICEMAP_*` overrides from an environment snapshot.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "ELASTICSEARCH_URL" => self.elasticsearch_url = value,
                "KIBANA_URL" => self.kibana_url = Some(value).filter(|v| !v.is_empty()),
                "USERNAME" => self.username = Some(value),
                "PASSWORD" => self.password = Some(value),
                "SPAN_INDICES" => self.indices.span = value,
                "TRANSACTION_INDICES" => self.indices.transaction = value,
                "ERROR_INDICES" => self.indices.error = value,
                "ML_RESULTS_INDEX" => self.indices.ml_results = value,
                "ENABLED" => self.service_map.enabled = parse_env(&key, &value)?,
                "MAX_TRACES_PER_REQUEST" => {
                    self.service_map.max_traces_per_request = parse_env(&key, &value)?
                }
                "MAX_DOCUMENTS_PER_REQUEST" => {
                    self.service_map.max_documents_per_request = parse_env(&key, &value)?
                }
                "INITIAL_TIME_RANGE_MS" => {
                    self.service_map.initial_time_range_ms = parse_env(&key, &value)?
                }
                "ML_ENABLED" => self.ml_enabled = parse_env(&key, &value)?,
                "REQUEST_TIMEOUT_SECS" => self.request_timeout_secs = parse_env(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.elasticsearch_url).map_err(|e| {
            ServiceMapError::Config(format!("invalid elasticsearch_url {}: {}", self.elasticsearch_url, e))
        })?;
        if let Some(kibana_url) = &self.kibana_url {
            Url::parse(kibana_url).map_err(|e| {
                ServiceMapError::Config(format!("invalid kibana_url {}: {}", kibana_url, e))
            })?;
        }
        if self.service_map.max_traces_per_request == 0 {
            return Err(ServiceMapError::Config(
                "service_map.max_traces_per_request must be greater than zero".into(),
            ));
        }
        if self.service_map.max_documents_per_request == 0 {
            return Err(ServiceMapError::Config(
                "service_map.max_documents_per_request must be greater than zero".into(),
            ));
        }
        if self.service_map.initial_time_range_ms <= 0 {
            return Err(ServiceMapError::Config(
                "service_map.initial_time_range_ms must be positive".into(),
            ));
        }
        if self.indices.trace_indices().is_empty() {
            return Err(ServiceMapError::Config("no span or transaction indices configured".into()));
        }
        Ok(())
    }

    /// Credentials when both halves are set.
    pub fn basic_auth(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ServiceMapError::Config(format!("invalid value for {}: {}", key, value)))
}

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.service_map.max_traces_per_request, 50);
        assert_eq!(
            config.indices.trace_indices(),
            vec!["apm-*-span", "apm-*-transaction"]
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(vars(&[
                ("SERVICEMAP_ELASTICSEARCH_URL", "https://es.internal:9243"),
                ("SERVICEMAP_MAX_TRACES_PER_REQUEST", "25"),
                ("SERVICEMAP_ML_ENABLED", "false"),
                ("SERVICEMAP_KIBANA_URL", ""),
                ("UNRELATED", "1"),
            ]))
            .unwrap();

        assert_eq!(config.elasticsearch_url, "https://es.internal:9243");
        assert_eq!(config.service_map.max_traces_per_request, 25);
        assert!(!config.ml_enabled);
        assert_eq!(config.kibana_url, None);
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(vars(&[("SERVICEMAP_MAX_TRACES_PER_REQUEST", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ServiceMapError::Config(_)));
    }

    #[test]
    fn test_zero_chunk_size_invalid() {
        let mut config = Config::default();
        config.service_map.max_traces_per_request = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_comma_separated_indices_dedupe() {
        let indices = Indices {
            span: "apm-*,traces-*".into(),
            transaction: "apm-*".into(),
            ..Default::default()
        };
        assert_eq!(indices.trace_indices(), vec!["apm-*", "traces-*"]);
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{ "kibana_url": "http://kibana:5601", "ml_enabled": false }"#,
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.kibana_url.as_deref(), Some("http://kibana:5601"));
        assert!(!config.ml_enabled);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_unparsable_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"{ elasticsearch_url").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ServiceMapError::Config(_))
        ));
    }

    #[test]
    fn test_password_not_serialized() {
        let config = Config {
            password: Some("secret".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
