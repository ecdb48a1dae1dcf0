use servicemap_client::ClientError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceMapError {
    /// The backing store was unreachable, timed out or rejected the query.
    #[error("Query failed: {0}")]
    QueryFailure(#[from] ClientError),

    /// An anomaly detection job cannot be attributed to exactly one service.
    #[error("Malformed ML job {job_id}: {reason}")]
    MalformedJobMetadata { job_id: String, reason: String },

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ServiceMapError {
    pub fn malformed_job(job_id: &str, reason: impl Into<String>) -> Self {
        ServiceMapError::MalformedJobMetadata {
            job_id: job_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ServiceMapError {
    fn from(e: serde_json::Error) -> Self {
        ServiceMapError::UnexpectedResponse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceMapError>;
