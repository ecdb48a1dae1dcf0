use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

// Document field names
pub const PROCESSOR_EVENT: &str = "processor.event";
pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_ENVIRONMENT: &str = "service.environment";
pub const AGENT_NAME: &str = "agent.name";
pub const TRANSACTION_TYPE: &str = "transaction.type";
pub const TRANSACTION_NAME: &str = "transaction.name";
pub const TRANSACTION_SAMPLED: &str = "transaction.sampled";
pub const SPAN_TYPE: &str = "span.type";
pub const SPAN_SUBTYPE: &str = "span.subtype";
pub const DESTINATION_ADDRESS: &str = "destination.address";
pub const TRACE_ID: &str = "trace.id";
pub const TIMESTAMP: &str = "@timestamp";

/// A service emitting transactions and spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceNode {
    #[serde(rename = "service.name")]
    pub service_name: String,
    #[serde(rename = "agent.name", default)]
    pub agent_name: String,
    #[serde(
        rename = "service.environment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub environment: Option<String>,
}

impl ServiceNode {
    pub fn new(service_name: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            agent_name: agent_name.into(),
            environment: None,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

/// The far end of an exit span: a database, queue or uninstrumented HTTP host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalNode {
    #[serde(rename = "destination.address")]
    pub destination_address: String,
    #[serde(rename = "span.type", default)]
    pub span_type: String,
    #[serde(rename = "span.subtype", default)]
    pub span_subtype: String,
}

impl ExternalNode {
    pub fn new(
        destination_address: impl Into<String>,
        span_type: impl Into<String>,
        span_subtype: impl Into<String>,
    ) -> Self {
        Self {
            destination_address: destination_address.into(),
            span_type: span_type.into(),
            span_subtype: span_subtype.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionNode {
    Service(ServiceNode),
    External(ExternalNode),
}

impl ConnectionNode {
    pub fn as_service(&self) -> Option<&ServiceNode> {
        match self {
            ConnectionNode::Service(service) => Some(service),
            ConnectionNode::External(_) => None,
        }
    }
}

impl From<ServiceNode> for ConnectionNode {
    fn from(node: ServiceNode) -> Self {
        ConnectionNode::Service(node)
    }
}

impl From<ExternalNode> for ConnectionNode {
    fn from(node: ExternalNode) -> Self {
        ConnectionNode::External(node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Connection {
    pub source: ConnectionNode,
    pub destination: ConnectionNode,
}

impl Connection {
    pub fn new(source: impl Into<ConnectionNode>, destination: impl Into<ConnectionNode>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// Destination address to the node that actually answers on it.
pub type DestinationMap = HashMap<String, ConnectionNode>;

/// Query window in epoch milliseconds, inclusive on both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Window of `duration_ms` ending at `end`.
    pub fn ending_at(end: i64, duration_ms: i64) -> Self {
        Self {
            start: end.saturating_sub(duration_ms),
            end,
        }
    }

    pub fn range_filter(&self, field: &str) -> Value {
        json!({
            "range": {
                field: {
                    "gte": self.start,
                    "lte": self.end,
                    "format": "epoch_millis"
                }
            }
        })
    }
}

pub fn term_filter(field: &str, value: impl Into<Value>) -> Value {
    json!({ "term": { field: value.into() } })
}

pub fn terms_filter(field: &str, values: &[String]) -> Value {
    json!({ "terms": { field: values } })
}
