//! Trace sampling.
//!
//! One composite aggregation page groups spans and sampled transactions by the
//! seven dimensions that distinguish a connection. Each bucket contributes its
//! candidate trace ids so every kind of connection gets at least one trace
//! inspected.

use crate::cursor::TraceSampleCursor;
use crate::error::Result;
use crate::model::{
    DESTINATION_ADDRESS, PROCESSOR_EVENT, SERVICE_ENVIRONMENT, SERVICE_NAME, SPAN_SUBTYPE,
    SPAN_TYPE, TIMESTAMP, TRACE_ID, TRANSACTION_NAME, TRANSACTION_SAMPLED, TRANSACTION_TYPE,
    TimeRange, term_filter,
};
use serde::Deserialize;
use serde_json::{Value, json};
use servicemap_client::{SearchClient, SearchRequest};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const MAX_TRACES_TO_INSPECT: usize = 1000;
pub const COMPOSITE_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct SampleRequest {
    pub after: Option<TraceSampleCursor>,
    pub service_name: Option<String>,
    pub environment: Option<String>,
    /// Extra filter clauses in query DSL, ANDed into the query.
    pub filters: Vec<Value>,
    pub time_range: TimeRange,
    /// Trace ids already inspected on earlier pages.
    pub exclude_trace_ids: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceSample {
    pub after: Option<TraceSampleCursor>,
    pub trace_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompositeAggregation {
    #[serde(default)]
    after_key: Option<Value>,
    #[serde(default)]
    buckets: Vec<CompositeBucket>,
}

#[derive(Debug, Default, Deserialize)]
struct CompositeBucket {
    #[serde(default)]
    sample_documents: TermsAggregation,
}

#[derive(Debug, Default, Deserialize)]
struct TermsAggregation {
    #[serde(default)]
    buckets: Vec<TermsBucket>,
}

#[derive(Debug, Deserialize)]
struct TermsBucket {
    key: Value,
}

impl TermsBucket {
    fn key_string(&self) -> Option<String> {
        match &self.key {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

pub struct TraceSampler {
    client: Arc<dyn SearchClient>,
    indices: Vec<String>,
}

impl TraceSampler {
    pub fn new(client: Arc<dyn SearchClient>, indices: Vec<String>) -> Self {
        Self { client, indices }
    }

    pub async fn sample(&self, request: &SampleRequest) -> Result<TraceSample> {
        let after_key = match &request.after {
            Some(cursor) => cursor.after_key()?,
            None => None,
        };

        let body = build_sample_query(request, after_key);
        let response = self
            .client
            .search(SearchRequest::new(self.indices.clone(), body))
            .await?;

        let composite: CompositeAggregation =
            response.aggregation("connections")?.unwrap_or_default();

        let after = next_cursor(request.after.is_none(), composite.after_key.as_ref())?;

        let ranked: Vec<Vec<String>> = composite
            .buckets
            .iter()
            .map(|bucket| {
                bucket
                    .sample_documents
                    .buckets
                    .iter()
                    .filter_map(TermsBucket::key_string)
                    .collect()
            })
            .collect();

        let trace_ids = select_trace_ids(&ranked, &request.exclude_trace_ids, MAX_TRACES_TO_INSPECT);
        debug!(
            "Sampled {} trace ids from {} composite buckets",
            trace_ids.len(),
            ranked.len()
        );

        Ok(TraceSample { after, trace_ids })
    }
}

/// First pages always report a cursor so callers can tell "nothing fetched yet"
/// from "last page reached".
fn next_cursor(first_page: bool, after_key: Option<&Value>) -> Result<Option<TraceSampleCursor>> {
    match after_key {
        Some(key) if !key.is_null() => Ok(Some(TraceSampleCursor::from_after_key(key)?)),
        _ if first_page => Ok(Some(TraceSampleCursor::Top)),
        _ => Ok(None),
    }
}

/// Rank candidates by their position within their bucket, keep the first
/// occurrence of each id and cap the result.
pub fn select_trace_ids(
    ranked_buckets: &[Vec<String>],
    exclude: &HashSet<String>,
    limit: usize,
) -> Vec<String> {
    let mut candidates: Vec<(usize, &String)> = ranked_buckets
        .iter()
        .flat_map(|bucket| bucket.iter().enumerate())
        .collect();
    // stable: equal priorities keep bucket order
    candidates.sort_by_key(|(priority, _)| *priority);

    let mut seen: HashSet<&str> = HashSet::new();
    candidates
        .into_iter()
        .map(|(_, trace_id)| trace_id)
        .filter(|trace_id| !exclude.contains(trace_id.as_str()))
        .filter(|trace_id| seen.insert(trace_id.as_str()))
        .take(limit)
        .cloned()
        .collect()
}

pub fn build_sample_query(request: &SampleRequest, after_key: Option<Value>) -> Value {
    let mut filter = vec![
        json!({
            "bool": {
                "should": [
                    term_filter(PROCESSOR_EVENT, "span"),
                    { "bool": { "filter": [
                        term_filter(PROCESSOR_EVENT, "transaction"),
                        term_filter(TRANSACTION_SAMPLED, true)
                    ] } }
                ],
                "minimum_should_match": 1
            }
        }),
        request.time_range.range_filter(TIMESTAMP),
    ];
    filter.extend(request.filters.iter().cloned());

    if let Some(service_name) = &request.service_name {
        filter.push(term_filter(SERVICE_NAME, service_name.as_str()));
    }
    if let Some(environment) = &request.environment {
        filter.push(term_filter(SERVICE_ENVIRONMENT, environment.as_str()));
    }

    let source = |field: &str, missing_bucket: bool| {
        json!({ field: { "terms": { "field": field, "missing_bucket": missing_bucket } } })
    };

    let mut composite = json!({
        "size": COMPOSITE_PAGE_SIZE,
        "sources": [
            source(SERVICE_NAME, false),
            source(SERVICE_ENVIRONMENT, true),
            source(TRANSACTION_TYPE, true),
            source(TRANSACTION_NAME, true),
            source(SPAN_TYPE, true),
            source(SPAN_SUBTYPE, true),
            source(DESTINATION_ADDRESS, false)
        ]
    });
    if let Some(key) = after_key {
        composite["after"] = key;
    }

    json!({
        "size": 0,
        "query": { "bool": { "filter": filter } },
        "aggs": {
            "connections": {
                "composite": composite,
                "aggs": {
                    "sample_documents": {
                        "terms": {
                            "field": TRACE_ID,
                            "execution_hint": "map",
                            // pseudo-random across traces, independent of trace size
                            "order": { "_key": "desc" }
                        }
                    }
                }
            }
        }
    })
}
