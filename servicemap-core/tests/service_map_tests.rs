// Tests for service map assembly against an in-memory backend

use async_trait::async_trait;
use serde_json::{Value, json};
use servicemap_client::error::Result as ClientResult;
use servicemap_client::{
    ClientError, MlCapabilities, MlClient, MlJob, SearchClient, SearchRequest, SearchResponse,
};
use servicemap_core::model::TimeRange;
use servicemap_core::{
    Config, ServiceMapError, ServiceMapRequest, ServiceMapService, TraceSampleCursor,
    collect_service_map,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ============================================================================
// Fake backend
// ============================================================================

#[derive(Default)]
struct FakeSearch {
    /// Composite pages keyed by the `after` key they answer (`None` = first page).
    pages: Vec<(Option<Value>, Value)>,
    documents: HashMap<String, Vec<Value>>,
    services: Vec<(&'static str, &'static str)>,
    failing_trace: Option<String>,
    requests: Mutex<Vec<SearchRequest>>,
}

impl FakeSearch {
    fn event_queries(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|request| requested_trace_ids(&request.body))
            .collect()
    }
}

fn requested_trace_ids(body: &Value) -> Option<Vec<String>> {
    let ids = body["query"]["bool"]["filter"][0]["terms"]["trace.id"].as_array()?;
    Some(
        ids.iter()
            .filter_map(|id| id.as_str().map(String::from))
            .collect(),
    )
}

fn response(value: Value) -> ClientResult<SearchResponse> {
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl SearchClient for FakeSearch {
    async fn search(&self, request: SearchRequest) -> ClientResult<SearchResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let body = &request.body;

        if let Some(composite) = body["aggs"]["connections"]["composite"].as_object() {
            let after = composite.get("after").cloned();
            let page = self
                .pages
                .iter()
                .find(|(key, _)| *key == after)
                .map(|(_, page)| page.clone())
                .unwrap_or_else(|| json!({ "buckets": [] }));
            return response(json!({ "aggregations": { "connections": page } }));
        }

        if body["aggs"]["services"].is_object() {
            let buckets: Vec<Value> = self
                .services
                .iter()
                .map(|(name, agent)| {
                    json!({ "key": name, "agent_name": { "buckets": [{ "key": agent }] } })
                })
                .collect();
            return response(json!({ "aggregations": { "services": { "buckets": buckets } } }));
        }

        let trace_ids = requested_trace_ids(body).unwrap_or_default();
        if let Some(failing) = &self.failing_trace
            && trace_ids.contains(failing)
        {
            return Err(ClientError::StatusError {
                status: 500,
                body: "search_phase_execution_exception".into(),
            });
        }
        let hits: Vec<Value> = trace_ids
            .iter()
            .flat_map(|id| self.documents.get(id).cloned().unwrap_or_default())
            .map(|source| json!({ "_source": source }))
            .collect();
        response(json!({ "hits": { "hits": hits } }))
    }
}

struct UnlicensedMl;

#[async_trait]
impl MlClient for UnlicensedMl {
    async fn capabilities(&self) -> ClientResult<MlCapabilities> {
        Ok(MlCapabilities {
            enabled: true,
            licensed: false,
        })
    }

    async fn jobs_by_group(&self, _group: &str) -> ClientResult<Vec<MlJob>> {
        panic!("jobs must not be listed without a license");
    }

    async fn search(&self, _body: Value) -> ClientResult<SearchResponse> {
        panic!("scores must not be queried without a license");
    }
}

struct ScoredMl;

#[async_trait]
impl MlClient for ScoredMl {
    async fn capabilities(&self) -> ClientResult<MlCapabilities> {
        Ok(MlCapabilities {
            enabled: true,
            licensed: true,
        })
    }

    async fn jobs_by_group(&self, group: &str) -> ClientResult<Vec<MlJob>> {
        assert_eq!(group, "apm");
        Ok(vec![MlJob {
            job_id: "svc-b-request-high_mean_response_time".into(),
            groups: vec!["apm".into(), "svc-b".into(), "request".into()],
        }])
    }

    async fn search(&self, _body: Value) -> ClientResult<SearchResponse> {
        response(json!({
            "aggregations": {
                "jobs": {
                    "buckets": [{
                        "key": "svc-b-request-high_mean_response_time",
                        "top_score_hits": { "hits": { "hits": [{
                            "_source": { "anomaly_score": 42.0, "timestamp": 1_600_000_000_000i64 }
                        }] } }
                    }]
                }
            }
        }))
    }
}

/// Licensed ML whose APM jobs carry the given groups.
struct GroupedJobsMl(Vec<&'static str>);

#[async_trait]
impl MlClient for GroupedJobsMl {
    async fn capabilities(&self) -> ClientResult<MlCapabilities> {
        Ok(MlCapabilities {
            enabled: true,
            licensed: true,
        })
    }

    async fn jobs_by_group(&self, _group: &str) -> ClientResult<Vec<MlJob>> {
        Ok(vec![MlJob {
            job_id: "apm-job".into(),
            groups: self.0.iter().map(|g| g.to_string()).collect(),
        }])
    }

    async fn search(&self, _body: Value) -> ClientResult<SearchResponse> {
        panic!("scores must not be queried for malformed jobs");
    }
}

// ============================================================================
// Trace fixtures
// ============================================================================

fn transaction(trace: &str, id: &str, parent: Option<&str>, service: &str) -> Value {
    let mut doc = json!({
        "trace": { "id": trace },
        "transaction": { "id": id },
        "service": { "name": service },
        "agent": { "name": "java" }
    });
    if let Some(parent) = parent {
        doc["parent"] = json!({ "id": parent });
    }
    doc
}

fn exit_span(trace: &str, id: &str, parent: &str, service: &str, address: &str) -> Value {
    json!({
        "trace": { "id": trace },
        "span": { "id": id, "type": "external", "subtype": "http" },
        "parent": { "id": parent },
        "service": { "name": service },
        "agent": { "name": "java" },
        "destination": { "address": address }
    })
}

fn bucket(trace_ids: &[&str]) -> Value {
    let buckets: Vec<Value> = trace_ids.iter().map(|id| json!({ "key": id })).collect();
    json!({ "sample_documents": { "buckets": buckets } })
}

/// svc-a calls svc-b directly and svc-c through a load balancer address.
fn three_service_trace(trace: &str) -> Vec<Value> {
    vec![
        transaction(trace, "tx-a", None, "svc-a"),
        exit_span(trace, "span-b", "tx-a", "svc-a", "svc-b:8080"),
        transaction(trace, "tx-b", Some("span-b"), "svc-b"),
        exit_span(trace, "span-c", "tx-a", "svc-a", "lb-c:80"),
        transaction(trace, "tx-c", Some("span-c"), "svc-c"),
    ]
}

fn request() -> ServiceMapRequest {
    ServiceMapRequest {
        time_range: TimeRange::new(1_600_000_000_000, 1_600_003_600_000),
        ..Default::default()
    }
}

fn service_for(backend: Arc<FakeSearch>, ml: Option<Arc<dyn MlClient>>, chunk: usize) -> ServiceMapService {
    let mut config = Config::default();
    config.service_map.max_traces_per_request = chunk;
    ServiceMapService::new(backend, ml, &config)
}

fn ids<T>(items: &[T], id: impl Fn(&T) -> &str) -> Vec<String> {
    items.iter().map(|item| id(item).to_string()).collect()
}

// ============================================================================
// Assembly
// ============================================================================

#[tokio::test]
async fn test_external_destinations_resolve_to_services() {
    let backend = Arc::new(FakeSearch {
        pages: vec![(None, json!({ "buckets": [bucket(&["t1"])] }))],
        documents: HashMap::from([("t1".to_string(), three_service_trace("t1"))]),
        services: vec![("svc-a", "java"), ("svc-b", "go"), ("svc-c", "python")],
        ..Default::default()
    });
    let service = service_for(backend, None, 50);

    let graph = service.get_service_map(&request()).await.unwrap();

    assert_eq!(
        ids(&graph.nodes, |n| n.data.id.as_str()),
        vec!["svc-a", "svc-b", "svc-c"]
    );
    assert_eq!(
        ids(&graph.edges, |e| e.data.id.as_str()),
        vec!["svc-a~svc-b", "svc-a~svc-c"]
    );
    assert!(graph.edges.iter().all(|e| e.data.source != e.data.target));

    let agent = graph.node("svc-b").unwrap().node.as_service().unwrap();
    assert_eq!(agent.agent_name, "go");
}

#[tokio::test]
async fn test_first_page_without_after_key_returns_top() {
    let backend = Arc::new(FakeSearch {
        pages: vec![(None, json!({ "buckets": [bucket(&["t1"])] }))],
        documents: HashMap::from([("t1".to_string(), three_service_trace("t1"))]),
        ..Default::default()
    });
    let service = service_for(backend, None, 50);

    let graph = service.get_service_map(&request()).await.unwrap();

    assert_eq!(graph.after, Some(TraceSampleCursor::Top));
}

#[tokio::test]
async fn test_traces_split_into_chunks() {
    let backend = Arc::new(FakeSearch {
        pages: vec![(None, json!({ "buckets": [bucket(&["t1", "t2", "t3"])] }))],
        documents: HashMap::from([
            ("t1".to_string(), three_service_trace("t1")),
            ("t2".to_string(), three_service_trace("t2")),
            ("t3".to_string(), three_service_trace("t3")),
        ]),
        ..Default::default()
    });
    let service = service_for(backend.clone(), None, 2);

    let graph = service.get_service_map(&request()).await.unwrap();

    let mut queries = backend.event_queries();
    queries.sort();
    assert_eq!(queries, vec![vec!["t1", "t2"], vec!["t3"]]);
    assert_eq!(graph.edges.len(), 2);
}

#[tokio::test]
async fn test_chunk_failure_fails_the_call() {
    let backend = Arc::new(FakeSearch {
        pages: vec![(None, json!({ "buckets": [bucket(&["t1", "t2"])] }))],
        documents: HashMap::from([("t1".to_string(), three_service_trace("t1"))]),
        failing_trace: Some("t2".into()),
        ..Default::default()
    });
    let service = service_for(backend, None, 1);

    let err = service.get_service_map(&request()).await.unwrap_err();

    assert!(matches!(err, ServiceMapError::QueryFailure(_)));
}

#[tokio::test]
async fn test_unlicensed_ml_leaves_nodes_unscored() {
    let backend = Arc::new(FakeSearch {
        pages: vec![(None, json!({ "buckets": [bucket(&["t1"])] }))],
        documents: HashMap::from([("t1".to_string(), three_service_trace("t1"))]),
        ..Default::default()
    });
    let service = service_for(backend, Some(Arc::new(UnlicensedMl)), 50);

    let graph = service.get_service_map(&request()).await.unwrap();

    assert!(graph.nodes.iter().all(|n| n.data.service_anomaly_stats.is_none()));
}

#[tokio::test]
async fn test_anomaly_scores_attached() {
    let backend = Arc::new(FakeSearch {
        pages: vec![(None, json!({ "buckets": [bucket(&["t1"])] }))],
        documents: HashMap::from([("t1".to_string(), three_service_trace("t1"))]),
        ..Default::default()
    });
    let service = service_for(backend, Some(Arc::new(ScoredMl)), 50);

    let graph = service.get_service_map(&request()).await.unwrap();

    let stats = graph
        .node("svc-b")
        .unwrap()
        .service_anomaly_stats
        .as_ref()
        .unwrap();
    assert_eq!(stats.anomaly_score, Some(42.0));
    assert!(graph.node("svc-a").unwrap().service_anomaly_stats.is_none());

    let json = serde_json::to_value(&graph).unwrap();
    let node = json["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["data"]["id"] == "svc-b")
        .unwrap();
    assert_eq!(node["data"]["serviceAnomalyStats"]["transactionType"], "request");
}

#[tokio::test]
async fn test_malformed_job_groups_fail_the_map() {
    let backend = Arc::new(FakeSearch {
        pages: vec![(None, json!({ "buckets": [bucket(&["t1"])] }))],
        documents: HashMap::from([("t1".to_string(), three_service_trace("t1"))]),
        ..Default::default()
    });
    let service = service_for(backend, Some(Arc::new(GroupedJobsMl(vec!["apm", "foo"]))), 50);

    let err = service.get_service_map(&request()).await.unwrap_err();

    assert!(matches!(err, ServiceMapError::MalformedJobMetadata { .. }));
}

#[tokio::test]
async fn test_job_for_filtered_out_service_fails_the_map() {
    let backend = Arc::new(FakeSearch {
        pages: vec![(None, json!({ "buckets": [bucket(&["t1"])] }))],
        documents: HashMap::from([(
            "t1".to_string(),
            vec![
                transaction("t1", "tx-a", None, "svc-a"),
                exit_span("t1", "span-db", "tx-a", "svc-a", "postgresql:5432"),
            ],
        )]),
        services: vec![("svc-a", "java")],
        ..Default::default()
    });
    let service = service_for(
        backend,
        Some(Arc::new(GroupedJobsMl(vec!["apm", "svc-z", "request"]))),
        50,
    );
    let request = ServiceMapRequest {
        service_name: Some("svc-a".into()),
        ..request()
    };

    let err = service.get_service_map(&request).await.unwrap_err();

    assert!(matches!(err, ServiceMapError::MalformedJobMetadata { .. }));
}

// ============================================================================
// Paging
// ============================================================================

#[tokio::test]
async fn test_second_page_skips_traces_seen_on_first() {
    let after_key = json!({ "service.name": "svc-a" });
    let backend = Arc::new(FakeSearch {
        pages: vec![
            (
                None,
                json!({ "after_key": after_key, "buckets": [bucket(&["t1", "t2"])] }),
            ),
            (Some(after_key.clone()), json!({ "buckets": [bucket(&["t2", "t3"])] })),
        ],
        documents: HashMap::from([
            ("t1".to_string(), three_service_trace("t1")),
            ("t2".to_string(), three_service_trace("t2")),
            ("t3".to_string(), three_service_trace("t3")),
        ]),
        ..Default::default()
    });
    let service = service_for(backend.clone(), None, 50);

    let graph = collect_service_map(&service, request(), 5).await.unwrap();

    assert_eq!(backend.event_queries(), vec![vec!["t1", "t2"], vec!["t3"]]);
    assert_eq!(graph.after, None);
    assert_eq!(graph.nodes.len(), 3);
}

#[tokio::test]
async fn test_paging_stops_at_max_requests() {
    let first_key = json!({ "service.name": "a" });
    let second_key = json!({ "service.name": "b" });
    let backend = Arc::new(FakeSearch {
        pages: vec![
            (None, json!({ "after_key": first_key, "buckets": [bucket(&["t1"])] })),
            (
                Some(first_key.clone()),
                json!({ "after_key": second_key, "buckets": [bucket(&["t2"])] }),
            ),
        ],
        ..Default::default()
    });
    let service = service_for(backend.clone(), None, 50);

    let graph = collect_service_map(&service, request(), 2).await.unwrap();

    assert_eq!(backend.event_queries().len(), 2);
    assert_eq!(
        graph.after,
        Some(TraceSampleCursor::from_after_key(&second_key).unwrap())
    );
}

#[tokio::test]
async fn test_destination_learned_on_later_page_resolves_earlier_pages() {
    let after_key = json!({ "service.name": "svc-a" });
    let backend = Arc::new(FakeSearch {
        pages: vec![
            (
                None,
                json!({ "after_key": after_key, "buckets": [bucket(&["t1"])] }),
            ),
            (Some(after_key.clone()), json!({ "buckets": [bucket(&["t2"])] })),
        ],
        documents: HashMap::from([
            (
                "t1".to_string(),
                vec![
                    transaction("t1", "tx-a", None, "svc-a"),
                    exit_span("t1", "span-c", "tx-a", "svc-a", "lb-c:80"),
                ],
            ),
            (
                "t2".to_string(),
                vec![
                    transaction("t2", "tx-a", None, "svc-a"),
                    exit_span("t2", "span-c", "tx-a", "svc-a", "lb-c:80"),
                    transaction("t2", "tx-c", Some("span-c"), "svc-c"),
                ],
            ),
        ]),
        ..Default::default()
    });
    let service = service_for(backend, None, 50);

    let first = service.get_service_map(&request()).await.unwrap();
    assert!(first.node("lb-c:80").is_some());

    let graph = collect_service_map(&service, request(), 5).await.unwrap();

    assert_eq!(ids(&graph.nodes, |n| n.data.id.as_str()), vec!["svc-a", "svc-c"]);
    assert_eq!(ids(&graph.edges, |e| e.data.id.as_str()), vec!["svc-a~svc-c"]);
}
