//! Anomaly detection scores.
//!
//! APM anomaly detection jobs are attributed to a service and a transaction
//! type through their group names. The joiner validates that attribution, then
//! fetches the single highest-scoring result bucket per job in the window.

use crate::error::{Result, ServiceMapError};
use crate::model::{TimeRange, term_filter, terms_filter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use servicemap_client::{MlClient, MlJob};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub const ML_GROUP_NAME_APM: &str = "apm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyDetectionJobCategory {
    pub job_id: String,
    pub service_name: String,
    pub transaction_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyScore {
    pub job_id: String,
    pub anomaly_score: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Anomalies {
    pub job_categories: Vec<AnomalyDetectionJobCategory>,
    pub scores: Vec<AnomalyScore>,
}

/// A job category with its top score, when one exists in range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAnomaly {
    pub job_id: String,
    pub service_name: String,
    pub transaction_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct AnomaliesRequest {
    pub service_names: Vec<String>,
    pub time_range: TimeRange,
}

#[derive(Debug, Default, Deserialize)]
struct JobsAggregation {
    #[serde(default)]
    buckets: Vec<JobBucket>,
}

#[derive(Debug, Deserialize)]
struct JobBucket {
    key: String,
    #[serde(default)]
    top_score_hits: TopHits,
}

#[derive(Debug, Default, Deserialize)]
struct TopHits {
    #[serde(default)]
    hits: TopHitsInner,
}

#[derive(Debug, Default, Deserialize)]
struct TopHitsInner {
    #[serde(default)]
    hits: Vec<TopHit>,
}

#[derive(Debug, Deserialize)]
struct TopHit {
    #[serde(rename = "_source")]
    source: ScoreSource,
}

#[derive(Debug, Deserialize)]
struct ScoreSource {
    anomaly_score: f64,
    timestamp: i64,
}

/// Derive the service/transaction type a job belongs to from its groups.
///
/// The groups must be `apm` plus exactly two others, one of which is a known
/// service name. Anything else cannot be attributed unambiguously.
pub fn job_category(
    job: &MlJob,
    known_service_names: &HashSet<&str>,
) -> Result<AnomalyDetectionJobCategory> {
    let others: Vec<&String> = job
        .groups
        .iter()
        .filter(|group| group.as_str() != ML_GROUP_NAME_APM)
        .collect();

    if others.len() == job.groups.len() {
        return Err(ServiceMapError::malformed_job(
            &job.job_id,
            "missing \"apm\" group",
        ));
    }
    if job.groups.len() != 3 || others.len() != 2 {
        return Err(ServiceMapError::malformed_job(
            &job.job_id,
            format!(
                "expected \"apm\" plus a service name and a transaction type, found groups {:?}",
                job.groups
            ),
        ));
    }

    let services: Vec<&&String> = others
        .iter()
        .filter(|group| known_service_names.contains(group.as_str()))
        .collect();
    let service_name = match services.as_slice() {
        [service] => (**service).clone(),
        [] => {
            return Err(ServiceMapError::malformed_job(
                &job.job_id,
                "no group matches a known service name",
            ));
        }
        _ => {
            return Err(ServiceMapError::malformed_job(
                &job.job_id,
                "more than one group matches a known service name",
            ));
        }
    };

    let transaction_type = others
        .iter()
        .find(|group| ***group != service_name)
        .map(|group| (*group).clone())
        .ok_or_else(|| ServiceMapError::malformed_job(&job.job_id, "missing transaction type group"))?;

    Ok(AnomalyDetectionJobCategory {
        job_id: job.job_id.clone(),
        service_name,
        transaction_type,
    })
}

/// Every category, with score fields filled in where a score exists.
pub fn left_join(
    categories: &[AnomalyDetectionJobCategory],
    scores: &[AnomalyScore],
) -> Vec<ServiceAnomaly> {
    let by_job: HashMap<&str, &AnomalyScore> =
        scores.iter().map(|s| (s.job_id.as_str(), s)).collect();

    categories
        .iter()
        .map(|category| {
            let score = by_job.get(category.job_id.as_str());
            ServiceAnomaly {
                job_id: category.job_id.clone(),
                service_name: category.service_name.clone(),
                transaction_type: category.transaction_type.clone(),
                anomaly_score: score.map(|s| s.anomaly_score),
                timestamp: score.map(|s| s.timestamp),
            }
        })
        .collect()
}

/// Pick one anomaly row per service: scored rows beat unscored ones, higher
/// scores beat lower ones, ties go to the smaller job id.
pub fn best_by_service(rows: &[ServiceAnomaly]) -> HashMap<String, ServiceAnomaly> {
    let mut best: HashMap<String, ServiceAnomaly> = HashMap::new();
    for row in rows {
        match best.get(&row.service_name) {
            Some(current) if !outranks(row, current) => {}
            _ => {
                best.insert(row.service_name.clone(), row.clone());
            }
        }
    }
    best
}

fn outranks(candidate: &ServiceAnomaly, current: &ServiceAnomaly) -> bool {
    match (candidate.anomaly_score, current.anomaly_score) {
        (Some(a), Some(b)) if a != b => a > b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        _ => candidate.job_id < current.job_id,
    }
}

pub struct AnomalyJoiner {
    ml: Option<Arc<dyn MlClient>>,
}

impl AnomalyJoiner {
    pub fn new(ml: Option<Arc<dyn MlClient>>) -> Self {
        Self { ml }
    }

    /// `None` when anomaly detection is not configured, disabled or unlicensed.
    ///
    /// Every APM job must name one of `request.service_names`, otherwise the
    /// call fails with [`ServiceMapError::MalformedJobMetadata`]. Callers
    /// building those names from a service-filtered inventory will see this
    /// error whenever a job exists for a service outside the filter.
    pub async fn get_anomalies(&self, request: &AnomaliesRequest) -> Result<Option<Anomalies>> {
        let Some(ml) = &self.ml else {
            return Ok(None);
        };

        let capabilities = ml.capabilities().await?;
        if !capabilities.is_available() {
            warn!("Anomaly detection is not available (enabled: {}, licensed: {})",
                capabilities.enabled, capabilities.licensed);
            return Ok(None);
        }

        let jobs = ml.jobs_by_group(ML_GROUP_NAME_APM).await?;
        let known: HashSet<&str> = request.service_names.iter().map(String::as_str).collect();
        let job_categories = jobs
            .iter()
            .map(|job| job_category(job, &known))
            .collect::<Result<Vec<_>>>()?;

        if job_categories.is_empty() {
            debug!("No APM anomaly detection jobs");
            return Ok(Some(Anomalies::default()));
        }

        let job_ids: Vec<String> = job_categories.iter().map(|c| c.job_id.clone()).collect();
        let response = ml
            .search(build_scores_query(&job_ids, &request.time_range))
            .await?;
        let jobs: JobsAggregation = response.aggregation("jobs")?.unwrap_or_default();

        let scores: Vec<AnomalyScore> = jobs
            .buckets
            .into_iter()
            .filter_map(|bucket| {
                let hit = bucket.top_score_hits.hits.hits.into_iter().next()?;
                Some(AnomalyScore {
                    job_id: bucket.key,
                    anomaly_score: hit.source.anomaly_score,
                    timestamp: hit.source.timestamp,
                })
            })
            .collect();
        debug!("{} of {} jobs have scores in range", scores.len(), job_categories.len());

        Ok(Some(Anomalies {
            job_categories,
            scores,
        }))
    }
}

pub fn build_scores_query(job_ids: &[String], time_range: &TimeRange) -> Value {
    json!({
        "size": 0,
        "query": {
            "bool": {
                "filter": [
                    term_filter("result_type", "bucket"),
                    terms_filter("job_id", job_ids),
                    time_range.range_filter("timestamp")
                ]
            }
        },
        "aggs": {
            "jobs": {
                "terms": { "field": "job_id", "size": job_ids.len() },
                "aggs": {
                    "top_score_hits": {
                        "top_hits": {
                            "sort": [{ "anomaly_score": { "order": "desc" } }],
                            "_source": ["anomaly_score", "timestamp"],
                            "size": 1
                        }
                    }
                }
            }
        }
    })
}
