use crate::error::Result;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use servicemap_client::AlertsClient;
use tracing::debug;

pub const APM_ALERTS_CONSUMER: &str = "apm";

/// Alerting status of one alert rule attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAlert {
    pub id: String,
    #[serde(rename = "service.name", default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(
        rename = "service.environment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub environment: Option<String>,
    #[serde(rename = "hasAlertViolations")]
    pub has_alert_violations: bool,
}

/// Alerts registered for APM services. No alerting client means no alerts.
pub async fn get_service_alerts(client: Option<&dyn AlertsClient>) -> Result<Vec<ServiceAlert>> {
    let Some(client) = client else {
        return Ok(Vec::new());
    };

    let alerts = client.find_alerts(APM_ALERTS_CONSUMER).await?;
    let states = try_join_all(alerts.iter().map(|alert| client.alert_state(&alert.id))).await?;
    debug!("Fetched state for {} alerts", states.len());

    Ok(alerts
        .into_iter()
        .zip(states)
        .map(|(alert, state)| ServiceAlert {
            has_alert_violations: state.has_violations(),
            id: alert.id,
            service_name: alert.params.service_name,
            environment: alert.params.environment,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use servicemap_client::{AlertParams, AlertState, AlertSummary, ClientError};

    struct FakeAlerts;

    #[async_trait]
    impl AlertsClient for FakeAlerts {
        async fn find_alerts(
            &self,
            consumer: &str,
        ) -> servicemap_client::error::Result<Vec<AlertSummary>> {
            assert_eq!(consumer, "apm");
            Ok(vec![
                AlertSummary {
                    id: "firing".into(),
                    params: AlertParams {
                        service_name: Some("opbeans-java".into()),
                        environment: Some("production".into()),
                    },
                },
                AlertSummary {
                    id: "quiet".into(),
                    params: AlertParams::default(),
                },
            ])
        }

        async fn alert_state(&self, id: &str) -> servicemap_client::error::Result<AlertState> {
            match id {
                "firing" => Ok(serde_json::from_value(json!({
                    "alertInstances": { "opbeans-java": {} }
                }))?),
                "quiet" => Ok(AlertState::default()),
                other => Err(ClientError::Other(format!("unknown alert {other}"))),
            }
        }
    }

    #[tokio::test]
    async fn test_no_client_means_no_alerts() {
        assert!(get_service_alerts(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_violations_reported_per_alert() {
        let alerts = get_service_alerts(Some(&FakeAlerts as &dyn AlertsClient)).await.unwrap();

        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].id, "firing");
        assert!(alerts[0].has_alert_violations);
        assert_eq!(alerts[0].service_name.as_deref(), Some("opbeans-java"));
        assert!(!alerts[1].has_alert_violations);

        let value = serde_json::to_value(&alerts[0]).unwrap();
        assert_eq!(value["service.name"], "opbeans-java");
        assert_eq!(value["hasAlertViolations"], true);
    }
}
