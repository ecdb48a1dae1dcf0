use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::Value;
use servicemap_client::{AlertsClient, ElasticsearchClient, KibanaAlertsClient, MlClient};
use servicemap_core::alerts::get_service_alerts;
use servicemap_core::model::TimeRange;
use servicemap_core::{
    Config, ServiceMapGraph, ServiceMapRequest, ServiceMapService, TraceSampleCursor,
    collect_service_map,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SERVICEMAP_LOG";

/// Install the stderr log subscriber. `SERVICEMAP_LOG` wins over `-v`.
pub fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// Helper functions for the map handler

/// Parse a point in time given as epoch milliseconds or RFC 3339.
pub fn parse_time(value: &str) -> Result<i64> {
    let value = value.trim();
    if let Ok(millis) = value.parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|e| anyhow!("invalid time '{}': {}", value, e))
}

/// Parse a `--filter` argument. Must be a JSON object (one query DSL clause).
pub fn parse_filter(value: &str) -> Result<Value> {
    let filter: Value =
        serde_json::from_str(value).with_context(|| format!("invalid filter JSON '{}'", value))?;
    if !filter.is_object() {
        bail!("filter must be a JSON object, got '{}'", value);
    }
    Ok(filter)
}

/// Query window from optional bounds. A missing end means `now_ms`; a missing
/// start means `window_ms` before the end.
pub fn resolve_time_range(
    start: Option<&str>,
    end: Option<&str>,
    now_ms: i64,
    window_ms: i64,
) -> Result<TimeRange> {
    let end = end.map(parse_time).transpose()?.unwrap_or(now_ms);
    let start = start
        .map(parse_time)
        .transpose()?
        .unwrap_or(end - window_ms);

    if start > end {
        bail!("start ({}) is after end ({})", start, end);
    }
    Ok(TimeRange::new(start, end))
}

pub fn map_request_from_args(
    args: &ArgMatches,
    config: &Config,
    now_ms: i64,
) -> Result<ServiceMapRequest> {
    let time_range = resolve_time_range(
        args.get_one::<String>("start").map(String::as_str),
        args.get_one::<String>("end").map(String::as_str),
        now_ms,
        config.service_map.initial_time_range_ms,
    )?;

    let filters = args
        .get_many::<String>("filter")
        .into_iter()
        .flatten()
        .map(|f| parse_filter(f))
        .collect::<Result<Vec<_>>>()?;

    let after = args
        .get_one::<String>("after")
        .map(|cursor| cursor.parse::<TraceSampleCursor>())
        .transpose()
        .context("invalid --after cursor")?;

    Ok(ServiceMapRequest {
        service_name: args.get_one::<String>("service-name").cloned(),
        environment: args.get_one::<String>("environment").cloned(),
        time_range,
        filters,
        after,
        exclude_trace_ids: Default::default(),
    })
}

pub fn build_search_client(config: &Config) -> Result<ElasticsearchClient> {
    let mut client =
        ElasticsearchClient::with_timeout(&config.elasticsearch_url, config.request_timeout_secs)
            .context("failed to create Elasticsearch client")?
            .with_ml_results_index(config.indices.ml_results.clone());
    if let Some((username, password)) = config.basic_auth() {
        client = client.with_basic_auth(username, password);
    }
    Ok(client)
}

/// Alerting is optional: no Kibana URL, no client.
pub fn build_alerts_client(config: &Config) -> Result<Option<KibanaAlertsClient>> {
    let Some(kibana_url) = &config.kibana_url else {
        return Ok(None);
    };
    let mut client = KibanaAlertsClient::new(kibana_url, config.request_timeout_secs)
        .context("failed to create Kibana client")?;
    if let Some((username, password)) = config.basic_auth() {
        client = client.with_basic_auth(username, password);
    }
    Ok(Some(client))
}

pub fn render_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<String> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(rendered)
}

/// One-paragraph human summary of a map, printed to stderr.
pub fn format_summary(graph: &ServiceMapGraph) -> String {
    let services = graph
        .nodes
        .iter()
        .filter(|n| n.data.node.as_service().is_some())
        .count();
    let externals = graph.nodes.len() - services;
    let anomalous = graph
        .nodes
        .iter()
        .filter(|n| {
            n.data
                .service_anomaly_stats
                .as_ref()
                .is_some_and(|s| s.anomaly_score.is_some())
        })
        .count();

    let mut summary = format!(
        "{} {} services, {} external destinations, {} connections",
        "✓".green().bold(),
        services,
        externals,
        graph.edges.len()
    );
    if anomalous > 0 {
        summary.push_str(&format!(
            "\n{} {} services with anomaly scores",
            "!".yellow().bold(),
            anomalous
        ));
    }
    match &graph.after {
        Some(cursor @ TraceSampleCursor::After(_)) => summary.push_str(&format!(
            "\n{} more traces available, continue with --after {}",
            "→".blue(),
            cursor
        )),
        _ => summary.push_str(&format!("\n{} all trace samples inspected", "→".blue())),
    }
    summary
}

fn spinner(quiet: bool, message: &str) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(message.to_string());
    Ok(spinner)
}

pub async fn handle_map(args: &ArgMatches, config: &Config) -> Result<()> {
    if !config.service_map.enabled {
        bail!("the service map is disabled (service_map.enabled = false)");
    }

    let quiet = args.get_flag("quiet");
    let pretty = args.get_flag("pretty");
    let max_requests = args.get_one::<usize>("max-requests").copied().unwrap_or(1);
    let request = map_request_from_args(args, config, Utc::now().timestamp_millis())?;
    debug!(
        "Map window {}..{} with {} extra filters",
        request.time_range.start,
        request.time_range.end,
        request.filters.len()
    );

    let es = Arc::new(build_search_client(config)?);
    let ml: Arc<dyn MlClient> = es.clone();
    let service = ServiceMapService::new(es, Some(ml), config);

    let progress = spinner(quiet, "Sampling traces and building the service map...")?;
    let result = collect_service_map(&service, request, max_requests).await;
    progress.finish_and_clear();
    let graph = result.context("failed to build the service map")?;

    if !quiet {
        eprintln!("{}", format_summary(&graph));
    }
    println!("{}", render_json(&graph, pretty)?);
    Ok(())
}

pub async fn handle_alerts(args: &ArgMatches, config: &Config) -> Result<()> {
    let pretty = args.get_flag("pretty");
    let client = build_alerts_client(config)?;
    if client.is_none() {
        warn!("kibana_url is not configured, no alerts to report");
    }

    let alerts = get_service_alerts(client.as_ref().map(|c| c as &dyn AlertsClient))
        .await
        .context("failed to fetch alerts")?;

    if !args.get_flag("quiet") {
        let firing = alerts.iter().filter(|a| a.has_alert_violations).count();
        eprintln!(
            "{} {} alerts, {} with violations",
            "✓".green().bold(),
            alerts.len(),
            firing
        );
    }
    println!("{}", render_json(&alerts, pretty)?);
    Ok(())
}

pub fn handle_config(config: &Config) -> Result<()> {
    println!("{}", render_json(config, true)?);
    Ok(())
}
