//! Anomaly listing

use anyhow::Result;
use chrono::Utc;
use tabled::Tabled;

use super::parse_since;
use crate::client::{Anomaly, ApiClient};
use crate::output::{color_severity, format_timestamp, format_value, print_rows, OutputFormat};

#[derive(Tabled)]
struct AnomalyRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Baseline")]
    baseline: String,
    #[tabled(rename = "Z")]
    z_score: String,
    #[tabled(rename = "Direction")]
    direction: String,
    #[tabled(rename = "Severity")]
    severity: String,
}

impl From<&Anomaly> for AnomalyRow {
    fn from(a: &Anomaly) -> Self {
        Self {
            time: format_timestamp(&a.timestamp),
            node: a.node.clone(),
            metric: a.metric.clone(),
            value: format_value(a.value),
            baseline: format!(
                "{} ± {}",
                format_value(a.baseline_mean),
                format_value(a.baseline_std_dev)
            ),
            z_score: format!("{:+.2}", a.z_score),
            direction: a.direction.clone(),
            severity: color_severity(&a.severity),
        }
    }
}

/// List recent anomalies, newest first
pub async fn list_anomalies(
    client: &ApiClient,
    node: Option<String>,
    metric: Option<String>,
    since: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let since = since
        .map(|s| parse_since(&s, Utc::now()))
        .transpose()?
        .map(|ts| ts.to_rfc3339());

    let anomalies: Vec<Anomaly> = client
        .get_with_query(
            "api/v1/anomalies",
            &[("node", node), ("metric", metric), ("since", since)],
        )
        .await?;

    let rows = anomalies.iter().map(AnomalyRow::from).collect();
    print_rows(rows, &anomalies, format);
    Ok(())
}
