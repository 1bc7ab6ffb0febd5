//! Alert listing

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ActiveAlert, AlertStateEntry, ApiClient};
use crate::output::{
    color_status, format_optional, format_timestamp, format_value, print_rows, OutputFormat,
};

#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Threshold")]
    threshold: String,
    #[tabled(rename = "Since")]
    since: String,
}

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "True/False")]
    counters: String,
    #[tabled(rename = "Last Value")]
    last_value: String,
    #[tabled(rename = "Since")]
    since: String,
    #[tabled(rename = "Orphaned")]
    orphaned: String,
}

/// List firing alerts, or every tracked state with `all`
pub async fn list_alerts(client: &ApiClient, all: bool, format: OutputFormat) -> Result<()> {
    if all {
        let states: Vec<AlertStateEntry> = client.get("api/v1/alerts?all=true").await?;
        let rows = states
            .iter()
            .map(|s| StateRow {
                rule: s.rule.clone(),
                node: s.node.clone(),
                status: color_status(&s.status),
                counters: format!("{}/{}", s.consecutive_true, s.consecutive_false),
                last_value: format_optional(s.last_value),
                since: format_timestamp(&s.since),
                orphaned: if s.orphaned { "yes" } else { "" }.to_string(),
            })
            .collect();
        print_rows(rows, &states, format);
        return Ok(());
    }

    let alerts: Vec<ActiveAlert> = client.get("api/v1/alerts").await?;
    let rows = alerts
        .iter()
        .map(|a| AlertRow {
            rule: a.rule.clone(),
            node: a.node.clone(),
            metric: a.metric.clone(),
            state: color_status(&a.state),
            value: format_optional(a.value),
            threshold: format_value(a.threshold),
            since: format_timestamp(&a.since),
        })
        .collect();
    print_rows(rows, &alerts, format);
    Ok(())
}
