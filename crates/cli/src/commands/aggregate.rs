//! On-demand aggregation queries

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use tabled::Tabled;

use super::parse_since;
use crate::client::{AggregationRequest, AggregationResult, ApiClient};
use crate::output::{format_optional, print_rows, OutputFormat};

#[derive(Tabled)]
struct BucketRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Samples")]
    samples: usize,
}

pub struct AggregateArgs {
    pub metric: String,
    pub function: String,
    pub node: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub group_by_node: bool,
}

pub async fn aggregate(client: &ApiClient, args: AggregateArgs, format: OutputFormat) -> Result<()> {
    let now = Utc::now();
    let from = args
        .since
        .map(|s| parse_since(&s, now))
        .transpose()?
        .map(|ts| ts.to_rfc3339());
    let to = args
        .until
        .map(|s| parse_since(&s, now))
        .transpose()?
        .map(|ts| ts.to_rfc3339());

    let request = AggregationRequest {
        metric: args.metric,
        node: args.node,
        from,
        to,
        function: args.function,
        group_by_node: args.group_by_node,
    };
    let result: AggregationResult = client.post("api/v1/aggregate", &request).await?;

    if format == OutputFormat::Table {
        println!("{}({})", result.function.bold(), result.metric.cyan());
    }
    let rows = result
        .buckets
        .iter()
        .map(|b| BucketRow {
            node: b.node.clone().unwrap_or_else(|| "(all)".to_string()),
            value: format_optional(b.value),
            samples: b.samples,
        })
        .collect();
    print_rows(rows, &result, format);
    Ok(())
}
