//! Inferred traffic flows

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, FlowList};
use crate::output::{
    color_magnitude, format_bytes, format_timestamp, print_json, print_rows, print_warning,
    OutputFormat,
};

#[derive(Tabled)]
struct FlowRow {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Destination")]
    dest: String,
    #[tabled(rename = "Sent")]
    sent: String,
    #[tabled(rename = "Received")]
    received: String,
    #[tabled(rename = "Match")]
    magnitude: String,
}

/// Show the flows of the latest correlation cycle
pub async fn list_flows(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let result: FlowList = client.get("api/v1/flows").await?;

    if format == OutputFormat::Json {
        print_json(&result);
        return Ok(());
    }

    match &result.computed_at {
        Some(ts) => println!("{} {}", "Correlated at".bold(), format_timestamp(ts)),
        None => {
            print_warning("No correlation cycle has completed yet");
            return Ok(());
        }
    }

    let rows = result
        .flows
        .iter()
        .enumerate()
        .map(|(i, f)| FlowRow {
            rank: i + 1,
            source: f.source_node.clone(),
            dest: f.dest_node.clone(),
            sent: format_bytes(f.transmit_bytes),
            received: format_bytes(f.receive_bytes),
            magnitude: color_magnitude(f.correlation_magnitude),
        })
        .collect();
    print_rows(rows, &result.flows, format);
    Ok(())
}
