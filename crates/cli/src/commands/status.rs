//! Engine status, health and manual sample submission

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;

use crate::client::{ApiClient, EngineStatus, HealthResponse, IngestResponse, SampleRequest};
use crate::output::{
    color_severity, color_status, format_timestamp, format_value, print_error, print_info,
    print_json, print_success, print_warning, OutputFormat,
};

/// Show engine counters and component health
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: EngineStatus = client.get("api/v1/status").await?;
    // An unhealthy daemon answers /healthz with 503, which is still worth showing
    let health: Option<HealthResponse> = client.get("healthz").await.ok();

    if format == OutputFormat::Json {
        print_json(&serde_json::json!({ "status": status, "health": health }));
        return Ok(());
    }

    println!("{}", "Engine Status".bold());
    println!("{}", "=".repeat(50));
    println!("Instance:            {}", status.instance.cyan());
    if let Some(health) = &health {
        println!("Health:              {}", color_status(&health.status));
    }
    println!();
    println!("{}", "Data".bold());
    println!("{}", "-".repeat(50));
    println!("Tracked series:      {}", status.tracked_series);
    println!(
        "History:             {} samples in {} series",
        status.history_samples, status.history_series
    );
    println!(
        "Flows:               {} (last cycle {})",
        status.flows,
        status
            .last_correlation
            .as_deref()
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("{}", "Alerting".bold());
    println!("{}", "-".repeat(50));
    println!(
        "Rules:               {} (version {})",
        status.rules_loaded, status.rule_set_version
    );
    println!("Active alerts:       {}", status.active_alerts);
    let d = &status.dispatcher;
    println!(
        "Notifications:       {} delivered, {} suppressed, {} failed",
        d.delivered, d.suppressed, d.failed
    );
    println!(
        "Queue:               {} queued, {} dropped, {} abandoned",
        d.queued, d.dropped, d.abandoned
    );

    match health {
        Some(health) => {
            println!();
            println!("{}", "Components".bold());
            println!("{}", "-".repeat(50));
            for (name, component) in &health.components {
                let message = component.message.as_deref().unwrap_or("");
                println!("{:<20} {} {}", name, color_status(&component.status), message);
            }
        }
        None => print_warning("Health endpoint unavailable"),
    }

    Ok(())
}

/// Submit a single sample, mostly for testing rules end to end
pub async fn send_sample(
    client: &ApiClient,
    node: String,
    metric: String,
    value: f64,
    format: OutputFormat,
) -> Result<()> {
    let request = SampleRequest {
        node,
        metric,
        value,
        timestamp: Utc::now().to_rfc3339(),
    };
    let response: IngestResponse = client.post("api/v1/samples", &request).await?;

    if format == OutputFormat::Json {
        print_json(&response);
        return Ok(());
    }

    for rejected in &response.rejected {
        print_error(&rejected.error);
    }
    if response.accepted > 0 {
        if response.queued {
            print_info("Sample queued for ingestion");
        } else {
            print_success("Sample ingested");
        }
    }
    for anomaly in &response.anomalies {
        print_warning(&format!(
            "{} anomaly: {} on {} = {} (z {:+.2})",
            color_severity(&anomaly.severity),
            anomaly.metric,
            anomaly.node,
            format_value(anomaly.value),
            anomaly.z_score
        ));
    }
    Ok(())
}
