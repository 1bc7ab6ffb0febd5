//! Netpulse CLI
//!
//! A command-line tool for querying anomalies, traffic flows and alerts,
//! running aggregations and reloading rules on a netpulse daemon.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{aggregate, alerts, anomalies, flows, rules, status};
use output::OutputFormat;
use std::path::PathBuf;

/// Netpulse CLI
#[derive(Parser)]
#[command(name = "npctl")]
#[command(author, version, about = "CLI for the Netpulse metrics and alerting engine", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via NETPULSE_API_URL env var)
    #[arg(long, env = "NETPULSE_API_URL")]
    pub api_url: Option<String>,

    /// Output format (defaults to the saved preference, then table)
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query engine state
    #[command(subcommand)]
    Get(GetCommands),

    /// Aggregate a metric over retained samples
    Aggregate {
        /// Metric name
        metric: String,

        /// Function: avg, min, max, sum, count, p50, p95, p99, delta
        #[arg(long = "fn", default_value = "avg")]
        function: String,

        /// Restrict to one node
        #[arg(long, short)]
        node: Option<String>,

        /// Start of the range (e.g. 15m, 2h or RFC 3339)
        #[arg(long)]
        since: Option<String>,

        /// End of the range (e.g. 5m or RFC 3339)
        #[arg(long)]
        until: Option<String>,

        /// One result per node instead of a combined value
        #[arg(long)]
        group_by_node: bool,
    },

    /// Manage alert rules
    #[command(subcommand)]
    Rules(RulesCommands),

    /// Submit a single metric sample
    Send {
        node: String,
        metric: String,
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },

    /// Show engine status and component health
    Status,

    /// Show or change saved CLI settings
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum GetCommands {
    /// Recent anomalies, newest first
    Anomalies {
        /// Filter by node
        #[arg(long, short)]
        node: Option<String>,

        /// Filter by metric
        #[arg(long, short)]
        metric: Option<String>,

        /// Only anomalies after this time (e.g. 15m, 2h or RFC 3339)
        #[arg(long)]
        since: Option<String>,
    },

    /// Traffic flows from the latest correlation cycle
    Flows,

    /// Firing alerts
    Alerts {
        /// Include every tracked rule/node state
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// List the active rule set
    List,

    /// Reload rules; all-or-nothing, the current set stays on any error
    Reload {
        /// JSON file with the new rules (the daemon re-reads its own file otherwise)
        #[arg(long, short)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the saved settings
    Show,

    /// Save settings
    Set {
        #[arg(long)]
        api_url: Option<String>,

        #[arg(long)]
        format: Option<OutputFormat>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let saved = config::Config::load()?;

    let format = cli
        .format
        .or_else(|| saved.default_format.as_deref().and_then(|f| f.parse().ok()))
        .unwrap_or_default();

    if let Commands::Config(cmd) = cli.command {
        return run_config(cmd, saved, format);
    }

    // Initialize client
    let client = client::ApiClient::new(&saved.resolve_api_url(cli.api_url.as_deref()))?;

    // Execute command
    match cli.command {
        Commands::Get(get_cmd) => match get_cmd {
            GetCommands::Anomalies {
                node,
                metric,
                since,
            } => {
                anomalies::list_anomalies(&client, node, metric, since, format).await?;
            }
            GetCommands::Flows => {
                flows::list_flows(&client, format).await?;
            }
            GetCommands::Alerts { all } => {
                alerts::list_alerts(&client, all, format).await?;
            }
        },
        Commands::Aggregate {
            metric,
            function,
            node,
            since,
            until,
            group_by_node,
        } => {
            let args = aggregate::AggregateArgs {
                metric,
                function,
                node,
                since,
                until,
                group_by_node,
            };
            aggregate::aggregate(&client, args, format).await?;
        }
        Commands::Rules(rules_cmd) => match rules_cmd {
            RulesCommands::List => rules::list_rules(&client, format).await?,
            RulesCommands::Reload { file } => {
                rules::reload_rules(&client, file.as_deref(), format).await?;
            }
        },
        Commands::Send {
            node,
            metric,
            value,
        } => {
            status::send_sample(&client, node, metric, value, format).await?;
        }
        Commands::Status => status::show_status(&client, format).await?,
        Commands::Config(_) => {}
    }

    Ok(())
}

fn run_config(cmd: ConfigCommands, mut saved: config::Config, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Json => output::print_json(&saved),
            OutputFormat::Table => {
                println!("api_url:        {}", saved.resolve_api_url(None));
                println!(
                    "default_format: {}",
                    saved.default_format.as_deref().unwrap_or("table")
                );
            }
        },
        ConfigCommands::Set { api_url, format } => {
            if let Some(url) = api_url {
                url::Url::parse(&url)?;
                saved.api_url = Some(url);
            }
            if let Some(format) = format {
                saved.default_format = Some(
                    match format {
                        OutputFormat::Table => "table",
                        OutputFormat::Json => "json",
                    }
                    .to_string(),
                );
            }
            let path = saved.save()?;
            output::print_success(&format!("Saved settings to {}", path.display()));
        }
    }
    Ok(())
}
