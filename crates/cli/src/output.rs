//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// Print rows as a table, or the raw items as JSON
pub fn print_rows<R: Tabled, T: Serialize>(rows: Vec<R>, items: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No items found".yellow());
                return;
            }
            let table = Table::new(rows).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(items),
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => print_error(&format!("Failed to encode output: {e}")),
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a byte count as a human-readable string
pub fn format_bytes(bytes: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bytes >= GB {
        format!("{:.2}Gi", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2}Mi", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2}Ki", bytes / KB)
    } else {
        format!("{}B", bytes.round())
    }
}

/// Integers without decimals, everything else with two
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

pub fn format_optional(value: Option<f64>) -> String {
    value.map(format_value).unwrap_or_else(|| "-".to_string())
}

/// Shorten an RFC 3339 timestamp to `YYYY-MM-DD HH:MM:SS`
pub fn format_timestamp(ts: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| {
            dt.with_timezone(&chrono::Utc)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|_| ts.to_string())
}

/// Color alert states and component health
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "firing" | "unhealthy" | "failed" => status.red().bold().to_string(),
        "resolving" | "pending" | "degraded" => status.yellow().to_string(),
        "resolved" | "normal" | "healthy" => status.green().to_string(),
        _ => status.to_string(),
    }
}

pub fn color_severity(severity: &str) -> String {
    match severity.to_lowercase().as_str() {
        "critical" => severity.red().bold().to_string(),
        "high" => severity.red().to_string(),
        "warning" => severity.yellow().to_string(),
        _ => severity.to_string(),
    }
}

/// Color a correlation magnitude by strength
pub fn color_magnitude(magnitude: f64) -> String {
    let formatted = format!("{:.0}%", magnitude * 100.0);
    if magnitude >= 0.9 {
        formatted.green().to_string()
    } else if magnitude >= 0.5 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512.0), "512B");
        assert_eq!(format_bytes(2048.0), "2.00Ki");
        assert_eq!(format_bytes(3.5 * 1024.0 * 1024.0), "3.50Mi");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(150.0), "150");
        assert_eq!(format_value(0.126), "0.13");
        assert_eq!(format_optional(None), "-");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp("2024-03-01T12:30:45.123Z"),
            "2024-03-01 12:30:45"
        );
        assert_eq!(format_timestamp("not a time"), "not a time");
    }
}
