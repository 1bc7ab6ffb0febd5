//! Subcommand implementations

pub mod aggregate;
pub mod alerts;
pub mod anomalies;
pub mod flows;
pub mod rules;
pub mod status;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};

/// Parse a relative age (`30s`, `15m`, `2h`, `7d`) or an RFC 3339 timestamp
/// into an absolute time
pub fn parse_since(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (amount, unit) = input.split_at(split);
    let amount: i64 = amount
        .parse()
        .with_context(|| format!("Invalid time '{input}', expected e.g. 15m, 2h or RFC 3339"))?;

    let age = match unit {
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        other => bail!("Unknown time unit '{other}', expected s, m, h or d"),
    };
    Ok(now - age)
}
