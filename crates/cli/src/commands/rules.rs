//! Rule listing and reload

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::{json, Value};
use std::path::Path;
use tabled::Tabled;

use crate::client::{ApiClient, ApiError, RuleList};
use crate::output::{
    format_timestamp, format_value, print_error, print_json, print_rows, print_success,
    OutputFormat,
};

#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Condition")]
    condition: String,
    #[tabled(rename = "Every")]
    interval: String,
    #[tabled(rename = "Needs")]
    consecutive: u32,
}

fn print_rule_list(rules: &RuleList, format: OutputFormat) {
    if format == OutputFormat::Table {
        println!(
            "{} v{} (loaded {})",
            "Rule set".bold(),
            rules.version,
            format_timestamp(&rules.loaded_at)
        );
    }
    let rows = rules
        .rules
        .iter()
        .map(|r| RuleRow {
            name: r.name.clone(),
            metric: r.metric.clone(),
            condition: format!("{} {}", r.condition, format_value(r.threshold)),
            interval: format!("{}s", r.evaluation_interval_secs),
            consecutive: r.consecutive_required,
        })
        .collect();
    print_rows(rows, &rules.rules, format);
}

pub async fn list_rules(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let rules: RuleList = client.get("api/v1/rules").await?;
    print_rule_list(&rules, format);
    Ok(())
}

/// Read a JSON rule file; a bare array is accepted as the rule list
fn read_rules(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(match value {
        Value::Array(_) => json!({ "rules": value }),
        other => other,
    })
}

/// Ask the daemon to reload its rule file, or replace the rules with the
/// contents of `file`
pub async fn reload_rules(
    client: &ApiClient,
    file: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let result = match file {
        Some(path) => {
            let body = read_rules(path)?;
            client.post::<RuleList, _>("api/v1/rules/reload", &body).await
        }
        None => client.post_empty::<RuleList>("api/v1/rules/reload").await,
    };

    let rules = match result {
        Ok(rules) => rules,
        Err(err) => {
            if let Some(api) = err.downcast_ref::<ApiError>() {
                for detail in api.details() {
                    print_error(&describe_rejection(detail));
                }
            }
            return Err(err);
        }
    };

    match format {
        OutputFormat::Json => print_json(&rules),
        OutputFormat::Table => {
            print_success(&format!(
                "Rules reloaded: version {}, {} rule(s)",
                rules.version,
                rules.rules.len()
            ));
            print_rule_list(&rules, format);
        }
    }
    Ok(())
}

fn describe_rejection(detail: &Value) -> String {
    match (detail.get("index"), detail.get("name"), detail.get("kind")) {
        (Some(index), Some(name), Some(kind)) => format!(
            "rule #{} {}: {}",
            index,
            name.as_str().unwrap_or_default(),
            kind.as_str().unwrap_or_default()
        ),
        _ => detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_rejection() {
        let detail = json!({"index": 2, "name": "rx-high", "kind": "unknown condition: sideways"});
        assert_eq!(
            describe_rejection(&detail),
            "rule #2 rx-high: unknown condition: sideways"
        );
        assert_eq!(describe_rejection(&json!("oops")), "\"oops\"");
    }

    #[test]
    fn test_bare_array_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"[{"name":"a"}]"#).unwrap();

        let body = read_rules(&path).unwrap();
        assert_eq!(body["rules"][0]["name"], "a");
    }
}
