//! API client for communicating with the netpulse daemon

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Error reported by the daemon
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API error ({status}): {message}")]
    Status {
        status: u16,
        message: String,
        details: Vec<serde_json::Value>,
    },
}

impl ApiError {
    pub fn details(&self) -> &[serde_json::Value] {
        match self {
            ApiError::Status { details, .. } => details,
        }
    }
}

/// API client for the engine daemon
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::decode(response).await
    }

    /// Make a GET request with query parameters; `None` values are omitted
    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> Result<T> {
        let mut url = self.base_url.join(path).context("Invalid path")?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                if let Some(value) = value {
                    pairs.append_pair(key, value);
                }
            }
        }
        // Drop a dangling '?' when nothing was appended
        if url.query() == Some("") {
            url.set_query(None);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::decode(response).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        Self::decode(response).await
    }

    /// Make a POST request without a body
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (message, details) = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => (err.error, err.details),
                Err(_) => (body, Vec::new()),
            };
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
                details,
            }
            .into());
        }

        response.json().await.context("Failed to parse response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub details: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub node: String,
    pub metric: String,
    pub value: f64,
    pub z_score: f64,
    pub baseline_mean: f64,
    pub baseline_std_dev: f64,
    pub direction: String,
    pub severity: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub source_node: String,
    pub dest_node: String,
    pub transmit_bytes: f64,
    pub receive_bytes: f64,
    pub correlation_magnitude: f64,
    pub window_start: String,
    pub window_end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowList {
    pub computed_at: Option<String>,
    pub flows: Vec<Flow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub rule: String,
    pub node: String,
    pub metric: String,
    pub state: String,
    pub since: String,
    pub value: Option<f64>,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStateEntry {
    pub rule: String,
    pub node: String,
    pub status: String,
    pub consecutive_true: u32,
    pub consecutive_false: u32,
    pub since: String,
    pub last_evaluated_at: Option<String>,
    pub last_value: Option<f64>,
    pub orphaned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub metric: String,
    pub condition: String,
    pub threshold: f64,
    pub evaluation_interval_secs: u64,
    pub consecutive_required: u32,
    pub message_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleList {
    pub version: u64,
    pub loaded_at: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub metric: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub function: String,
    pub group_by_node: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationBucket {
    #[serde(default)]
    pub node: Option<String>,
    pub value: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    pub metric: String,
    pub function: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub buckets: Vec<AggregationBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRequest {
    pub node: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedSample {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub queued: bool,
    pub rejected: Vec<RejectedSample>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub delivered: u64,
    pub suppressed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub dropped: u64,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub instance: String,
    pub tracked_series: usize,
    pub history_series: usize,
    pub history_samples: usize,
    pub rules_loaded: usize,
    pub rule_set_version: u64,
    pub active_alerts: usize,
    pub flows: usize,
    pub last_correlation: Option<String>,
    pub dispatcher: DispatcherStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_body_is_decoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/rules/reload")
            .with_status(422)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"rule set rejected","details":[{"index":1,"name":"x","kind":"unknown condition"}]}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client
            .post_empty::<RuleList>("api/v1/rules/reload")
            .await
            .unwrap_err();
        mock.assert_async().await;

        let api = err.downcast_ref::<ApiError>().unwrap();
        assert!(api.to_string().contains("422"));
        assert_eq!(api.details().len(), 1);
        assert_eq!(api.details()[0]["index"], 1);
    }

    #[tokio::test]
    async fn test_query_skips_missing_values() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/anomalies")
            .match_query(mockito::Matcher::UrlEncoded("node".into(), "n1".into()))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let anomalies: Vec<Anomaly> = client
            .get_with_query(
                "api/v1/anomalies",
                &[("node", Some("n1".to_string())), ("metric", None)],
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert!(anomalies.is_empty());
    }
}
