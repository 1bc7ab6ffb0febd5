//! Component health for the liveness and readiness probes
//!
//! Periodic loops report a heartbeat each cycle. A loop that registered an
//! expected cadence and then goes quiet for longer than
//! `STALE_AFTER_CYCLES` cycles is reported as degraded, even if its last
//! explicit status was healthy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Missed cycles tolerated before a heartbeat counts as stale
pub const STALE_AFTER_CYCLES: u32 = 3;

/// Ordered from best to worst so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    /// Degraded components still serve requests
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Where the engine is in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub lifecycle: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names
pub mod components {
    pub const INGEST: &str = "ingest";
    pub const CORRELATOR: &str = "correlator";
    pub const RULE_ENGINE: &str = "rule_engine";
    pub const DISPATCHER: &str = "dispatcher";

    pub const ALL: [&str; 4] = [INGEST, CORRELATOR, RULE_ENGINE, DISPATCHER];
}

struct Registry {
    components: HashMap<String, ComponentHealth>,
    cadence: HashMap<String, Duration>,
    lifecycle: Lifecycle,
}

impl Registry {
    /// Component view with stale heartbeats downgraded
    fn effective(&self, now: DateTime<Utc>) -> HashMap<String, ComponentHealth> {
        self.components
            .iter()
            .map(|(name, health)| {
                let mut health = health.clone();
                if let Some(silence) = self.stale_for(name, &health, now) {
                    if health.status == ComponentStatus::Healthy {
                        health.status = ComponentStatus::Degraded;
                        health.message = Some(format!("no heartbeat for {}s", silence.as_secs()));
                    }
                }
                (name.clone(), health)
            })
            .collect()
    }

    fn stale_for(
        &self,
        name: &str,
        health: &ComponentHealth,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let cadence = self.cadence.get(name)?;
        let silence = (now - health.updated_at).to_std().ok()?;
        (silence > *cadence * STALE_AFTER_CYCLES).then_some(silence)
    }
}

/// Shared health state; clones observe the same registry
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry {
                components: HashMap::new(),
                cadence: HashMap::new(),
                lifecycle: Lifecycle::Starting,
            })),
        }
    }

    /// Register every engine component as healthy
    pub async fn register_all(&self) {
        let mut inner = self.inner.write().await;
        for name in components::ALL {
            inner
                .components
                .insert(name.to_string(), ComponentHealth::healthy());
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.inner
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Expect `name` to report at least once per `every`
    pub async fn expect_heartbeat(&self, name: &str, every: Duration) {
        self.inner
            .write()
            .await
            .cadence
            .insert(name.to_string(), every);
    }

    /// Record a completed cycle. A degraded or unhealthy status set by
    /// someone else is kept; only its timestamp moves.
    pub async fn heartbeat(&self, name: &str) {
        let mut inner = self.inner.write().await;
        inner
            .components
            .entry(name.to_string())
            .and_modify(|h| h.updated_at = Utc::now())
            .or_insert_with(ComponentHealth::healthy);
    }

    pub async fn mark_running(&self) {
        self.inner.write().await.lifecycle = Lifecycle::Running;
    }

    pub async fn mark_stopping(&self) {
        self.inner.write().await.lifecycle = Lifecycle::Stopping;
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.inner.read().await.lifecycle
    }

    pub async fn health(&self) -> HealthResponse {
        self.health_at(Utc::now()).await
    }

    async fn health_at(&self, now: DateTime<Utc>) -> HealthResponse {
        let components = self.inner.read().await.effective(now);
        let status = components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let lifecycle = self.lifecycle().await;
        let health = self.health().await;

        let reason = match lifecycle {
            Lifecycle::Starting => Some("engine is starting".to_string()),
            Lifecycle::Stopping => Some("engine is shutting down".to_string()),
            Lifecycle::Running => {
                let mut failed: Vec<&str> = health
                    .components
                    .iter()
                    .filter(|(_, h)| !h.status.is_operational())
                    .map(|(name, _)| name.as_str())
                    .collect();
                failed.sort_unstable();
                (!failed.is_empty()).then(|| format!("unhealthy: {}", failed.join(", ")))
            }
        };

        ReadinessResponse {
            ready: reason.is_none(),
            lifecycle,
            reason,
        }
    }
}
