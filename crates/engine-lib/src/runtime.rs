//! Background loops
//!
//! Drives the periodic parts of the engine: the correlation cycle, rule
//! evaluation with maintenance, the notification worker and the buffered
//! ingest path. Every loop watches a shared shutdown broadcast and finishes
//! its current cycle before exiting.

use crate::engine::{validate_sample, MetricsEngine};
use crate::error::{EngineError, Result};
use crate::health::components;
use crate::models::MetricSample;
use crate::observability::EngineMetrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodic correlation over the configured window
pub struct CorrelationLoop {
    engine: Arc<MetricsEngine>,
    interval: Duration,
}

impl CorrelationLoop {
    pub fn new(engine: Arc<MetricsEngine>) -> Self {
        let interval = engine.config().correlator.interval;
        Self { engine, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting flow correlation loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let health = self.engine.health();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let flows = self.engine.run_correlation(Utc::now());
                    health.heartbeat(components::CORRELATOR).await;
                    debug!(flows = flows.len(), "Correlation cycle published");
                }
                _ = shutdown.recv() => {
                    info!("Shutting down flow correlation loop");
                    break;
                }
            }
        }
    }
}

/// Ticks the rule engine and runs maintenance every N ticks
pub struct RuleEvaluationLoop {
    engine: Arc<MetricsEngine>,
    tick: Duration,
    maintenance_every: u64,
}

impl RuleEvaluationLoop {
    pub fn new(engine: Arc<MetricsEngine>) -> Self {
        let config = &engine.config().rules;
        let tick = config.tick;
        let maintenance_every = u64::from(config.maintenance_every.max(1));
        Self {
            engine,
            tick,
            maintenance_every,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            tick_ms = self.tick.as_millis() as u64,
            "Starting rule evaluation loop"
        );

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let now = Utc::now();
                    let queued = self.engine.evaluate_rules(now);
                    ticks += 1;

                    if ticks % self.maintenance_every == 0 {
                        self.engine.maintain(now);
                    }
                    if queued > 0 {
                        debug!(
                            queued,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Rule evaluation queued notifications"
                        );
                    }
                    self.engine.health().heartbeat(components::RULE_ENGINE).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down rule evaluation loop");
                    break;
                }
            }
        }
    }
}

/// Non-blocking entry point into the buffered ingest path
#[derive(Clone)]
pub struct SampleSender {
    tx: mpsc::Sender<MetricSample>,
    metrics: EngineMetrics,
}

impl SampleSender {
    /// Validate and queue a sample; a full or closed buffer is reported as
    /// backpressure
    pub fn try_send(&self, sample: MetricSample) -> Result<()> {
        if let Err(e) = validate_sample(&sample) {
            self.metrics.inc_samples_rejected();
            return Err(e);
        }
        self.tx.try_send(sample).map_err(|e| {
            self.metrics.inc_samples_rejected();
            match e {
                mpsc::error::TrySendError::Full(_) => debug!("Ingest buffer full"),
                mpsc::error::TrySendError::Closed(_) => debug!("Ingest buffer closed"),
            }
            EngineError::IngestBackpressure
        })
    }
}

/// Applies buffered samples to the engine in arrival order
pub struct IngestLoop {
    engine: Arc<MetricsEngine>,
    rx: mpsc::Receiver<MetricSample>,
}

impl IngestLoop {
    pub fn new(engine: Arc<MetricsEngine>) -> (Self, SampleSender) {
        let (tx, rx) = mpsc::channel(engine.config().ingest_buffer.max(1));
        let sender = SampleSender {
            tx,
            metrics: EngineMetrics::new(),
        };
        (Self { engine, rx }, sender)
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting ingest loop");
        self.engine.health().set_healthy(components::INGEST).await;

        loop {
            tokio::select! {
                sample = self.rx.recv() => match sample {
                    Some(sample) => self.apply(sample),
                    None => break,
                },
                _ = shutdown.recv() => {
                    // Samples already accepted are still applied
                    self.rx.close();
                    let mut drained = 0usize;
                    while let Ok(sample) = self.rx.try_recv() {
                        self.apply(sample);
                        drained += 1;
                    }
                    info!(drained, "Shutting down ingest loop");
                    break;
                }
            }
        }
    }

    fn apply(&self, sample: MetricSample) {
        if let Err(e) = self.engine.ingest(sample) {
            debug!(error = %e, "Dropped invalid sample");
        }
    }
}

/// Running engine loops
pub struct EngineHandle {
    engine: Arc<MetricsEngine>,
    shutdown_tx: broadcast::Sender<()>,
    samples: SampleSender,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl EngineHandle {
    /// Spawn every loop on the current tokio runtime and mark the engine ready
    pub async fn start(engine: Arc<MetricsEngine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let health = engine.health();
        health.register_all().await;
        health
            .expect_heartbeat(components::CORRELATOR, engine.config().correlator.interval)
            .await;
        health
            .expect_heartbeat(components::RULE_ENGINE, engine.config().rules.tick)
            .await;

        let (ingest, samples) = IngestLoop::new(engine.clone());
        let correlation = CorrelationLoop::new(engine.clone());
        let rules = RuleEvaluationLoop::new(engine.clone());
        let dispatcher = engine.dispatcher().clone();

        let tasks = vec![
            ("ingest", tokio::spawn(ingest.run(shutdown_tx.subscribe()))),
            (
                "correlation",
                tokio::spawn(correlation.run(shutdown_tx.subscribe())),
            ),
            ("rules", tokio::spawn(rules.run(shutdown_tx.subscribe()))),
            (
                "dispatcher",
                tokio::spawn(dispatcher.run(shutdown_tx.subscribe())),
            ),
        ];

        health.set_healthy(components::DISPATCHER).await;
        health.mark_running().await;

        Self {
            engine,
            shutdown_tx,
            samples,
            tasks,
        }
    }

    pub fn engine(&self) -> &Arc<MetricsEngine> {
        &self.engine
    }

    pub fn sample_sender(&self) -> SampleSender {
        self.samples.clone()
    }

    /// A receiver for auxiliary tasks (such as the rule file watcher) that
    /// should stop with the engine
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every loop and wait up to `grace` for them to finish; loops
    /// still running after that are aborted
    pub async fn shutdown(self, grace: Duration) {
        self.engine.health().mark_stopping().await;
        let _ = self.shutdown_tx.send(());
        self.engine.dispatcher().close();

        let deadline = Instant::now() + grace;
        for (name, mut task) in self.tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut task).await {
                Ok(Ok(())) => debug!(task = name, "Loop stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Loop terminated abnormally"),
                Err(_) => {
                    warn!(task = name, "Loop did not stop within grace period, aborting");
                    task.abort();
                }
            }
        }
        info!("Engine loops stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{RuleDefinition, RuleEngineConfig};
    use crate::dispatch::testing::ScriptedChannel;
    use crate::engine::EngineConfig;

    fn engine(channel: Arc<ScriptedChannel>) -> Arc<MetricsEngine> {
        let config = EngineConfig {
            ingest_buffer: 4,
            ..EngineConfig::default()
        }
        .with_rules(RuleEngineConfig::default().with_tick(Duration::from_millis(20)));
        Arc::new(MetricsEngine::new(config, channel))
    }

    #[tokio::test]
    async fn test_buffered_sample_reaches_alert_delivery() {
        let channel = Arc::new(ScriptedChannel::default());
        let engine = engine(channel.clone());
        engine.load_rules(&[RuleDefinition {
            name: "rx-high".to_string(),
            metric: "rx".to_string(),
            threshold: 10.0,
            condition: ">".to_string(),
            evaluation_interval_secs: 1,
            consecutive_required: 1,
            message: None,
        }]);

        let handle = EngineHandle::start(engine.clone()).await;
        assert!(engine.health().readiness().await.ready);

        handle
            .sample_sender()
            .try_send(MetricSample::new("n1", "rx", 50.0, Utc::now()))
            .unwrap();

        for _ in 0..250 {
            if channel.calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(channel.calls(), 1);
        assert_eq!(engine.get_active_alerts().len(), 1);

        handle.shutdown(Duration::from_secs(2)).await;
        assert!(engine.dispatcher().is_closed());
        assert!(!engine.health().readiness().await.ready);
    }

    #[tokio::test]
    async fn test_full_buffer_reports_backpressure() {
        let engine = engine(Arc::new(ScriptedChannel::default()));
        // Loop never started, so nothing drains the buffer
        let (_ingest, sender) = IngestLoop::new(engine);

        for i in 0..4 {
            sender
                .try_send(MetricSample::new("n1", "rx", i as f64, Utc::now()))
                .unwrap();
        }
        assert!(matches!(
            sender.try_send(MetricSample::new("n1", "rx", 5.0, Utc::now())),
            Err(EngineError::IngestBackpressure)
        ));
        assert!(matches!(
            sender.try_send(MetricSample::new("n1", "rx", f64::NAN, Utc::now())),
            Err(EngineError::InvalidSample(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drains_accepted_samples() {
        let engine = engine(Arc::new(ScriptedChannel::default()));
        let (ingest, sender) = IngestLoop::new(engine.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        for i in 0..3 {
            sender
                .try_send(MetricSample::new("n1", "rx", i as f64, Utc::now()))
                .unwrap();
        }
        shutdown_tx.send(()).unwrap();
        ingest.run(shutdown_rx).await;

        assert_eq!(engine.history_stats().samples, 3);
    }
}
