//! Bounded notification queue with dedupe and retry
//!
//! - The queue drops its oldest entry when full, so a slow channel never
//!   blocks rule evaluation
//! - A dedupe key seen within the window is suppressed; keys are recorded
//!   when a request is accepted for delivery
//! - Transient failures back off exponentially up to a cap; permanent
//!   failures are reported once and never retried
//! - Closing the dispatcher abandons pending retries

use super::{NotificationChannel, NotificationRequest, SendOutcome};
use crate::health::{components, HealthRegistry};
use crate::observability::{EngineMetrics, StructuredLogger};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

/// Exponential backoff parameters
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub dedupe_window: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            dedupe_window: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_dedupe_window(mut self, dedupe_window: Duration) -> Self {
        self.dedupe_window = dedupe_window;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Final result of dispatching one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    Suppressed,
    Failed { attempts: u32, error: String },
    Abandoned,
}

/// Counters since startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub delivered: u64,
    pub suppressed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub dropped: u64,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    suppressed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    dropped: AtomicU64,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    channel: Arc<dyn NotificationChannel>,
    queue: Mutex<VecDeque<NotificationRequest>>,
    wakeup: Notify,
    recent: Mutex<HashMap<String, Instant>>,
    counters: Counters,
    closed: watch::Sender<bool>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, channel: Arc<dyn NotificationChannel>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity.min(1024))),
            config,
            channel,
            wakeup: Notify::new(),
            recent: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            closed,
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("netpulse"),
            health: None,
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Report delivery health under the dispatcher component
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Queue a request for the worker. Returns the request that was evicted
    /// to make room, if any.
    pub fn enqueue(&self, request: NotificationRequest) -> Option<NotificationRequest> {
        let capacity = self.config.queue_capacity.max(1);
        let (dropped, depth) = {
            let mut queue = self.queue.lock();
            let dropped = if queue.len() >= capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(request);
            (dropped, queue.len())
        };

        if let Some(ref old) = dropped {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_notifications("dropped");
            self.logger.log_queue_overflow(&old.dedupe_key, capacity);
        }
        self.metrics.set_notification_queue_depth(depth);
        self.wakeup.notify_one();
        dropped
    }

    fn pop(&self) -> Option<NotificationRequest> {
        let mut queue = self.queue.lock();
        let next = queue.pop_front();
        self.metrics.set_notification_queue_depth(queue.len());
        next
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Check-and-record the dedupe key; true if it was seen within the window
    fn is_duplicate(&self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.config.dedupe_window;
        let mut recent = self.recent.lock();

        if let Some(seen) = recent.get(key) {
            if now.duration_since(*seen) < window {
                return true;
            }
        }
        recent.insert(key.to_string(), now);
        recent.retain(|_, seen| now.duration_since(*seen) < window);
        false
    }

    /// Stop accepting retries; in-flight backoffs end as abandoned
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Deliver one request, retrying transient failures
    pub async fn dispatch(&self, request: NotificationRequest) -> DispatchOutcome {
        let mut closed = self.closed.subscribe();
        if self.is_closed() {
            return self.abandon(&request);
        }

        if self.is_duplicate(&request.dedupe_key) {
            debug!(dedupe_key = %request.dedupe_key, "Suppressed duplicate notification");
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_notifications("suppressed");
            return DispatchOutcome::Suppressed;
        }

        let message = request.rendered_message();
        let metadata = request.metadata();
        let retry = &self.config.retry;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.channel.send(&message, &metadata).await {
                SendOutcome::Success => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    self.metrics.inc_notifications("delivered");
                    if let Some(health) = &self.health {
                        health.set_healthy(components::DISPATCHER).await;
                    }
                    return DispatchOutcome::Delivered { attempts };
                }
                SendOutcome::PermanentError(e) => return self.fail(&request, attempts, e).await,
                SendOutcome::TransientError(e) => e,
            };

            if attempts >= retry.max_attempts.max(1) {
                return self.fail(&request, attempts, error).await;
            }

            let delay = retry.delay_for(attempts);
            warn!(
                channel = self.channel.name(),
                dedupe_key = %request.dedupe_key,
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Notification attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // The flag only ever flips to true
                _ = closed.changed() => return self.abandon(&request),
            }
        }
    }

    async fn fail(
        &self,
        request: &NotificationRequest,
        attempts: u32,
        error: String,
    ) -> DispatchOutcome {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_notifications("failed");
        self.logger
            .log_notification_failed(&request.dedupe_key, attempts, &error);
        if let Some(health) = &self.health {
            health
                .set_degraded(
                    components::DISPATCHER,
                    format!("{} delivery failed: {error}", self.channel.name()),
                )
                .await;
        }
        DispatchOutcome::Failed { attempts, error }
    }

    fn abandon(&self, request: &NotificationRequest) -> DispatchOutcome {
        debug!(dedupe_key = %request.dedupe_key, "Abandoned notification at shutdown");
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_notifications("abandoned");
        DispatchOutcome::Abandoned
    }

    /// Drain the queue until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            channel = self.channel.name(),
            capacity = self.config.queue_capacity,
            "Starting notification dispatcher"
        );

        'outer: loop {
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = shutdown.recv() => break,
            }

            while let Some(request) = self.pop() {
                tokio::select! {
                    _ = self.dispatch(request) => {}
                    _ = shutdown.recv() => {
                        self.close();
                        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        self.metrics.inc_notifications("abandoned");
                        break 'outer;
                    }
                }
            }
        }

        self.close();
        let pending = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        self.counters
            .abandoned
            .fetch_add(pending as u64, Ordering::Relaxed);
        self.metrics.set_notification_queue_depth(0);
        info!(abandoned = pending, "Notification dispatcher stopped");
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            queued: self.queue_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{request, ScriptedChannel};
    use crate::models::NotificationSeverity;

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: 4,
            dedupe_window: Duration::from_secs(60),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_attempts: 5,
            },
        }
    }

    fn transient() -> SendOutcome {
        SendOutcome::TransientError("503".to_string())
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|r| policy.delay_for(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let channel = Arc::new(ScriptedChannel::default());
        let dispatcher = Dispatcher::new(fast_config(), channel.clone());

        let outcome = dispatcher
            .dispatch(request("rx-high", "n1", NotificationSeverity::Firing))
            .await;

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 1 });
        let sent = channel.sent.lock();
        assert_eq!(sent[0].0, "rx-high firing on n1");
        assert_eq!(sent[0].1.dedupe_key, "rx-high:n1:firing");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let channel = Arc::new(ScriptedChannel::new([transient(), transient()]));
        let dispatcher = Dispatcher::new(fast_config(), channel.clone());

        let outcome = dispatcher
            .dispatch(request("r", "n1", NotificationSeverity::Firing))
            .await;

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 3 });
        assert_eq!(channel.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let channel = Arc::new(ScriptedChannel::new(std::iter::repeat(transient()).take(10)));
        let dispatcher = Dispatcher::new(fast_config(), channel.clone());

        let outcome = dispatcher
            .dispatch(request("r", "n1", NotificationSeverity::Firing))
            .await;

        assert!(matches!(outcome, DispatchOutcome::Failed { attempts: 5, .. }));
        assert_eq!(channel.calls(), 5);
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let channel = Arc::new(ScriptedChannel::new([SendOutcome::PermanentError(
            "400".to_string(),
        )]));
        let health = HealthRegistry::new();
        health.register_all().await;
        let dispatcher = Dispatcher::new(fast_config(), channel.clone()).with_health(health.clone());

        let outcome = dispatcher
            .dispatch(request("r", "n1", NotificationSeverity::Firing))
            .await;

        assert!(matches!(outcome, DispatchOutcome::Failed { attempts: 1, .. }));
        assert_eq!(channel.calls(), 1);
        let report = health.health().await;
        assert_eq!(
            report.components[components::DISPATCHER].status,
            crate::health::ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_duplicate_within_window_suppressed() {
        let channel = Arc::new(ScriptedChannel::default());
        let dispatcher = Dispatcher::new(fast_config(), channel.clone());

        let first = dispatcher
            .dispatch(request("r", "n1", NotificationSeverity::Firing))
            .await;
        let second = dispatcher
            .dispatch(request("r", "n1", NotificationSeverity::Firing))
            .await;
        // Different state, different key
        let resolved = dispatcher
            .dispatch(request("r", "n1", NotificationSeverity::Resolved))
            .await;

        assert_eq!(first, DispatchOutcome::Delivered { attempts: 1 });
        assert_eq!(second, DispatchOutcome::Suppressed);
        assert_eq!(resolved, DispatchOutcome::Delivered { attempts: 1 });
        assert_eq!(channel.calls(), 2);
    }

    #[tokio::test]
    async fn test_dedupe_window_expires() {
        let channel = Arc::new(ScriptedChannel::default());
        let config = DispatcherConfig {
            dedupe_window: Duration::from_millis(20),
            ..fast_config()
        };
        let dispatcher = Dispatcher::new(config, channel.clone());

        dispatcher
            .dispatch(request("r", "n1", NotificationSeverity::Firing))
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = dispatcher
            .dispatch(request("r", "n1", NotificationSeverity::Firing))
            .await;

        assert_eq!(again, DispatchOutcome::Delivered { attempts: 1 });
    }

    #[tokio::test]
    async fn test_close_abandons_pending_retry() {
        let channel = Arc::new(ScriptedChannel::new(std::iter::repeat(transient()).take(10)));
        let config = DispatcherConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(10),
                max_attempts: 5,
            },
            ..fast_config()
        };
        let dispatcher = Arc::new(Dispatcher::new(config, channel.clone()));

        let worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(request("r", "n1", NotificationSeverity::Firing))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.close();

        let outcome = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("dispatch should return promptly after close")
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Abandoned);
        assert_eq!(channel.calls(), 1);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let dispatcher = Dispatcher::new(fast_config(), Arc::new(ScriptedChannel::default()));

        for i in 0..4 {
            assert!(dispatcher
                .enqueue(request(&format!("r{i}"), "n1", NotificationSeverity::Firing))
                .is_none());
        }
        let dropped = dispatcher
            .enqueue(request("r4", "n1", NotificationSeverity::Firing))
            .expect("oldest entry should be evicted");

        assert_eq!(dropped.rule_name, "r0");
        assert_eq!(dispatcher.queue_len(), 4);
        assert_eq!(dispatcher.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let channel = Arc::new(ScriptedChannel::default());
        let dispatcher = Arc::new(Dispatcher::new(fast_config(), channel.clone()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        dispatcher.enqueue(request("a", "n1", NotificationSeverity::Firing));
        dispatcher.enqueue(request("b", "n1", NotificationSeverity::Firing));

        let handle = tokio::spawn(dispatcher.clone().run(shutdown_rx));

        for _ in 0..100 {
            if channel.calls() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(channel.calls(), 2);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.stats().delivered, 2);
    }
}
