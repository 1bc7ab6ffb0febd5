//! Rule file hot-reload
//!
//! Watches the directory containing the rule file (editors usually replace
//! files rather than writing in place) and invokes a callback once a burst of
//! changes has settled.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

pub struct RuleFileWatcher {
    path: PathBuf,
    debounce: Duration,
}

impl RuleFileWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching; `on_change` runs on the tokio runtime after each
    /// settled burst of modifications. Stops on shutdown or when the handle
    /// is dropped.
    pub fn start<F>(self, on_change: F, mut shutdown: broadcast::Receiver<()>) -> Result<WatcherHandle>
    where
        F: Fn(&Path) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if is_relevant(&event, &target) {
                        let _ = tx.send(());
                    }
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create rule file watcher")?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        info!(path = %self.path.display(), "Watching rule file for changes");

        let path = self.path;
        let debounce = self.debounce;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        if event.is_none() {
                            debug!("Rule watcher channel closed");
                            break;
                        }
                        // Coalesce the rest of the burst
                        loop {
                            match tokio::time::timeout(debounce, rx.recv()).await {
                                Ok(Some(())) => continue,
                                Ok(None) | Err(_) => break,
                            }
                        }
                        debug!(path = %path.display(), "Rule file changed");
                        on_change(&path);
                    }
                    _ = shutdown.recv() => {
                        debug!("Stopping rule file watcher");
                        break;
                    }
                }
            }
        });

        Ok(WatcherHandle {
            _watcher: watcher,
            task,
        })
    }
}

fn is_relevant(event: &Event, target: &Path) -> bool {
    let touches_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    );
    touches_kind
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == target.file_name())
}

/// Handle to a running watcher; stops watching when dropped
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_relevant_events() {
        let target = Path::new("/etc/netpulse/rules.toml");

        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/netpulse/rules.toml"));
        assert!(is_relevant(&modify, target));

        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/etc/netpulse/rules.toml"));
        assert!(is_relevant(&create, target));

        let other_file = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/netpulse/other.toml"));
        assert!(!is_relevant(&other_file, target));

        let removed = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/etc/netpulse/rules.toml"));
        assert!(!is_relevant(&removed, target));
    }

    #[tokio::test]
    async fn test_change_triggers_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(&path, "rules = []\n").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let counter = calls.clone();
        let _handle = RuleFileWatcher::new(&path)
            .with_debounce(Duration::from_millis(50))
            .start(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                shutdown_rx,
            )
            .unwrap();

        // Give the backend a moment to register the watch
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "rules = []\n# edited\n").unwrap();

        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
