//! Shared state handed to every pipeline task.
//!
//! K_i: The only shared mutable state is the store, the audit log and the
//! shutdown flag; settings are read-only behind an `Arc`.

use crate::checkpoint::{AuditEvent, AuditLog, CheckpointStore};
use crate::models::{Config, PipelineConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Read-only knobs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub item_concurrency: usize,
    pub candidate_concurrency: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub candidate_timeout: Duration,
    pub judge_timeout: Duration,
    pub resume: bool,
    /// Keep judge reasoning and timing in persisted results
    pub debug: bool,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut settings = Self::from(&config.pipeline);
        settings.debug = config.output.debug;
        settings
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

impl From<&PipelineConfig> for RunSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            item_concurrency: config.item_concurrency.max(1),
            candidate_concurrency: config.candidate_concurrency.max(1),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            candidate_timeout: Duration::from_secs(config.timeout_secs),
            judge_timeout: Duration::from_secs(config.judge_timeout_secs),
            resume: config.resume,
            debug: false,
        }
    }
}

/// Create a linked trigger/token pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

/// Fires the shutdown token. Cloneable, usable from signal handlers.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Fire the token; true if it had already been fired.
    pub fn trigger(&self) -> bool {
        self.tx.send_replace(true)
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cooperative shutdown token, polled at safe points.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered; never resolves if the trigger is gone.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything a pipeline task needs, cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<CheckpointStore>,
    pub audit: Option<Arc<AuditLog>>,
    pub settings: Arc<RunSettings>,
    pub shutdown: Shutdown,
}

impl PipelineContext {
    pub fn new(
        store: Arc<CheckpointStore>,
        audit: Option<Arc<AuditLog>>,
        settings: RunSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            audit,
            settings: Arc::new(settings),
            shutdown,
        }
    }

    /// Record an audit event when the audit log is enabled.
    pub fn audit(&self, event: AuditEvent<'_>) {
        if let Some(audit) = &self.audit {
            audit.record(&event);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::OutputFormat;
    use std::path::Path;

    /// Settings with no backoff and short timeouts.
    pub fn fast_settings() -> RunSettings {
        RunSettings {
            item_concurrency: 4,
            candidate_concurrency: 3,
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            candidate_timeout: Duration::from_secs(5),
            judge_timeout: Duration::from_secs(5),
            resume: true,
            debug: true,
        }
    }

    pub fn context(dir: &Path, settings: RunSettings, shutdown: Shutdown) -> PipelineContext {
        let store = CheckpointStore::open(dir, OutputFormat::Jsonl, 1).unwrap();
        let audit = AuditLog::open(&dir.join("audit.jsonl")).unwrap();
        PipelineContext::new(Arc::new(store), Some(Arc::new(audit)), settings, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let mut settings = RunSettings::from(&PipelineConfig::default());
        settings.backoff_base = Duration::from_millis(100);
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = RunSettings::from(&PipelineConfig::default());
        assert_eq!(settings.item_concurrency, 4);
        assert_eq!(settings.candidate_concurrency, 3);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.candidate_timeout, Duration::from_secs(600));
        assert!(settings.resume);
        assert!(!settings.debug);
    }

    #[test]
    fn test_second_trigger_reports_repeat() {
        let (trigger, shutdown) = shutdown_channel();
        assert!(!trigger.trigger());
        assert!(shutdown.is_triggered());
        assert!(trigger.clone().trigger());
    }

    #[tokio::test]
    async fn test_shutdown_token() {
        let (trigger, shutdown) = shutdown_channel();
        assert!(!shutdown.is_triggered());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.triggered().await })
        };
        trigger.trigger();
        waiter.await.unwrap();

        assert!(shutdown.is_triggered());
        assert!(trigger.subscribe().is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_fires() {
        let (trigger, shutdown) = shutdown_channel();
        drop(trigger);
        let fired =
            tokio::time::timeout(Duration::from_millis(20), shutdown.triggered()).await;
        assert!(fired.is_err());
    }
}
