//! Named recurring timers used to drive reconnect retries
//!
//! [`Scheduler`] keeps one timer per string id on top of a [`CoreScheduler`].
//! Scheduling an id that already has a timer replaces it, and unscheduling
//! an unknown id is a no-op. The production core is backed by
//! `tokio-cron-scheduler`.

use crate::config::parse_duration;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Callback fired by a timer; each firing runs on its own task
pub type Trigger = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Prefix of fixed interval specs, e.g. `@every 30s`
pub const EVERY_PREFIX: &str = "@every ";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid schedule spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
    #[error("Scheduler engine error: {0}")]
    Engine(String),
}

/// Timer engine underneath [`Scheduler`]
#[async_trait]
pub trait CoreScheduler: Send + Sync {
    /// Register a recurring job. `spec` is `@every <duration>` or a cron expression.
    async fn add_func(&self, spec: &str, trigger: Trigger) -> Result<Uuid, SchedulerError>;

    async fn remove(&self, job: Uuid) -> Result<(), SchedulerError>;

    /// Stop firing every job
    async fn close(&self) -> Result<(), SchedulerError>;
}

/// Build an `@every` spec from a duration
pub fn every_spec(interval: Duration) -> String {
    format!("{EVERY_PREFIX}{}ns", interval.as_nanos())
}

/// [`CoreScheduler`] backed by `tokio_cron_scheduler::JobScheduler`
#[derive(Clone)]
pub struct CronCoreScheduler {
    inner: JobScheduler,
}

impl CronCoreScheduler {
    /// Create and start the engine
    pub async fn start() -> Result<Self, SchedulerError> {
        let inner = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Engine(format!("Failed to create scheduler: {e}")))?;
        inner
            .start()
            .await
            .map_err(|e| SchedulerError::Engine(format!("Failed to start scheduler: {e}")))?;
        Ok(Self { inner })
    }

    fn build_job(spec: &str, trigger: Trigger) -> Result<Job, SchedulerError> {
        let invalid = |reason: String| SchedulerError::InvalidSpec {
            spec: spec.to_string(),
            reason,
        };

        if let Some(interval) = spec.strip_prefix(EVERY_PREFIX) {
            let interval = parse_duration(interval).map_err(|e| invalid(e.to_string()))?;
            if interval.is_zero() {
                return Err(invalid("interval must be positive".to_string()));
            }
            Job::new_repeated_async(interval, move |_job_id, _scheduler| {
                let trigger = Arc::clone(&trigger);
                Box::pin(async move {
                    tokio::spawn(trigger());
                })
            })
            .map_err(|e| invalid(e.to_string()))
        } else {
            Job::new_async(spec, move |_job_id, _scheduler| {
                let trigger = Arc::clone(&trigger);
                Box::pin(async move {
                    tokio::spawn(trigger());
                })
            })
            .map_err(|e| invalid(e.to_string()))
        }
    }
}

#[async_trait]
impl CoreScheduler for CronCoreScheduler {
    async fn add_func(&self, spec: &str, trigger: Trigger) -> Result<Uuid, SchedulerError> {
        let job = Self::build_job(spec, trigger)?;
        self.inner
            .add(job)
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))
    }

    async fn remove(&self, job: Uuid) -> Result<(), SchedulerError> {
        self.inner
            .remove(&job)
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))
    }

    async fn close(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.clone();
        inner
            .shutdown()
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))
    }
}

/// Idempotent registry of named recurring timers
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<dyn CoreScheduler>,
    jobs: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl Scheduler {
    pub fn new(core: Arc<dyn CoreScheduler>) -> Self {
        Self {
            core,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fire `trigger` every `interval` (a duration string such as `"30s"`),
    /// replacing any timer already registered under `id`
    pub async fn schedule(
        &self,
        id: &str,
        interval: &str,
        trigger: Trigger,
    ) -> Result<(), SchedulerError> {
        self.schedule_spec(id, &format!("{EVERY_PREFIX}{}", interval.trim()), trigger)
            .await
    }

    pub async fn schedule_every(
        &self,
        id: &str,
        interval: Duration,
        trigger: Trigger,
    ) -> Result<(), SchedulerError> {
        self.schedule_spec(id, &every_spec(interval), trigger).await
    }

    async fn schedule_spec(
        &self,
        id: &str,
        spec: &str,
        trigger: Trigger,
    ) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.remove(id) {
            self.remove_job(id, existing).await;
        }

        match self.core.add_func(spec, trigger).await {
            Ok(job) => {
                jobs.insert(id.to_string(), job);
                info!(id, spec, "Scheduled job");
                Ok(())
            }
            Err(e) => {
                error!(id, spec, error = %e, "Failed to schedule job");
                Err(e)
            }
        }
    }

    /// Cancel the timer under `id`; unknown ids are ignored
    pub async fn unschedule(&self, id: &str) {
        let removed = self.jobs.lock().await.remove(id);
        if let Some(job) = removed {
            self.remove_job(id, job).await;
            debug!(id, "Unscheduled job");
        }
    }

    /// Cancel every timer whose id starts with `prefix`
    pub async fn unschedule_all(&self, prefix: &str) {
        let removed: Vec<(String, Uuid)> = {
            let mut jobs = self.jobs.lock().await;
            let ids: Vec<String> = jobs
                .keys()
                .filter(|id| id.starts_with(prefix))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| jobs.remove(&id).map(|job| (id, job)))
                .collect()
        };

        for (id, job) in removed {
            self.remove_job(&id, job).await;
            debug!(id = %id, "Unscheduled job");
        }
    }

    async fn remove_job(&self, id: &str, job: Uuid) {
        if let Err(e) = self.core.remove(job).await {
            error!(id, error = %e, "Failed to remove job from scheduler");
        }
    }

    pub async fn is_scheduled(&self, id: &str) -> bool {
        self.jobs.lock().await.contains_key(id)
    }

    /// Registered ids, sorted
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Shut down the underlying engine
    pub async fn close(&self) -> Result<(), SchedulerError> {
        self.jobs.lock().await.clear();
        self.core.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_trigger(counter: Arc<AtomicUsize>) -> Trigger {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    async fn wait_for(counter: &AtomicUsize, at_least: usize) -> bool {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_every_spec() {
        assert_eq!(every_spec(Duration::from_secs(1)), "@every 1000000000ns");
        let spec = every_spec(Duration::from_millis(1500));
        let interval = spec.strip_prefix(EVERY_PREFIX).unwrap();
        assert_eq!(parse_duration(interval).unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_build_job_rejects_bad_specs() {
        let trigger: Trigger = Arc::new(|| async {}.boxed());
        assert!(matches!(
            CronCoreScheduler::build_job("@every soon", Arc::clone(&trigger)),
            Err(SchedulerError::InvalidSpec { .. })
        ));
        assert!(matches!(
            CronCoreScheduler::build_job("@every 0", Arc::clone(&trigger)),
            Err(SchedulerError::InvalidSpec { .. })
        ));
        assert!(CronCoreScheduler::build_job("not a cron line", trigger).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schedule_fires_and_unschedule_is_idempotent() {
        let core = Arc::new(CronCoreScheduler::start().await.unwrap());
        let scheduler = Scheduler::new(core);
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule("job", "1s", counting_trigger(Arc::clone(&counter)))
            .await
            .unwrap();
        assert!(scheduler.is_scheduled("job").await);
        assert!(wait_for(&counter, 1).await, "timer never fired");

        scheduler.unschedule("job").await;
        scheduler.unschedule("job").await;
        assert!(!scheduler.is_scheduled("job").await);
        scheduler.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schedule_replaces_existing_id() {
        let core = Arc::new(CronCoreScheduler::start().await.unwrap());
        let scheduler = Scheduler::new(core);
        let trigger: Trigger = Arc::new(|| async {}.boxed());

        scheduler.schedule("a", "10s", Arc::clone(&trigger)).await.unwrap();
        scheduler.schedule("a", "20s", Arc::clone(&trigger)).await.unwrap();
        assert_eq!(scheduler.ids().await, vec!["a".to_string()]);
        scheduler.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_interval_is_reported() {
        let core = Arc::new(CronCoreScheduler::start().await.unwrap());
        let scheduler = Scheduler::new(core);
        let trigger: Trigger = Arc::new(|| async {}.boxed());

        let result = scheduler.schedule("bad", "eventually", trigger).await;
        assert!(matches!(result, Err(SchedulerError::InvalidSpec { .. })));
        assert!(!scheduler.is_scheduled("bad").await);
        scheduler.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unschedule_all_by_prefix() {
        let core = Arc::new(CronCoreScheduler::start().await.unwrap());
        let scheduler = Scheduler::new(core);
        let trigger: Trigger = Arc::new(|| async {}.boxed());

        for id in ["gw_adapter_source", "gw_adapter_mqtt", "other_adapter_mqtt"] {
            scheduler.schedule(id, "30s", Arc::clone(&trigger)).await.unwrap();
        }
        scheduler.unschedule_all("gw_adapter_").await;
        assert_eq!(scheduler.ids().await, vec!["other_adapter_mqtt".to_string()]);
        scheduler.close().await.unwrap();
    }
}
