//! Durable, at-least-once job queue.
//!
//! Jobs live in the database behind [`QueueBackend`]. [`JobQueue`] runs one
//! worker task per registered queue name: the worker claims one job at a time,
//! runs the handler, and either completes the job or reports the failure back
//! to the backend, which decides between a delayed retry and the failed state
//! from the error's [`ErrorClass`](crate::error::ErrorClass). Recurring jobs
//! are cron schedules that a ticker task turns into ordinary jobs.

pub mod crontab;

use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ConfidantError, Result};

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting to be claimed once `run_after` has passed.
    Created,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = ConfidantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(JobState::Created),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(ConfidantError::queue(format!("unknown job state: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: Value,
    pub state: JobState,
    pub retry_count: u32,
    pub retry_limit: u32,
    pub retry_backoff_secs: u64,
    /// Name of the schedule that produced this job, if any.
    pub singleton_key: Option<String>,
    pub run_after: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub retry_limit: u32,
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Overrides the queue-wide retry limit for jobs from this schedule.
    pub retry_limit: Option<u32>,
}

/// A recurring job definition. The schedule name is also the queue name.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub name: String,
    pub cron: String,
    pub payload: Value,
    pub retry_limit: u32,
    pub retry_backoff_secs: u64,
    pub next_run_at: DateTime<Utc>,
}

/// Delay before retry number `retry_count + 1`.
pub fn backoff_delay(retry_backoff_secs: u64, retry_count: u32) -> chrono::Duration {
    let factor = 1u64 << retry_count.min(16);
    let secs = retry_backoff_secs.saturating_mul(factor).min(i64::MAX as u64) as i64;
    chrono::Duration::seconds(secs)
}

/// Storage for jobs and schedules. Implemented by [`crate::db::Repository`].
pub trait QueueBackend: Send + Sync {
    fn send(&self, queue: &str, payload: &Value, options: SendOptions) -> Result<JobId>;

    /// Claim the oldest due job of `queue`, marking it active.
    fn fetch(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    fn complete(&self, job_id: JobId) -> Result<()>;

    /// Record a failed run. Retryable failures under the retry limit go back
    /// to `Created` after the backoff; everything else ends `Failed`.
    fn fail(&self, job_id: JobId, error: &str, retryable: bool, now: DateTime<Utc>)
    -> Result<JobState>;

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Insert or update a schedule by name.
    fn upsert_schedule(&self, schedule: &Schedule) -> Result<()>;

    fn unschedule(&self, name: &str) -> Result<bool>;

    fn list_schedules(&self) -> Result<Vec<Schedule>>;

    /// Enqueue one job per due schedule and advance each schedule to its next
    /// run. A schedule whose previous job is still pending is only advanced.
    fn fire_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    /// Release jobs left active by a process that died mid-run.
    fn recover_active(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub poll_interval: Duration,
    pub schedule_interval: Duration,
    pub retry_limit: u32,
    pub retry_backoff_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            schedule_interval: Duration::from_secs(1),
            retry_limit: 5,
            retry_backoff_secs: 5,
        }
    }
}

impl From<&Config> for QueueSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms()),
            retry_limit: config.retry_limit(),
            retry_backoff_secs: config.retry_backoff_secs(),
            ..Self::default()
        }
    }
}

type BoxedHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<()>> + Send + Sync>;

static QUEUE_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9._-]*$").expect("queue name regex is valid at compile time")
});

fn validate_queue_name(name: &str) -> Result<()> {
    if QUEUE_NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ConfidantError::validation(format!(
            "invalid queue name '{}': use lowercase letters, digits, '.', '_' or '-'",
            name
        )))
    }
}

/// Worker pool over a [`QueueBackend`]: one worker per queue name plus the
/// schedule ticker.
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    settings: QueueSettings,
    token: CancellationToken,
    tracker: TaskTracker,
    queues: Mutex<HashSet<String>>,
}

impl JobQueue {
    /// Recover jobs orphaned by a previous process and start the schedule
    /// ticker. Must be called inside a tokio runtime.
    pub fn start(backend: Arc<dyn QueueBackend>, settings: QueueSettings) -> Result<Self> {
        let recovered = backend.recover_active()?;
        if recovered > 0 {
            warn!(recovered, "Released jobs left active by a previous process");
        }

        let queue = Self {
            backend,
            settings,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            queues: Mutex::new(HashSet::new()),
        };
        queue.spawn_scheduler();
        Ok(queue)
    }

    fn spawn_scheduler(&self) {
        let backend = self.backend.clone();
        let token = self.token.clone();
        let interval = self.settings.schedule_interval;

        self.tracker.spawn(async move {
            loop {
                match backend.fire_due_schedules(Utc::now()) {
                    Ok(ids) if !ids.is_empty() => {
                        debug!(count = ids.len(), "Enqueued scheduled jobs");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to fire due schedules"),
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    /// Start the single worker for `queue`. Fails if the name is invalid,
    /// already taken, or the queue has been stopped.
    pub fn register_job<F, Fut>(&self, queue: &str, handler: F) -> Result<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        validate_queue_name(queue)?;
        if self.token.is_cancelled() {
            return Err(ConfidantError::queue("job queue is stopped"));
        }

        {
            let mut queues = self
                .queues
                .lock()
                .map_err(|_| ConfidantError::queue("worker registry lock poisoned"))?;
            if !queues.insert(queue.to_string()) {
                return Err(ConfidantError::queue(format!(
                    "a worker is already registered for '{}'",
                    queue
                )));
            }
        }

        let worker = Worker {
            backend: self.backend.clone(),
            queue: queue.to_string(),
            handler: Arc::new(move |job| handler(job).boxed()),
            poll_interval: self.settings.poll_interval,
            token: self.token.clone(),
        };
        self.tracker.spawn(worker.run());

        info!(queue, "Registered job worker");
        Ok(())
    }

    /// Enqueue a one-shot job with the queue-wide retry policy.
    pub fn send(&self, queue: &str, payload: &Value) -> Result<JobId> {
        self.backend.send(
            queue,
            payload,
            SendOptions {
                retry_limit: self.settings.retry_limit,
                retry_backoff_secs: self.settings.retry_backoff_secs,
            },
        )
    }

    /// Register (or update) a recurring job. Calling it again with the same
    /// name and expression changes nothing.
    pub fn schedule_job(
        &self,
        name: &str,
        cron: &str,
        payload: Value,
        options: ScheduleOptions,
    ) -> Result<()> {
        validate_queue_name(name)?;
        let next_run_at = crontab::next_after(cron, Utc::now())?;

        self.backend.upsert_schedule(&Schedule {
            name: name.to_string(),
            cron: cron.to_string(),
            payload,
            retry_limit: options.retry_limit.unwrap_or(self.settings.retry_limit),
            retry_backoff_secs: self.settings.retry_backoff_secs,
            next_run_at,
        })?;

        info!(schedule = name, cron, "Scheduled recurring job");
        Ok(())
    }

    pub fn unschedule(&self, name: &str) -> Result<bool> {
        self.backend.unschedule(name)
    }

    /// Stop claiming work and wait for in-flight jobs to finish.
    pub async fn stop(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Job queue stopped");
    }
}

struct Worker {
    backend: Arc<dyn QueueBackend>,
    queue: String,
    handler: BoxedHandler,
    poll_interval: Duration,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(queue = %self.queue, "Worker started");

        loop {
            if self.token.is_cancelled() {
                break;
            }

            match self.backend.fetch(&self.queue, Utc::now()) {
                Ok(Some(job)) => {
                    self.process(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(queue = %self.queue, error = %e, "Failed to fetch job"),
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        debug!(queue = %self.queue, "Worker stopped");
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        let attempt = job.retry_count + 1;

        match (self.handler)(job).await {
            Ok(()) => {
                if let Err(e) = self.backend.complete(job_id) {
                    error!(queue = %self.queue, job_id, error = %e, "Failed to complete job");
                }
            }
            Err(e) => {
                error!(
                    queue = %self.queue,
                    job_id,
                    attempt,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Job failed"
                );
                match self
                    .backend
                    .fail(job_id, &e.to_string(), e.is_retryable(), Utc::now())
                {
                    Ok(JobState::Failed) => {
                        warn!(queue = %self.queue, job_id, attempt, "Job will not be retried");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(queue = %self.queue, job_id, error = %e, "Failed to record job failure");
                    }
                }
            }
        }
    }
}
