//! Job queue and worker pool.
//!
//! A [`JobQueue`] holds typed jobs in one of five states: waiting,
//! delayed (backing off before a retry), active, completed or failed.
//! A [`WorkerPool`] pulls ready jobs with bounded concurrency and
//! hands them to a [`JobHandler`].  Failed attempts are retried with
//! exponential backoff until the attempt budget is spent; the job is
//! then kept as failed for inspection and nothing else happens to it.
//!
//! Finished jobs are retained for a while, bounded by age and count,
//! so operators can see what ran.  A queue opened with a [`JobLog`]
//! writes every state change to it and, when reopened, picks up the
//! jobs that were waiting, delayed or running when the process ended.

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// A value that can be queued.
pub trait JobPayload:
    Clone + Send + Sync + Serialize + DeserializeOwned + fmt::Debug + 'static
{
    /// The job name, e.g. `"organization-payroll-generation"`.
    fn name(&self) -> &'static str;
}

/// Executes jobs pulled from the queue.  The returned value is stored
/// on the job record as its result.
#[async_trait]
pub trait JobHandler<J: JobPayload>: Send + Sync {
    async fn handle(&self, job: &J) -> anyhow::Result<serde_json::Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A job as written to a [`JobLog`], with its payload as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub data: serde_json::Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes ready again.
    pub retry_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
}

/// Durable record of a queue's jobs.
#[async_trait]
pub trait JobLog: Send + Sync {
    /// Insert the job or overwrite its previous record.
    async fn save_job(&self, job: &StoredJob) -> Result<(), QueueError>;

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), QueueError>;

    /// Every job recorded for `queue`, oldest first.
    async fn load_jobs(&self, queue: &str) -> Result<Vec<StoredJob>, QueueError>;
}

/// How failed attempts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry; doubled for every retry after.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff.saturating_mul(multiplier)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// How many finished jobs are kept, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_age: Duration,
    pub max_count: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub retry: RetryPolicy,
    pub keep_completed: Retention,
    pub keep_failed: Retention,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "payroll".to_string(),
            retry: RetryPolicy::default(),
            keep_completed: Retention {
                max_age: Duration::from_secs(3600),
                max_count: 100,
            },
            keep_failed: Retention {
                max_age: Duration::from_secs(7 * 24 * 3600),
                max_count: 1000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Everything known about one job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord<J> {
    pub id: JobId,
    pub name: &'static str,
    pub data: J,
    pub state: JobState,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    #[serde(skip)]
    ready_at: Option<Instant>,
    #[serde(skip)]
    finished: Option<Instant>,
}

impl<J: JobPayload> JobRecord<J> {
    fn to_stored(&self, queue: &str) -> Result<StoredJob, QueueError> {
        Ok(StoredJob {
            id: self.id,
            queue: queue.to_string(),
            name: self.name.to_string(),
            data: serde_json::to_value(&self.data)
                .map_err(|e| QueueError::Persistence(format!("job {}: {}", self.id, e)))?,
            state: self.state,
            attempts_made: self.attempts_made,
            created_at: self.created_at,
            processed_at: self.processed_at,
            finished_at: self.finished_at,
            retry_at: self.retry_at,
            failed_reason: self.failed_reason.clone(),
            return_value: self.return_value.clone(),
        })
    }

    /// Rebuild a record from the log.  Jobs that were running when the
    /// process stopped go back to waiting; their attempt still counts.
    fn restore(stored: StoredJob) -> Result<Self, QueueError> {
        let data: J = serde_json::from_value(stored.data)
            .map_err(|e| QueueError::Persistence(format!("job {}: {}", stored.id, e)))?;
        let now = Instant::now();
        let state = match stored.state {
            JobState::Active => JobState::Waiting,
            other => other,
        };
        let ready_at = match state {
            JobState::Delayed => Some(now + until(stored.retry_at)),
            _ => None,
        };
        let finished = stored
            .finished_at
            .filter(|_| matches!(state, JobState::Completed | JobState::Failed))
            .map(|at| now.checked_sub(since(at)).unwrap_or(now));
        Ok(Self {
            id: stored.id,
            name: data.name(),
            data,
            state,
            attempts_made: stored.attempts_made,
            created_at: stored.created_at,
            processed_at: stored.processed_at,
            finished_at: stored.finished_at,
            retry_at: stored.retry_at,
            failed_reason: stored.failed_reason,
            return_value: stored.return_value,
            ready_at,
            finished,
        })
    }
}

/// Wall-clock time left until `at`, zero if it has passed.
fn until(at: Option<DateTime<Utc>>) -> Duration {
    at.and_then(|at| (at - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Wall-clock time elapsed since `at`.
fn since(at: DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or(Duration::ZERO)
}

/// Job counts per state, for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

struct QueueState<J> {
    jobs: HashMap<JobId, JobRecord<J>>,
    waiting: VecDeque<JobId>,
    delayed: Vec<JobId>,
    active: usize,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    closed: bool,
}

impl<J> QueueState<J> {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            waiting: VecDeque::new(),
            delayed: Vec::new(),
            active: 0,
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            closed: false,
        }
    }

    /// Move delayed jobs whose backoff has elapsed to the waiting line.
    fn promote_due(&mut self, now: Instant) {
        let jobs = &mut self.jobs;
        let waiting = &mut self.waiting;
        self.delayed.retain(|id| match jobs.get_mut(id) {
            Some(job) if job.ready_at.is_some_and(|at| at <= now) => {
                job.state = JobState::Waiting;
                job.ready_at = None;
                job.retry_at = None;
                waiting.push_back(*id);
                false
            }
            Some(_) => true,
            None => false,
        });
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed
            .iter()
            .filter_map(|id| self.jobs.get(id).and_then(|j| j.ready_at))
            .min()
    }

    /// Drop finished jobs beyond the retention limits, oldest first.
    /// Returns the ids removed.
    fn trim(&mut self, state: JobState, retention: Retention) -> Vec<JobId> {
        let now = Instant::now();
        let list = match state {
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            _ => return Vec::new(),
        };
        let mut removed = Vec::new();
        while let Some(id) = list.front().copied() {
            let expired = self
                .jobs
                .get(&id)
                .and_then(|j| j.finished)
                .map_or(true, |at| now.saturating_duration_since(at) > retention.max_age);
            if list.len() <= retention.max_count && !expired {
                break;
            }
            list.pop_front();
            self.jobs.remove(&id);
            removed.push(id);
        }
        removed
    }
}

/// A job handed to a worker.
struct Claimed<J> {
    id: JobId,
    data: J,
    attempt: u32,
}

enum Poll<J> {
    Ready(Claimed<J>),
    Idle { next_due: Option<Instant> },
}

struct QueueInner<J> {
    config: QueueConfig,
    state: Mutex<QueueState<J>>,
    available: Notify,
    log: Option<Arc<dyn JobLog>>,
}

/// Cloneable handle to a named job queue.
pub struct JobQueue<J> {
    inner: Arc<QueueInner<J>>,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<J: JobPayload> JobQueue<J> {
    /// A queue that lives only in this process.
    pub fn new(config: QueueConfig) -> Self {
        Self::build(config, None)
    }

    /// A queue backed by `log`.  Jobs recorded under the queue's name
    /// are loaded first: waiting and running jobs are queued again,
    /// delayed jobs keep their remaining backoff, and finished jobs are
    /// kept for inspection while their retention allows.
    pub async fn open(config: QueueConfig, log: Arc<dyn JobLog>) -> Result<Self, QueueError> {
        let stored = log.load_jobs(&config.name).await?;
        let queue = Self::build(config, Some(log));

        let mut guard = queue.inner.state.lock().await;
        let state = &mut *guard;
        for stored in stored {
            let id = stored.id;
            let was_active = stored.state == JobState::Active;
            let job = match JobRecord::<J>::restore(stored) {
                Ok(job) => job,
                Err(e) => {
                    warn!(queue = %queue.name(), job_id = %id, error = %e, "Skipping unreadable job");
                    continue;
                }
            };
            if was_active {
                queue.save_or_warn(&job).await;
            }
            match job.state {
                JobState::Waiting | JobState::Active => state.waiting.push_back(id),
                JobState::Delayed => state.delayed.push(id),
                JobState::Completed => state.completed.push_back(id),
                JobState::Failed => state.failed.push_back(id),
            }
            state.jobs.insert(id, job);
        }

        let jobs = &state.jobs;
        for list in [&mut state.completed, &mut state.failed] {
            list.make_contiguous()
                .sort_by_key(|id| jobs.get(id).and_then(|j| j.finished));
        }
        let mut expired = state.trim(JobState::Completed, queue.inner.config.keep_completed);
        expired.extend(state.trim(JobState::Failed, queue.inner.config.keep_failed));
        queue.forget(&expired).await;

        info!(
            queue = %queue.name(),
            waiting = state.waiting.len(),
            delayed = state.delayed.len(),
            completed = state.completed.len(),
            failed = state.failed.len(),
            "Job queue restored"
        );
        drop(guard);
        Ok(queue)
    }

    fn build(config: QueueConfig, log: Option<Arc<dyn JobLog>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::new()),
                available: Notify::new(),
                log,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Write the job's current record to the log, if there is one.
    async fn save(&self, job: &JobRecord<J>) -> Result<(), QueueError> {
        let Some(log) = &self.inner.log else {
            return Ok(());
        };
        log.save_job(&job.to_stored(&self.inner.config.name)?).await
    }

    async fn save_or_warn(&self, job: &JobRecord<J>) {
        if let Err(e) = self.save(job).await {
            warn!(queue = %self.inner.config.name, job_id = %job.id, error = %e, "Failed to record job state");
        }
    }

    async fn forget(&self, ids: &[JobId]) {
        let Some(log) = &self.inner.log else {
            return;
        };
        if ids.is_empty() {
            return;
        }
        if let Err(e) = log.delete_jobs(ids).await {
            warn!(queue = %self.inner.config.name, jobs = ids.len(), error = %e, "Failed to delete expired jobs");
        }
    }

    /// Submit a job.  It runs as soon as a worker is free.  With a log,
    /// the job is recorded before it becomes visible to workers.
    pub async fn add(&self, data: J) -> Result<JobId, QueueError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed(self.inner.config.name.clone()));
        }
        let id = JobId(Uuid::new_v4());
        let name = data.name();
        let job = JobRecord {
            id,
            name,
            data,
            state: JobState::Waiting,
            attempts_made: 0,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            retry_at: None,
            failed_reason: None,
            return_value: None,
            ready_at: None,
            finished: None,
        };
        self.save(&job).await?;
        state.jobs.insert(id, job);
        state.waiting.push_back(id);
        drop(state);

        debug!(queue = %self.inner.config.name, job_id = %id, job = name, "Job added");
        self.inner.available.notify_one();
        Ok(id)
    }

    /// Stop accepting new jobs.  Jobs already queued still run.
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
    }

    pub async fn counts(&self) -> QueueCounts {
        let state = self.inner.state.lock().await;
        QueueCounts {
            waiting: state.waiting.len(),
            delayed: state.delayed.len(),
            active: state.active,
            completed: state.completed.len(),
            failed: state.failed.len(),
        }
    }

    pub async fn job(&self, id: JobId) -> Option<JobRecord<J>> {
        self.inner.state.lock().await.jobs.get(&id).cloned()
    }

    /// Retained failed jobs, oldest first.
    pub async fn failed_jobs(&self) -> Vec<JobRecord<J>> {
        let state = self.inner.state.lock().await;
        state.failed.iter().filter_map(|id| state.jobs.get(id).cloned()).collect()
    }

    /// Retained completed jobs, oldest first.
    pub async fn completed_jobs(&self) -> Vec<JobRecord<J>> {
        let state = self.inner.state.lock().await;
        state
            .completed
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    async fn poll(&self) -> Poll<J> {
        let mut state = self.inner.state.lock().await;
        state.promote_due(Instant::now());
        while let Some(id) = state.waiting.pop_front() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.state = JobState::Active;
            job.attempts_made += 1;
            job.processed_at = Some(Utc::now());
            let claimed = Claimed {
                id,
                data: job.data.clone(),
                attempt: job.attempts_made,
            };
            state.active += 1;
            if let Some(job) = state.jobs.get(&id) {
                self.save_or_warn(job).await;
            }
            return Poll::Ready(claimed);
        }
        Poll::Idle {
            next_due: state.next_due(),
        }
    }

    async fn complete(&self, id: JobId, value: serde_json::Value) {
        let mut state = self.inner.state.lock().await;
        state.active = state.active.saturating_sub(1);
        if let Some(job) = state.jobs.get_mut(&id) {
            job.state = JobState::Completed;
            job.finished_at = Some(Utc::now());
            job.finished = Some(Instant::now());
            job.return_value = Some(value);
            state.completed.push_back(id);
        }
        if let Some(job) = state.jobs.get(&id) {
            self.save_or_warn(job).await;
        }
        let expired = state.trim(JobState::Completed, self.inner.config.keep_completed);
        self.forget(&expired).await;
    }

    /// Record a failed attempt and either schedule a retry or give up.
    async fn fail(&self, id: JobId, reason: String) {
        let retry = self.inner.config.retry;
        let mut state = self.inner.state.lock().await;
        state.active = state.active.saturating_sub(1);
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        job.failed_reason = Some(reason);

        if job.attempts_made < retry.attempts {
            let delay = retry.delay_for_retry(job.attempts_made);
            job.state = JobState::Delayed;
            job.ready_at = Some(Instant::now() + delay);
            job.retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));
            warn!(
                queue = %self.inner.config.name,
                job_id = %id,
                job = job.name,
                attempt = job.attempts_made,
                retry_in_ms = delay.as_millis() as u64,
                "Job attempt failed, retry scheduled"
            );
            state.delayed.push(id);
            if let Some(job) = state.jobs.get(&id) {
                self.save_or_warn(job).await;
            }
            drop(state);
            self.inner.available.notify_one();
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(Utc::now());
            job.finished = Some(Instant::now());
            error!(
                queue = %self.inner.config.name,
                job_id = %id,
                job = job.name,
                attempts = job.attempts_made,
                reason = job.failed_reason.as_deref().unwrap_or_default(),
                "Job failed permanently"
            );
            state.failed.push_back(id);
            if let Some(job) = state.jobs.get(&id) {
                self.save_or_warn(job).await;
            }
            let expired = state.trim(JobState::Failed, self.inner.config.keep_failed);
            self.forget(&expired).await;
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 5 }
    }
}

/// Pulls jobs from a [`JobQueue`] and runs them on at most
/// `concurrency` tasks at a time.
pub struct WorkerPool<J: JobPayload> {
    queue: JobQueue<J>,
    handler: Arc<dyn JobHandler<J>>,
    config: WorkerConfig,
    shutdown: watch::Sender<bool>,
    dispatcher: Option<JoinHandle<()>>,
}

impl<J: JobPayload> WorkerPool<J> {
    pub fn new(queue: JobQueue<J>, handler: Arc<dyn JobHandler<J>>, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            handler,
            config,
            shutdown,
            dispatcher: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Start pulling jobs.  Calling `start` on a running pool does
    /// nothing.
    pub fn start(&mut self) {
        if self.dispatcher.is_some() {
            return;
        }
        self.shutdown.send_replace(false);
        let dispatcher = Dispatcher {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            permits: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            concurrency: self.config.concurrency.max(1),
            shutdown: self.shutdown.subscribe(),
        };
        info!(
            queue = %self.queue.name(),
            concurrency = dispatcher.concurrency,
            "Worker pool started"
        );
        self.dispatcher = Some(tokio::spawn(dispatcher.run()));
    }

    /// Stop pulling jobs and wait for the running ones to finish.
    /// Jobs still waiting stay in the queue.
    pub async fn stop(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        self.shutdown.send_replace(true);
        if let Err(e) = dispatcher.await {
            error!(error = %e, "Worker pool dispatcher panicked");
        }
        info!(queue = %self.queue.name(), "Worker pool stopped");
    }
}

struct Dispatcher<J: JobPayload> {
    queue: JobQueue<J>,
    handler: Arc<dyn JobHandler<J>>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
}

impl<J: JobPayload> Dispatcher<J> {
    async fn run(mut self) {
        'dispatch: loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break 'dispatch,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'dispatch,
                },
            };

            let claimed = loop {
                if *self.shutdown.borrow() {
                    break 'dispatch;
                }
                match self.queue.poll().await {
                    Poll::Ready(claimed) => break claimed,
                    Poll::Idle { next_due } => {
                        let backoff_elapsed = async {
                            match next_due {
                                Some(at) => tokio::time::sleep_until(at).await,
                                None => std::future::pending().await,
                            }
                        };
                        tokio::select! {
                            biased;
                            _ = self.shutdown.changed() => break 'dispatch,
                            _ = self.queue.inner.available.notified() => {}
                            _ = backoff_elapsed => {}
                        }
                    }
                }
            };

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                execute(queue, handler, claimed).await;
                drop(permit);
            });
        }

        // Every permit back means every in-flight job has finished.
        let _ = self.permits.acquire_many(self.concurrency as u32).await;
    }
}

async fn execute<J: JobPayload>(
    queue: JobQueue<J>,
    handler: Arc<dyn JobHandler<J>>,
    claimed: Claimed<J>,
) {
    let Claimed { id, data, attempt } = claimed;
    let name = data.name();
    let span = info_span!("job", job_id = %id, job = name, attempt);

    async move {
        info!("Job started");
        // A panicking handler fails the attempt instead of the worker.
        let outcome =
            tokio::spawn(async move { handler.handle(&data).await }.in_current_span()).await;
        match outcome {
            Ok(Ok(value)) => {
                info!("Job completed");
                queue.complete(id, value).await;
            }
            Ok(Err(e)) => queue.fail(id, format!("{e:#}")).await,
            Err(e) => queue.fail(id, format!("handler panicked: {e}")).await,
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Echo {
        fail_times: u32,
    }

    impl JobPayload for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
    }

    #[derive(Default)]
    struct FlakyHandler {
        calls: AtomicU32,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler<Echo> for FlakyHandler {
        async fn handle(&self, job: &Echo) -> anyhow::Result<serde_json::Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if call <= job.fail_times {
                anyhow::bail!("attempt {call} failed");
            }
            Ok(json!({ "call": call }))
        }
    }

    async fn wait_until_settled<J: JobPayload>(queue: &JobQueue<J>, jobs: usize) -> QueueCounts {
        loop {
            let counts = queue.counts().await;
            if counts.completed + counts.failed == jobs {
                return counts;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[test]
    fn backoff_doubles_from_five_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_are_retried_with_backoff() {
        let queue: JobQueue<Echo> = JobQueue::new(QueueConfig::default());
        let handler = Arc::new(FlakyHandler::default());
        let mut pool = WorkerPool::new(queue.clone(), handler.clone(), WorkerConfig::default());
        pool.start();

        let started = Instant::now();
        let id = queue.add(Echo { fail_times: 2 }).await.unwrap();
        wait_until_settled(&queue, 1).await;

        let job = queue.job(id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.return_value, Some(json!({ "call": 3 })));
        assert!(started.elapsed() >= Duration::from_secs(15));
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_jobs_stay_failed() {
        let queue: JobQueue<Echo> = JobQueue::new(QueueConfig::default());
        let handler = Arc::new(FlakyHandler::default());
        let mut pool = WorkerPool::new(queue.clone(), handler.clone(), WorkerConfig::default());
        pool.start();

        let id = queue.add(Echo { fail_times: 10 }).await.unwrap();
        let counts = wait_until_settled(&queue, 1).await;
        assert_eq!(counts.failed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let failed = queue.failed_jobs().await;
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].failed_reason.as_deref(), Some("attempt 3 failed"));

        // Nothing picks it up again.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let queue: JobQueue<Echo> = JobQueue::new(QueueConfig::default());
        let handler = Arc::new(FlakyHandler::default());
        let mut pool = WorkerPool::new(queue.clone(), handler.clone(), WorkerConfig { concurrency: 2 });
        pool.start();

        for _ in 0..6 {
            queue.add(Echo { fail_times: 0 }).await.unwrap();
        }
        let counts = wait_until_settled(&queue, 6).await;
        assert_eq!(counts.completed, 6);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn completed_jobs_are_trimmed_by_count() {
        let mut config = QueueConfig::default();
        config.keep_completed.max_count = 2;
        let queue: JobQueue<Echo> = JobQueue::new(config);
        let mut pool = WorkerPool::new(
            queue.clone(),
            Arc::new(FlakyHandler::default()),
            WorkerConfig { concurrency: 1 },
        );
        pool.start();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(queue.add(Echo { fail_times: 0 }).await.unwrap());
        }
        while handler_done(&queue, &ids).await < 4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(queue.counts().await.completed, 2);
        assert!(queue.job(ids[0]).await.is_none());
        assert!(queue.job(ids[3]).await.is_some());
        pool.stop().await;
    }

    /// Jobs that are either retained as completed or already trimmed.
    async fn handler_done(queue: &JobQueue<Echo>, ids: &[JobId]) -> usize {
        let mut done = 0;
        for id in ids {
            match queue.job(*id).await {
                None => done += 1,
                Some(job) if job.state == JobState::Completed => done += 1,
                Some(_) => {}
            }
        }
        done
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_running_jobs_and_leaves_the_rest_waiting() {
        let queue: JobQueue<Echo> = JobQueue::new(QueueConfig::default());
        let handler = Arc::new(FlakyHandler::default());
        let mut pool = WorkerPool::new(queue.clone(), handler.clone(), WorkerConfig { concurrency: 1 });
        pool.start();

        queue.add(Echo { fail_times: 0 }).await.unwrap();
        queue.add(Echo { fail_times: 0 }).await.unwrap();
        while queue.counts().await.active == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.stop().await;
        assert!(!pool.is_running());

        let counts = queue.counts().await;
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.waiting, 1);

        pool.start();
        wait_until_settled(&queue, 2).await;
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn completed_jobs_expire_after_an_hour() {
        let queue: JobQueue<Echo> = JobQueue::new(QueueConfig::default());
        let mut pool = WorkerPool::new(
            queue.clone(),
            Arc::new(FlakyHandler::default()),
            WorkerConfig { concurrency: 1 },
        );
        pool.start();

        let early = queue.add(Echo { fail_times: 0 }).await.unwrap();
        wait_until_settled(&queue, 1).await;

        // Still inside the hour: both are kept.
        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        let recent = queue.add(Echo { fail_times: 0 }).await.unwrap();
        wait_until_settled(&queue, 2).await;
        assert!(queue.job(early).await.is_some());

        tokio::time::sleep(Duration::from_secs(45 * 60)).await;
        let late = queue.add(Echo { fail_times: 0 }).await.unwrap();
        while handler_done(&queue, &[early, recent, late]).await < 3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(queue.job(early).await.is_none());
        assert!(queue.job(recent).await.is_some());
        assert!(queue.job(late).await.is_some());
        assert_eq!(queue.counts().await.completed, 2);
        pool.stop().await;
    }

    async fn wait_for_state(queue: &JobQueue<Echo>, id: JobId, state: JobState) {
        while queue.job(id).await.map(|j| j.state) != Some(state) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_outlive_completed_ones() {
        let mut config = QueueConfig::default();
        config.retry.attempts = 1;
        let queue: JobQueue<Echo> = JobQueue::new(config);
        let mut pool = WorkerPool::new(
            queue.clone(),
            Arc::new(FlakyHandler::default()),
            WorkerConfig { concurrency: 1 },
        );
        pool.start();

        let failed = queue.add(Echo { fail_times: 100 }).await.unwrap();
        let completed = queue.add(Echo { fail_times: 0 }).await.unwrap();
        wait_for_state(&queue, failed, JobState::Failed).await;
        wait_for_state(&queue, completed, JobState::Completed).await;

        // Two hours on, a new completion drops the old completed job but
        // the failed one is kept for a week.
        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        let next = queue.add(Echo { fail_times: 0 }).await.unwrap();
        wait_for_state(&queue, next, JobState::Completed).await;
        assert!(queue.job(completed).await.is_none());
        assert_eq!(queue.failed_jobs().await.len(), 1);

        // Past the week, the next failure trims it.
        tokio::time::sleep(Duration::from_secs(8 * 24 * 3600)).await;
        let second_failure = queue.add(Echo { fail_times: 100 }).await.unwrap();
        wait_for_state(&queue, second_failure, JobState::Failed).await;
        assert!(queue.job(failed).await.is_none());
        let kept: Vec<JobId> = queue.failed_jobs().await.iter().map(|j| j.id).collect();
        assert_eq!(kept, vec![second_failure]);
        pool.stop().await;
    }

    /// Job log kept in memory.
    #[derive(Default)]
    struct MemoryLog {
        jobs: Mutex<HashMap<JobId, StoredJob>>,
    }

    #[async_trait]
    impl JobLog for MemoryLog {
        async fn save_job(&self, job: &StoredJob) -> Result<(), QueueError> {
            self.jobs.lock().await.insert(job.id, job.clone());
            Ok(())
        }

        async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), QueueError> {
            let mut jobs = self.jobs.lock().await;
            for id in ids {
                jobs.remove(id);
            }
            Ok(())
        }

        async fn load_jobs(&self, queue: &str) -> Result<Vec<StoredJob>, QueueError> {
            let mut jobs: Vec<StoredJob> = self
                .jobs
                .lock()
                .await
                .values()
                .filter(|j| j.queue == queue)
                .cloned()
                .collect();
            jobs.sort_by_key(|j| j.created_at);
            Ok(jobs)
        }
    }

    fn stored(state: JobState, attempts_made: u32) -> StoredJob {
        StoredJob {
            id: JobId(Uuid::new_v4()),
            queue: "payroll".into(),
            name: "echo".into(),
            data: json!({ "fail_times": 0 }),
            state,
            attempts_made,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            retry_at: None,
            failed_reason: None,
            return_value: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reopened_queue_resumes_unfinished_jobs() {
        let log = Arc::new(MemoryLog::default());
        let waiting = stored(JobState::Waiting, 0);
        let running = stored(JobState::Active, 1);
        let mut delayed = stored(JobState::Delayed, 1);
        delayed.retry_at = Some(Utc::now() + chrono::Duration::seconds(10));
        let mut done = stored(JobState::Completed, 1);
        done.finished_at = Some(Utc::now() - chrono::Duration::minutes(5));
        let mut stale = stored(JobState::Completed, 1);
        stale.finished_at = Some(Utc::now() - chrono::Duration::hours(2));
        for job in [&waiting, &running, &delayed, &done, &stale] {
            log.save_job(job).await.unwrap();
        }

        let queue: JobQueue<Echo> = JobQueue::open(QueueConfig::default(), log.clone())
            .await
            .unwrap();
        assert_eq!(
            queue.counts().await,
            QueueCounts {
                waiting: 2,
                delayed: 1,
                active: 0,
                completed: 1,
                failed: 0,
            }
        );
        assert!(queue.job(stale.id).await.is_none());
        assert!(!log.jobs.lock().await.contains_key(&stale.id));
        assert_eq!(log.jobs.lock().await[&running.id].state, JobState::Waiting);

        let mut pool = WorkerPool::new(
            queue.clone(),
            Arc::new(FlakyHandler::default()),
            WorkerConfig::default(),
        );
        pool.start();
        let started = Instant::now();
        wait_until_settled(&queue, 4).await;
        assert!(started.elapsed() >= Duration::from_secs(9));

        let resumed = queue.job(running.id).await.unwrap();
        assert_eq!(resumed.state, JobState::Completed);
        assert_eq!(resumed.attempts_made, 2);
        // Every transition reached the log.
        let logged = log.jobs.lock().await;
        for id in [waiting.id, running.id, delayed.id] {
            assert_eq!(logged[&id].state, JobState::Completed);
        }
        drop(logged);
        pool.stop().await;
    }

    #[tokio::test]
    async fn closed_queue_rejects_jobs() {
        let queue: JobQueue<Echo> = JobQueue::new(QueueConfig::default());
        queue.close().await;
        assert_eq!(
            queue.add(Echo { fail_times: 0 }).await,
            Err(QueueError::Closed("payroll".into()))
        );
    }
}
