//! The master's polling loop: find due jobs, claim them, dispatch them.
//!
//! The loop runs on every replica but only acts while the leader coordinator
//! reports mastership. Claiming a due job is an optimistic-versioned
//! SCHEDULED|RETRY -> EXECUTING update; losing that race (another node
//! briefly believing it is master, or a concurrent cancel) just skips the job
//! for this tick. Dispatches run concurrently under a bounded worker pool and
//! settle their own state-machine transition when they resolve.

use chrono::Utc;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::dispatch::{ExecutionOutcome, ExecutorResolver};
use crate::error::{ErrorCode, Result};
use crate::events::{JobStatusEvent, StatusEventEmitter};
use crate::jobs::{Job, JobStatus};
use crate::observability::metrics as obs;
use crate::repository::JobRepository;

/// How many times settling a dispatch outcome retries after losing an
/// optimistic race against a concurrent cancel request.
const SETTLE_RETRY_LIMIT: u32 = 3;

/// The master-only scheduling loop.
pub struct SchedulerLoop {
    repository: Arc<dyn JobRepository>,
    resolver: Arc<ExecutorResolver>,
    emitter: Arc<dyn StatusEventEmitter>,
    config: SchedulerConfig,
    mastership: watch::Receiver<bool>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicU64>,
}

impl SchedulerLoop {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        resolver: Arc<ExecutorResolver>,
        emitter: Arc<dyn StatusEventEmitter>,
        config: SchedulerConfig,
        mastership: watch::Receiver<bool>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_dispatches));
        Self {
            repository,
            resolver,
            emitter,
            config,
            mastership,
            semaphore,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of dispatches currently executing.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Run the loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent_dispatches,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !*self.mastership.borrow() {
                        continue;
                    }
                    // Storage unavailability skips the tick; the replica does
                    // not crash and the jobs stay eligible.
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        tracing::info!("Scheduler loop stopped");
    }

    /// One poll: claim due jobs and spawn their dispatches.
    ///
    /// Returns the handles of the spawned dispatch tasks (detached in normal
    /// operation; awaited by tests for determinism).
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let now = Utc::now();
        let due = self
            .repository
            .find_due(now, self.config.batch_size)
            .await?;

        let mut handles = Vec::new();
        for job in due {
            // Mastership lost mid-batch: stop claiming, the rest stays
            // eligible for the next master.
            if !*self.mastership.borrow() {
                break;
            }

            let expected = job.version;
            let mut claimed = job;
            if claimed.begin_execution(now).is_err() {
                continue;
            }

            let executing = match self.repository.update(claimed, expected).await {
                Ok(job) => job,
                Err(e) if e.code() == ErrorCode::VersionConflict => {
                    counter!("pulse_transition_conflicts_total").increment(1);
                    tracing::debug!("Lost claim race for a due job; skipping this tick");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to claim due job");
                    continue;
                }
            };
            self.emitter.emit(JobStatusEvent::from_job(&executing));

            // Bounded worker pool: waiting here back-pressures the batch.
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed, shutting down
            };

            let repository = self.repository.clone();
            let resolver = self.resolver.clone();
            let emitter = self.emitter.clone();
            let in_flight = self.in_flight.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                obs::set_dispatches_in_flight(in_flight.fetch_add(1, Ordering::Relaxed) + 1);
                let started = Instant::now();

                let outcome = resolver.dispatch(&executing).await;
                settle(&*repository, &*emitter, executing, outcome, started).await;

                obs::set_dispatches_in_flight(in_flight.fetch_sub(1, Ordering::Relaxed) - 1);
            }));
        }

        Ok(handles)
    }
}

/// Apply the state-machine transition for a resolved dispatch.
///
/// The only concurrent writer on an EXECUTING job is a deferred cancel
/// request, so a version conflict here is re-read and re-applied against the
/// fresh record (which then carries `cancel_requested`).
async fn settle(
    repository: &dyn JobRepository,
    emitter: &dyn StatusEventEmitter,
    job: Job,
    outcome: ExecutionOutcome,
    started: Instant,
) {
    let job_id = job.id;
    let mut current = job;

    for _ in 0..SETTLE_RETRY_LIMIT {
        let expected = current.version;
        let now = Utc::now();

        let transition = match &outcome {
            ExecutionOutcome::Success { .. } => current.complete_execution(now),
            ExecutionOutcome::Retryable { cause } => {
                tracing::warn!(job_id = %job_id, cause = %cause, "Dispatch failed (retryable)");
                current.fail_attempt(now)
            }
            ExecutionOutcome::Fatal { cause } => {
                tracing::error!(job_id = %job_id, cause = %cause, "Dispatch failed (fatal)");
                current.fail_fatal(now)
            }
        };

        let status = match transition {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Illegal settle transition");
                return;
            }
        };

        match repository.update(current.clone(), expected).await {
            Ok(updated) => {
                emitter.emit(JobStatusEvent::from_job(&updated));
                match status {
                    JobStatus::Executed | JobStatus::Scheduled => {
                        obs::record_job_fired(started.elapsed().as_secs_f64());
                    }
                    JobStatus::Retry => obs::record_job_retried(),
                    JobStatus::Error => obs::record_job_failed(),
                    JobStatus::Canceled => {
                        counter!("pulse_jobs_canceled_total").increment(1);
                    }
                    JobStatus::Executing => {}
                }
                tracing::debug!(job_id = %job_id, status = %status, "Dispatch settled");
                return;
            }
            Err(e) if e.code() == ErrorCode::VersionConflict => {
                match repository.get(job_id).await {
                    Ok(Some(fresh)) if fresh.status == JobStatus::Executing => {
                        current = fresh;
                    }
                    Ok(_) => {
                        tracing::warn!(job_id = %job_id, "Job changed underneath an in-flight dispatch");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to re-read job while settling");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to persist dispatch outcome");
                return;
            }
        }
    }

    tracing::error!(job_id = %job_id, "Gave up settling dispatch outcome after repeated conflicts");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::dispatch::JobExecutor;
    use crate::events::EventBus;
    use crate::jobs::{
        BackoffStrategy, CreateJobRequest, JobCorrelation, JobService, Recipient, RecipientKind,
        Trigger,
    };
    use crate::repository::InMemoryRepository;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Scripted executor: returns the configured outcomes in sequence.
    struct ScriptedExecutor {
        outcomes: Vec<ExecutionOutcome>,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<ExecutionOutcome>) -> Self {
            Self {
                outcomes,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        fn kind(&self) -> RecipientKind {
            RecipientKind::Http
        }

        async fn execute(&self, _job: &Job) -> ExecutionOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .get(call)
                .cloned()
                .unwrap_or(ExecutionOutcome::Success { message: None })
        }
    }

    struct Harness {
        repo: Arc<InMemoryRepository>,
        service: JobService,
        scheduler: SchedulerLoop,
        executor: Arc<ScriptedExecutor>,
        mastership_tx: watch::Sender<bool>,
    }

    fn harness(outcomes: Vec<ExecutionOutcome>) -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let bus = Arc::new(EventBus::new(64));
        let executor = Arc::new(ScriptedExecutor::new(outcomes));
        let resolver = Arc::new(ExecutorResolver::new(
            vec![executor.clone() as Arc<dyn JobExecutor>],
            Duration::from_secs(5),
        ));
        let (mastership_tx, mastership_rx) = watch::channel(true);

        let scheduler = SchedulerLoop::new(
            repo.clone(),
            resolver,
            bus.clone(),
            SchedulerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 100,
                max_concurrent_dispatches: 8,
            },
            mastership_rx,
        );
        let service = JobService::new(repo.clone(), bus);

        Harness {
            repo,
            service,
            scheduler,
            executor,
            mastership_tx,
        }
    }

    fn due_request(max_retries: u32) -> CreateJobRequest {
        CreateJobRequest {
            trigger: Trigger::PointInTime {
                fire_time: Utc::now() - chrono::Duration::seconds(1),
            },
            recipient: Recipient::Http {
                url: "https://example.com/cb".to_string(),
                method: "POST".to_string(),
                headers: HashMap::new(),
                payload: None,
            },
            correlation: JobCorrelation::default(),
            max_retries,
            backoff: BackoffStrategy::fixed(0),
            execution_timeout_ms: None,
        }
    }

    async fn drain(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_due_job_executes_successfully() {
        let h = harness(vec![ExecutionOutcome::Success { message: None }]);
        let job = h.service.create(due_request(0)).await.unwrap();

        drain(h.scheduler.tick().await.unwrap()).await;

        let settled = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(settled.status, JobStatus::Executed);
        assert_eq!(settled.executions, 1);
        assert_eq!(h.executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let h = harness(vec![
            ExecutionOutcome::Retryable { cause: "500".into() },
            ExecutionOutcome::Retryable { cause: "500".into() },
            ExecutionOutcome::Success { message: None },
        ]);
        let job = h.service.create(due_request(2)).await.unwrap();

        // Attempt 1: -> RETRY(1). Zero backoff keeps it due.
        drain(h.scheduler.tick().await.unwrap()).await;
        let after_first = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(after_first.status, JobStatus::Retry);
        assert_eq!(after_first.retries, 1);

        // Attempt 2: -> RETRY(2).
        drain(h.scheduler.tick().await.unwrap()).await;
        let after_second = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(after_second.status, JobStatus::Retry);
        assert_eq!(after_second.retries, 2);

        // Attempt 3: -> EXECUTED.
        drain(h.scheduler.tick().await.unwrap()).await;
        let settled = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(settled.status, JobStatus::Executed);
        assert_eq!(h.executor.calls(), 3);
        assert!(settled.retries <= settled.max_retries);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_error() {
        let h = harness(vec![
            ExecutionOutcome::Retryable { cause: "500".into() },
            ExecutionOutcome::Retryable { cause: "500".into() },
        ]);
        let job = h.service.create(due_request(1)).await.unwrap();

        drain(h.scheduler.tick().await.unwrap()).await;
        drain(h.scheduler.tick().await.unwrap()).await;

        let settled = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(settled.status, JobStatus::Error);
        assert_eq!(settled.retries, 1);

        // No further dispatch attempts for a terminal job.
        drain(h.scheduler.tick().await.unwrap()).await;
        assert_eq!(h.executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_retries() {
        let h = harness(vec![ExecutionOutcome::Fatal { cause: "400".into() }]);
        let job = h.service.create(due_request(5)).await.unwrap();

        drain(h.scheduler.tick().await.unwrap()).await;

        let settled = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(settled.status, JobStatus::Error);
        assert_eq!(settled.retries, 0);
        assert_eq!(h.executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_not_master_does_not_fire() {
        let h = harness(vec![ExecutionOutcome::Success { message: None }]);
        let job = h.service.create(due_request(0)).await.unwrap();

        h.mastership_tx.send(false).unwrap();
        // run() gates on mastership before calling tick(); emulate one gated poll.
        if *h.scheduler.mastership.borrow() {
            drain(h.scheduler.tick().await.unwrap()).await;
        }

        let unchanged = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, JobStatus::Scheduled);
        assert_eq!(h.executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_canceled_job_is_never_dispatched() {
        let h = harness(vec![ExecutionOutcome::Success { message: None }]);
        let job = h.service.create(due_request(0)).await.unwrap();
        h.service.cancel(job.id).await.unwrap();

        drain(h.scheduler.tick().await.unwrap()).await;

        let unchanged = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, JobStatus::Canceled);
        assert_eq!(h.executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_lost_claim_race_skips_job_this_tick() {
        // Repository wrapper that fails the first optimistic update, as if a
        // second master claimed the job between find_due and the claim.
        struct ConflictOnce {
            inner: Arc<InMemoryRepository>,
            conflicted: AtomicUsize,
        }

        #[async_trait]
        impl crate::repository::JobRepository for ConflictOnce {
            async fn save(&self, job: Job) -> crate::error::Result<Job> {
                self.inner.save(job).await
            }
            async fn get(&self, id: crate::jobs::JobId) -> crate::error::Result<Option<Job>> {
                self.inner.get(id).await
            }
            async fn find_due(
                &self,
                now: chrono::DateTime<Utc>,
                limit: u32,
            ) -> crate::error::Result<Vec<Job>> {
                self.inner.find_due(now, limit).await
            }
            async fn update(&self, job: Job, expected: i64) -> crate::error::Result<Job> {
                if self.conflicted.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(crate::error::PulseError::version_conflict(job.id.to_string()));
                }
                self.inner.update(job, expected).await
            }
            async fn delete(&self, id: crate::jobs::JobId) -> crate::error::Result<()> {
                self.inner.delete(id).await
            }
            async fn count_by_status(
                &self,
            ) -> crate::error::Result<HashMap<JobStatus, u64>> {
                self.inner.count_by_status().await
            }
            async fn ping(&self) -> crate::error::Result<()> {
                self.inner.ping().await
            }
        }

        let inner = Arc::new(InMemoryRepository::new());
        let repo = Arc::new(ConflictOnce {
            inner: inner.clone(),
            conflicted: AtomicUsize::new(0),
        });
        let bus = Arc::new(EventBus::new(64));
        let executor = Arc::new(ScriptedExecutor::new(vec![ExecutionOutcome::Success {
            message: None,
        }]));
        let resolver = Arc::new(ExecutorResolver::new(
            vec![executor.clone() as Arc<dyn JobExecutor>],
            Duration::from_secs(5),
        ));
        let (_tx, rx) = watch::channel(true);
        let scheduler = SchedulerLoop::new(
            repo.clone(),
            resolver,
            bus.clone(),
            SchedulerConfig::default(),
            rx,
        );
        let service = JobService::new(repo.clone(), bus);
        let job = service.create(due_request(0)).await.unwrap();

        // First tick loses the claim race: no dispatch, job untouched.
        drain(scheduler.tick().await.unwrap()).await;
        let skipped = inner.get(job.id).await.unwrap().unwrap();
        assert_eq!(skipped.status, JobStatus::Scheduled);
        assert_eq!(executor.calls(), 0);

        // Still eligible: the next tick claims and fires it.
        drain(scheduler.tick().await.unwrap()).await;
        let settled = inner.get(job.id).await.unwrap().unwrap();
        assert_eq!(settled.status, JobStatus::Executed);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_recurring_job_reschedules_after_fire() {
        let h = harness(vec![
            ExecutionOutcome::Success { message: None },
            ExecutionOutcome::Success { message: None },
        ]);
        let mut request = due_request(0);
        request.trigger = Trigger::Interval {
            repeat_limit: 2,
            delay: Duration::from_secs(3600),
        };
        let job = h.service.create(request).await.unwrap();
        // Pull the first fire into the past so the tick sees it due.
        let mut stored = h.repo.get(job.id).await.unwrap().unwrap();
        stored.fire_time = Utc::now() - chrono::Duration::seconds(1);
        let stored_version = stored.version;
        h.repo.update(stored, stored_version).await.unwrap();

        drain(h.scheduler.tick().await.unwrap()).await;

        let rescheduled = h.repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(rescheduled.status, JobStatus::Scheduled);
        assert_eq!(rescheduled.executions, 1);
        assert!(rescheduled.fire_time > Utc::now());

        // Not due again yet.
        drain(h.scheduler.tick().await.unwrap()).await;
        assert_eq!(h.executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_deferred_cancel_applies_after_attempt() {
        // Executor slow enough for a cancel to land mid-flight.
        struct BlockingExecutor {
            release: tokio::sync::Notify,
        }

        #[async_trait]
        impl JobExecutor for BlockingExecutor {
            fn kind(&self) -> RecipientKind {
                RecipientKind::Http
            }

            async fn execute(&self, _job: &Job) -> ExecutionOutcome {
                self.release.notified().await;
                ExecutionOutcome::Success { message: None }
            }
        }

        let repo = Arc::new(InMemoryRepository::new());
        let bus = Arc::new(EventBus::new(64));
        let executor = Arc::new(BlockingExecutor {
            release: tokio::sync::Notify::new(),
        });
        let resolver = Arc::new(ExecutorResolver::new(
            vec![executor.clone() as Arc<dyn JobExecutor>],
            Duration::from_secs(30),
        ));
        let (_tx, rx) = watch::channel(true);
        let scheduler = SchedulerLoop::new(
            repo.clone(),
            resolver,
            bus.clone(),
            SchedulerConfig::default(),
            rx,
        );
        let service = JobService::new(repo.clone(), bus);

        let job = service.create(due_request(0)).await.unwrap();
        let handles = scheduler.tick().await.unwrap();

        // The attempt is in flight; cancellation is deferred, not immediate.
        let mid = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(mid.status, JobStatus::Executing);
        let deferred = service.cancel(job.id).await.unwrap();
        assert_eq!(deferred.status, JobStatus::Executing);
        assert!(deferred.cancel_requested);

        // Let the attempt resolve; the cancel is applied on settle.
        executor.release.notify_waiters();
        drain(handles).await;

        let settled = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(settled.status, JobStatus::Canceled);
    }
}
