// Retrain Scheduler
//
// Fires a retraining cycle every remodel interval. At most one cycle runs
// at a time: a tick that finds a job in flight is skipped, never queued.
// Successful cycles are published to the classifier handoff.

use super::handoff::ClassifierHandoff;
use super::retrain::{RetrainOutcome, RetrainPipeline};
use super::RetrainError;
use crate::types::{Generation, QuerySet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Record of one retraining cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainJob {
    pub id: Uuid,
    pub generation: Generation,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub keywords_added: usize,
    pub authors_added: usize,
}

/// Result of a scheduler tick
#[derive(Debug)]
pub enum TickOutcome {
    /// A worker was spawned for the job; the handle resolves to its final status
    Started {
        job_id: Uuid,
        handle: JoinHandle<JobStatus>,
    },
    /// A job was already running
    Skipped,
}

struct SchedulerState {
    pipeline: RetrainPipeline,
    handoff: Arc<ClassifierHandoff>,
    running: AtomicBool,
    generation: AtomicU64,
    current: RwLock<Arc<QuerySet>>,
    history: Mutex<VecDeque<RetrainJob>>,
    history_limit: usize,
}

/// Clears the running flag when the worker finishes, panics included
///
/// A job record still marked Running at that point never reached
/// `finish_job`, so it is closed as Failed.
struct FlightGuard {
    state: Arc<SchedulerState>,
    job_id: Uuid,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.state.abandon_job(self.job_id);
        self.state.running.store(false, Ordering::SeqCst);
    }
}

/// Periodic single-flight retraining
#[derive(Clone)]
pub struct RetrainScheduler {
    state: Arc<SchedulerState>,
    interval: Duration,
}

impl RetrainScheduler {
    pub fn new(
        pipeline: RetrainPipeline,
        handoff: Arc<ClassifierHandoff>,
        initial: QuerySet,
        interval: Duration,
        history_limit: usize,
    ) -> Self {
        Self {
            state: Arc::new(SchedulerState {
                pipeline,
                handoff,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                current: RwLock::new(Arc::new(initial)),
                history: Mutex::new(VecDeque::new()),
                history_limit: history_limit.max(1),
            }),
            interval,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Generation of the last published snapshot (0 before the first)
    pub fn generation(&self) -> Generation {
        Generation(self.state.generation.load(Ordering::SeqCst))
    }

    /// Query of the last published snapshot, or the initial query
    pub fn current_query(&self) -> Arc<QuerySet> {
        self.state.current_query()
    }

    /// Finished and running jobs, oldest first
    pub fn jobs(&self) -> Vec<RetrainJob> {
        self.state.lock_history().iter().cloned().collect()
    }

    pub fn status(&self) -> JobStatus {
        if self.is_running() {
            return JobStatus::Running;
        }
        self.state
            .lock_history()
            .back()
            .map(|job| job.status)
            .unwrap_or(JobStatus::Idle)
    }

    /// Start a job in the background unless one is already running
    pub fn tick(&self) -> TickOutcome {
        if !self.state.try_acquire() {
            tracing::info!("Retrain tick skipped: previous job still running");
            return TickOutcome::Skipped;
        }

        let job = self.state.begin_job();
        let job_id = job.id;
        let guard = FlightGuard {
            state: self.state.clone(),
            job_id,
        };
        let state = self.state.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            match state.execute(job).await {
                Ok(_) => JobStatus::Completed,
                Err(_) => JobStatus::Failed,
            }
        });

        TickOutcome::Started { job_id, handle }
    }

    /// Run one job on the caller's task
    pub async fn run_once(&self) -> Result<RetrainOutcome, RetrainError> {
        if !self.state.try_acquire() {
            return Err(RetrainError::AlreadyRunning);
        }
        let job = self.state.begin_job();
        let _guard = FlightGuard {
            state: self.state.clone(),
            job_id: job.id,
        };
        self.state.execute(job).await
    }

    /// Tick every interval until shutdown
    ///
    /// The first tick fires one full interval after start, once the
    /// ingestion loop has had a window to collect positives.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Starting retrain scheduler (every {:?})", self.interval);

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Stopping retrain scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    if let TickOutcome::Started { job_id, .. } = self.tick() {
                        tracing::debug!("Retrain job {} started", job_id);
                    }
                }
            }
        }
    }
}

impl SchedulerState {
    fn try_acquire(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn current_query(&self) -> Arc<QuerySet> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<RetrainJob>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_job(&self) -> RetrainJob {
        let generation = Generation(self.generation.load(Ordering::SeqCst)).next();
        let job = RetrainJob {
            id: Uuid::new_v4(),
            generation,
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            keywords_added: 0,
            authors_added: 0,
        };

        let mut history = self.lock_history();
        history.push_back(job.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        job
    }

    fn finish_job(&self, id: Uuid, update: impl FnOnce(&mut RetrainJob)) {
        let mut history = self.lock_history();
        if let Some(job) = history.iter_mut().rev().find(|job| job.id == id) {
            update(job);
            job.finished_at = Some(Utc::now());
        }
    }

    /// Close a job that stopped without recording an outcome
    fn abandon_job(&self, id: Uuid) {
        let mut history = self.lock_history();
        if let Some(job) = history
            .iter_mut()
            .rev()
            .find(|job| job.id == id && job.status == JobStatus::Running)
        {
            tracing::error!("Retrain job {} stopped without finishing", id);
            job.status = JobStatus::Failed;
            job.error = Some("retrain worker stopped before finishing".to_string());
            job.finished_at = Some(Utc::now());
        }
    }

    async fn execute(&self, job: RetrainJob) -> Result<RetrainOutcome, RetrainError> {
        tracing::info!("Starting retrain job {} ({})", job.id, job.generation);
        let current = self.current_query();

        match self.pipeline.run(&current, job.generation).await {
            Ok(outcome) => {
                let snapshot = outcome.snapshot.clone();
                *self
                    .current
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.query.clone();
                self.generation
                    .store(snapshot.generation.0, Ordering::SeqCst);
                self.handoff.put(snapshot.clone());

                let (keywords, authors) = (
                    outcome.selection.keywords.len(),
                    outcome.selection.authors.len(),
                );
                self.finish_job(job.id, |record| {
                    record.status = JobStatus::Completed;
                    record.keywords_added = keywords;
                    record.authors_added = authors;
                });

                tracing::info!(
                    "Retrain job {} completed: {} published ({} positives, {} negatives)",
                    job.id,
                    snapshot.generation,
                    snapshot.positives,
                    snapshot.negatives
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!("Retrain job {} failed: {}", job.id, e);
                let message = e.to_string();
                self.finish_job(job.id, |record| {
                    record.status = JobStatus::Failed;
                    record.error = Some(message);
                });
                Err(e)
            }
        }
    }
}
