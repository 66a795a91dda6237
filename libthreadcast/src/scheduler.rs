//! Fixed-interval job runner
//!
//! Every registered job gets its own tokio task with its own ticker. A job's
//! loop awaits each execution before taking the next tick, and ticks missed
//! while a slow execution was running are skipped, so a job never overlaps
//! itself. Executions run in a spawned task: errors and panics are logged and
//! the schedule carries on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::coordinator::ThreadPublicationCoordinator;
use crate::db::Database;
use crate::error::Result;
use crate::ingest::MediaIngestor;

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self) -> Result<()>;
}

/// Time from `now` until the next wall-clock multiple of `interval`.
///
/// Zero when `now` is exactly on a boundary.
pub fn next_interval(now: DateTime<Utc>, interval: Duration) -> Duration {
    let period = interval.as_millis().max(1) as i64;
    let elapsed = now.timestamp_millis().rem_euclid(period);
    if elapsed == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((period - elapsed) as u64)
    }
}

/// Run `job` once in its own task, logging how it ended.
///
/// Returns whether the execution succeeded.
pub async fn run_once(job: &Arc<dyn ScheduledJob>) -> bool {
    let task_job = Arc::clone(job);
    let started = Instant::now();

    match tokio::spawn(async move { task_job.execute().await }).await {
        Ok(Ok(())) => {
            debug!(job = job.name(), "Job finished in {:?}", started.elapsed());
            true
        }
        Ok(Err(e)) => {
            error!(job = job.name(), "Job failed: {}", e);
            false
        }
        Err(e) if e.is_panic() => {
            error!(job = job.name(), "Job panicked: {}", e);
            false
        }
        Err(e) => {
            error!(job = job.name(), "Job was cancelled: {}", e);
            false
        }
    }
}

#[derive(Default)]
pub struct JobScheduler {
    jobs: Vec<(Arc<dyn ScheduledJob>, Duration)>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, job: Arc<dyn ScheduledJob>, interval: Duration) {
        info!(job = job.name(), "Scheduled every {:?}", interval);
        self.jobs.push((job, interval));
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every job once, in registration order
    pub async fn run_all_once(&self) -> bool {
        let mut all_ok = true;
        for (job, _) in &self.jobs {
            all_ok &= run_once(job).await;
        }
        all_ok
    }

    /// Run every job on its interval until `shutdown` turns true.
    ///
    /// An execution in flight when shutdown is requested finishes first.
    pub async fn run_until(self, shutdown: watch::Receiver<bool>) {
        let handles: Vec<_> = self
            .jobs
            .into_iter()
            .map(|(job, interval)| tokio::spawn(job_loop(job, interval, shutdown.clone())))
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Job loop ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn job_loop(job: Arc<dyn ScheduledJob>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }

    let start = Instant::now() + next_interval(Utc::now(), interval);
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                run_once(&job).await;
            }
        }
    }
    debug!(job = job.name(), "Job loop stopped");
}

// ============================================================================
// Jobs
// ============================================================================

/// Publishes due threads; runs once per minute
pub struct ProcessPostThreadsJob {
    coordinator: Arc<ThreadPublicationCoordinator>,
}

impl ProcessPostThreadsJob {
    pub fn new(coordinator: Arc<ThreadPublicationCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ScheduledJob for ProcessPostThreadsJob {
    fn name(&self) -> &str {
        "process_post_threads"
    }

    async fn execute(&self) -> Result<()> {
        self.coordinator.process_due_threads().await?;
        Ok(())
    }
}

/// Picks up ingestion jobs whose notification was missed
pub struct ProcessMediaJobsJob {
    ingestor: Arc<MediaIngestor>,
}

impl ProcessMediaJobsJob {
    pub fn new(ingestor: Arc<MediaIngestor>) -> Self {
        Self { ingestor }
    }
}

#[async_trait]
impl ScheduledJob for ProcessMediaJobsJob {
    fn name(&self) -> &str {
        "process_media_jobs"
    }

    async fn execute(&self) -> Result<()> {
        self.ingestor.process_ready_jobs().await?;
        Ok(())
    }
}

/// Deletes finished ingestion jobs older than the retention period
pub struct CleanUpMediaJobsJob {
    db: Database,
    retention: chrono::Duration,
}

impl CleanUpMediaJobsJob {
    pub fn new(db: Database, retention: chrono::Duration) -> Self {
        Self { db, retention }
    }
}

#[async_trait]
impl ScheduledJob for CleanUpMediaJobsJob {
    fn name(&self) -> &str {
        "clean_up_media_jobs"
    }

    async fn execute(&self) -> Result<()> {
        let deleted = self
            .db
            .delete_finished_media_jobs(Utc::now() - self.retention)
            .await?;
        if deleted > 0 {
            info!("Deleted {} finished media job(s)", deleted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThreadcastError;
    use crate::types::{MediaJobState, MediaUploadJob};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingJob {
        runs: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        work: Duration,
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panic {
                panic!("job blew up");
            }
            if self.fail {
                return Err(ThreadcastError::NotFound("thread".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_next_interval_aligns_to_boundary() {
        let minute = Duration::from_secs(60);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 15).unwrap();
        assert_eq!(next_interval(now, minute), Duration::from_secs(45));

        let on_boundary = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap();
        assert_eq!(next_interval(on_boundary, minute), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_run_once_reports_errors_and_panics() {
        let ok: Arc<dyn ScheduledJob> = Arc::new(CountingJob::default());
        let failing: Arc<dyn ScheduledJob> = Arc::new(CountingJob {
            fail: true,
            ..Default::default()
        });
        let panicking: Arc<dyn ScheduledJob> = Arc::new(CountingJob {
            panic: true,
            ..Default::default()
        });

        assert!(run_once(&ok).await);
        assert!(!run_once(&failing).await);
        assert!(!run_once(&panicking).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_keeps_its_schedule() {
        let job = Arc::new(CountingJob {
            panic: true,
            ..Default::default()
        });
        let mut scheduler = JobScheduler::new();
        scheduler.add_job(job.clone(), Duration::from_secs(1));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run_until(rx));
        tokio::time::sleep(Duration::from_millis(5500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(job.runs.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_never_overlaps() {
        let job = Arc::new(CountingJob {
            work: Duration::from_secs(3),
            ..Default::default()
        });
        let mut scheduler = JobScheduler::new();
        scheduler.add_job(job.clone(), Duration::from_secs(1));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run_until(rx));
        tokio::time::sleep(Duration::from_secs(10)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(job.max_running.load(Ordering::SeqCst), 1);
        let runs = job.runs.load(Ordering::SeqCst);
        assert!((2..=4).contains(&runs), "ran {} times", runs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_execution_finishes_on_shutdown() {
        let job = Arc::new(CountingJob {
            work: Duration::from_secs(30),
            ..Default::default()
        });
        let mut scheduler = JobScheduler::new();
        scheduler.add_job(job.clone(), Duration::from_secs(1));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run_until(rx));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(job.running.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(job.running.load(Ordering::SeqCst), 0);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_shut_down_runs_nothing() {
        let job = Arc::new(CountingJob::default());
        let mut scheduler = JobScheduler::new();
        scheduler.add_job(job.clone(), Duration::from_millis(10));

        let (_tx, rx) = watch::channel(true);
        scheduler.run_until(rx).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clean_up_job_deletes_old_finished_jobs() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("jobs.db").to_str().unwrap())
            .await
            .unwrap();

        let mut old = MediaUploadJob::new("old.jpg", "image/jpeg");
        old.state = MediaJobState::Success;
        old.created_at = Utc::now() - chrono::Duration::days(2);
        let mut fresh = MediaUploadJob::new("fresh.jpg", "image/jpeg");
        fresh.state = MediaJobState::Failed;
        let mut waiting = MediaUploadJob::new("waiting.jpg", "image/jpeg");
        waiting.created_at = Utc::now() - chrono::Duration::days(2);
        for job in [&old, &fresh, &waiting] {
            db.insert_media_job(job).await.unwrap();
        }

        let job = CleanUpMediaJobsJob::new(db.clone(), chrono::Duration::hours(24));
        job.execute().await.unwrap();

        assert!(db.get_media_job(&old.id).await.unwrap().is_none());
        assert!(db.get_media_job(&fresh.id).await.unwrap().is_some());
        assert!(db.get_media_job(&waiting.id).await.unwrap().is_some());
    }
}
