//! Single entry point over the git-backed coordination components: locks,
//! snapshots, receipts and the job queue share one repository handle and
//! one configuration.
//!
//! Typical lifecycle: `open` (or `open_with`), `initialize` to adopt any
//! crashed state, run jobs, `shutdown` to drain and flush.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

pub use gitvan_core::{
    Config, Error, JobId, JobRecord, JobStatus, LockId, LockRecord, Priority, Result,
};
pub use gitvan_git::GitRepo;
pub use gitvan_locks::{AcquireOptions, LockManager};
pub use gitvan_queue::{JobFn, JobFuture, QueueManager, QueueStatistics, QueueStatus};
pub use gitvan_receipts::{NoteKind, ReceiptWriter};
pub use gitvan_snapshots::{CacheStatistics, CleanupOptions, SnapshotHeader, SnapshotStore};

/// What `initialize` found and repaired.
#[derive(Debug, Default)]
pub struct InitReport {
    /// Job records reset to `queued`; re-bind bodies via `resume_job`.
    pub recovered_jobs: Vec<JobRecord>,
    pub receipts_recovered: usize,
    pub locks_cleaned: usize,
}

#[derive(Debug)]
pub struct CoordinatorStatus {
    pub locks_held: usize,
    pub cache: CacheStatistics,
    /// Buffered receipt counts in `NoteKind::ALL` order.
    pub receipts_pending: [usize; 3],
    pub queue: QueueStatus,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CoordinatorStatistics {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub receipts_flushed: u64,
    pub cache: CacheStatistics,
}

pub struct Coordinator {
    repo: Arc<GitRepo>,
    locks: LockManager,
    snapshots: SnapshotStore,
    receipts: ReceiptWriter,
    queue: QueueManager,
    shut_down: AtomicBool,
}

impl Coordinator {
    /// Open against `root` with configuration from the environment.
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self::open_with(root, Config::from_env())
    }

    pub fn open_with(root: impl AsRef<Path>, config: Config) -> Self {
        let repo = Arc::new(GitRepo::open(root.as_ref()));
        Self {
            locks: LockManager::new(repo.clone()),
            snapshots: SnapshotStore::new(repo.clone(), &config),
            receipts: ReceiptWriter::new(repo.clone(), config.notes_batch_size),
            queue: QueueManager::new(root.as_ref(), &config),
            repo,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Verify the repository and adopt prior state: crashed job records go
    /// back to `queued`, expired locks are swept.
    pub async fn initialize(&self) -> Result<InitReport> {
        self.repo.ensure_repo().await?;
        let report = self.reconcile().await?;
        info!(
            recovered_jobs = report.recovered_jobs.len(),
            locks_cleaned = report.locks_cleaned,
            "coordinator initialized"
        );
        Ok(report)
    }

    /// Re-run reconciliation on demand: queue records first, then receipt
    /// buffers, then the expired-lock sweep. `initialize` calls this after
    /// checking the repository.
    pub async fn reconcile(&self) -> Result<InitReport> {
        Ok(InitReport {
            recovered_jobs: self.queue.reconcile()?,
            receipts_recovered: self.receipts.reconcile().await?,
            locks_cleaned: self.locks.cleanup_expired().await?,
        })
    }

    // Jobs -----------------------------------------------------------------

    /// Run a job on the medium lane.
    pub async fn execute_job<F, Fut>(&self, job: F) -> anyhow::Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.execute_job_at(Priority::Medium, job, None).await
    }

    /// Run a job on a chosen lane, with optional metadata persisted in its
    /// durable record.
    pub async fn execute_job_at<F, Fut>(
        &self,
        priority: Priority,
        job: F,
        metadata: Option<Value>,
    ) -> anyhow::Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.queue
            .add_job(priority, Box::new(move || Box::pin(job())), metadata)
            .await
    }

    /// Re-bind a recovered job record to a fresh body and run it.
    pub async fn resume_job<F, Fut>(&self, id: &JobId, job: F) -> anyhow::Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.queue
            .resume_job(id, Box::new(move || Box::pin(job())))
            .await
    }

    pub fn pause_jobs(&self) {
        self.queue.pause_all();
    }

    pub fn resume_jobs(&self) {
        self.queue.resume_all();
    }

    // Locks ----------------------------------------------------------------

    pub async fn acquire_lock(&self, name: &str, opts: AcquireOptions) -> Result<bool> {
        self.locks.acquire(name, opts).await
    }

    pub async fn release_lock(&self, name: &str, fingerprint: Option<&str>) -> Result<bool> {
        self.locks.release(name, fingerprint).await
    }

    pub async fn is_locked(&self, name: &str) -> Result<bool> {
        self.locks.is_locked(name).await
    }

    pub async fn lock_info(&self, name: &str) -> Result<Option<LockRecord>> {
        self.locks.lock_info(name).await
    }

    pub async fn list_locks(&self) -> Result<Vec<(String, LockRecord)>> {
        self.locks.list().await
    }

    // Snapshots ------------------------------------------------------------

    pub async fn store_snapshot(
        &self,
        key: &str,
        data: Value,
        metadata: Option<Value>,
    ) -> Result<String> {
        self.snapshots.store(key, data, metadata).await
    }

    pub async fn get_snapshot(&self, key: &str, hash: Option<&str>) -> Result<Option<Value>> {
        self.snapshots.get(key, hash).await
    }

    pub async fn has_snapshot(&self, key: &str, hash: Option<&str>) -> Result<bool> {
        self.snapshots.has(key, hash).await
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotHeader>> {
        self.snapshots.list().await
    }

    pub async fn remove_snapshot(&self, key: &str, hash: Option<&str>) -> Result<bool> {
        self.snapshots.remove(key, hash).await
    }

    // Receipts -------------------------------------------------------------

    pub async fn write_receipt(
        &self,
        hook_id: &str,
        result: Value,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.receipts.write_receipt(hook_id, result, metadata).await
    }

    pub async fn write_metrics(&self, values: Value) -> Result<()> {
        self.receipts.write_metrics(values).await
    }

    pub async fn write_execution(&self, execution_id: &str, details: Value) -> Result<()> {
        self.receipts.write_execution(execution_id, details).await
    }

    pub async fn read_receipts(&self, kind: NoteKind, commit: Option<&str>) -> Result<Vec<Value>> {
        self.receipts.read(kind, commit).await
    }

    pub async fn read_metrics(&self, commit: Option<&str>) -> Result<Vec<Value>> {
        self.receipts.read(NoteKind::Metrics, commit).await
    }

    pub async fn read_executions(&self, commit: Option<&str>) -> Result<Vec<Value>> {
        self.receipts.read(NoteKind::Executions, commit).await
    }

    pub async fn flush_receipts(&self) -> Result<()> {
        self.receipts.flush_all().await
    }

    // Maintenance ----------------------------------------------------------

    /// One retention sweep across every component. Returns
    /// `(locks, snapshots, notes)` removal counts.
    pub async fn cleanup(
        &self,
        snapshots: CleanupOptions,
        keep_recent_commits: usize,
    ) -> Result<(usize, usize, usize)> {
        let locks = self.locks.cleanup_expired().await?;
        let snaps = self.snapshots.cleanup(snapshots).await?;
        let notes = self.receipts.cleanup_old(keep_recent_commits).await?;
        Ok((locks, snaps, notes))
    }

    pub fn clear_completed_jobs(&self) -> Result<usize> {
        self.queue.clear_completed()
    }

    // Observation ----------------------------------------------------------

    pub async fn status(&self) -> Result<CoordinatorStatus> {
        Ok(CoordinatorStatus {
            locks_held: self.locks.list().await?.len(),
            cache: self.snapshots.statistics(),
            receipts_pending: self.receipts.pending().await,
            queue: self.queue.status(),
        })
    }

    pub fn statistics(&self) -> CoordinatorStatistics {
        let queue = self.queue.statistics();
        CoordinatorStatistics {
            jobs_completed: queue.completed,
            jobs_failed: queue.failed,
            receipts_flushed: self.receipts.records_flushed(),
            cache: self.snapshots.statistics(),
        }
    }

    /// Pause dispatch, wait up to `deadline` for running jobs to drain,
    /// then close the queue (pending dispatches resolve with `Cancelled`,
    /// their records stay queued for the next reconcile) and flush buffered
    /// receipts. Safe to call more than once.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue.pause_all();

        let start = Instant::now();
        while self.queue.status().running_total() > 0 {
            if start.elapsed() >= deadline {
                warn!(
                    running = self.queue.status().running_total(),
                    "shutdown deadline elapsed with jobs still running"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.queue.close();
        self.receipts.flush_all().await
    }

    // Component access for callers that need the full surface.

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn receipts(&self) -> &ReceiptWriter {
        &self.receipts
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }
}
