//! Three fixed priority lanes with bounded concurrency and durable job
//! records for crash recovery.
//!
//! Each lane owns an independent FIFO semaphore, so lower lanes are never
//! starved by higher ones. Every job persists a small JSON record under
//! `<repo>/.gitvan/queue/<lane>/<id>.json`; the record is fsynced before a
//! status transition counts. Job bodies are opaque callables and are never
//! persisted; after a crash, `reconcile` resets non-terminal records to
//! `queued` and the application re-binds bodies by id via `resume_job`.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use gitvan_core::{now_ms, Config, Error, JobId, JobRecord, JobStatus, Priority, Result};
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tracing::warn;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
pub type JobFn = Box<dyn FnOnce() -> JobFuture + Send>;

const RESULT_SUMMARY_MAX: usize = 1024;

/// Dispatch gate shared by all lanes. `Closed` is terminal: parked and new
/// dispatches resolve with `Cancelled`, their records stay `queued` on disk
/// for the next reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Gate {
    Open,
    Paused,
    Closed,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LaneStatus {
    pub pending: usize,
    pub running: usize,
    pub concurrency: usize,
    pub paused: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStatus {
    pub high: LaneStatus,
    pub medium: LaneStatus,
    pub low: LaneStatus,
}

impl QueueStatus {
    pub fn lane(&self, priority: Priority) -> &LaneStatus {
        match priority {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    pub fn running_total(&self) -> usize {
        self.high.running + self.medium.running + self.low.running
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStatistics {
    pub completed: u64,
    pub failed: u64,
}

struct Lane {
    sem: Arc<Semaphore>,
    concurrency: usize,
    pending: AtomicUsize,
    running: AtomicUsize,
}

impl Lane {
    fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            sem: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        }
    }
}

pub struct QueueManager {
    root: PathBuf,
    lanes: [Lane; 3],
    gate: watch::Sender<Gate>,
    retain_terminal: bool,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl QueueManager {
    /// `repo_root` is the worktree; records live under
    /// `<repo_root>/.gitvan/queue/`.
    pub fn new(repo_root: &Path, config: &Config) -> Self {
        let (gate, _) = watch::channel(Gate::Open);
        Self {
            root: repo_root.join(".gitvan").join("queue"),
            lanes: [
                Lane::new(config.queue_concurrency_high),
                Lane::new(config.queue_concurrency_medium),
                Lane::new(config.queue_concurrency_low),
            ],
            gate,
            retain_terminal: false,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Keep `completed` records on disk instead of deleting them.
    pub fn retain_terminal(mut self, retain: bool) -> Self {
        self.retain_terminal = retain;
        self
    }

    /// Enqueue a job and await its result. The record is durably `queued`
    /// before this yields to the lane; the job's own error comes back to
    /// the caller on failure.
    pub async fn add_job(
        &self,
        priority: Priority,
        job: JobFn,
        metadata: Option<Value>,
    ) -> anyhow::Result<Value> {
        let record = JobRecord {
            id: JobId::new(),
            priority,
            status: JobStatus::Queued,
            enqueued_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            metadata: metadata.unwrap_or(Value::Null),
            result: None,
            error: None,
        };
        self.persist(&record)?;
        self.dispatch(record, job).await
    }

    /// Re-bind a recovered `queued` record to a new body and dispatch it
    /// through its original lane.
    pub async fn resume_job(&self, id: &JobId, job: JobFn) -> anyhow::Result<Value> {
        for priority in Priority::ALL {
            let path = self.record_path(priority, id);
            if !path.exists() {
                continue;
            }
            let record = self.load_record(&path)?;
            if record.status != JobStatus::Queued {
                anyhow::bail!("job {} is {:?}, not queued", id, record.status);
            }
            return self.dispatch(record, job).await;
        }
        Err(Error::NotFound {
            what: format!("job {}", id),
        }
        .into())
    }

    /// Stop dispatching new jobs. Running jobs are not cancelled.
    pub fn pause_all(&self) {
        self.gate.send_modify(|g| {
            if *g != Gate::Closed {
                *g = Gate::Paused;
            }
        });
    }

    pub fn resume_all(&self) {
        self.gate.send_modify(|g| {
            if *g != Gate::Closed {
                *g = Gate::Open;
            }
        });
    }

    /// Shut the queue for good: every parked or future dispatch resolves
    /// with `Cancelled`. Records stay `queued` on disk so the next process
    /// can reconcile them. There is no reopening.
    pub fn close(&self) {
        self.gate.send_replace(Gate::Closed);
    }

    /// Adopt prior on-disk state: every non-terminal record is reset to
    /// `queued` and returned so the application can re-bind bodies by id.
    /// Call before dispatching new work.
    pub fn reconcile(&self) -> Result<Vec<JobRecord>> {
        let mut recovered = Vec::new();
        for priority in Priority::ALL {
            let dir = self.root.join(priority.as_str());
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    continue;
                }
                let mut record = match self.load_record(&path) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("skipping unreadable job record {}: {}", path.display(), e);
                        continue;
                    }
                };
                if record.status.is_terminal() {
                    continue;
                }
                record.status = JobStatus::Queued;
                record.started_at_ms = None;
                self.persist(&record)?;
                recovered.push(record);
            }
        }
        Ok(recovered)
    }

    /// Remove retained terminal records. Returns the count removed.
    pub fn clear_completed(&self) -> Result<usize> {
        let mut removed = 0;
        for priority in Priority::ALL {
            let dir = self.root.join(priority.as_str());
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    continue;
                }
                match self.load_record(&path) {
                    Ok(rec) if rec.status.is_terminal() => {
                        std::fs::remove_file(&path)
                            .map_err(|e| Error::io(path.display().to_string(), e))?;
                        removed += 1;
                    }
                    Ok(_) => {}
                    Err(_) => {}
                }
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> QueueStatus {
        let paused = *self.gate.borrow() != Gate::Open;
        let lane = |l: &Lane| LaneStatus {
            pending: l.pending.load(Ordering::Relaxed),
            running: l.running.load(Ordering::Relaxed),
            concurrency: l.concurrency,
            paused,
        };
        QueueStatus {
            high: lane(&self.lanes[0]),
            medium: lane(&self.lanes[1]),
            low: lane(&self.lanes[2]),
        }
    }

    pub fn statistics(&self) -> QueueStatistics {
        QueueStatistics {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    async fn dispatch(&self, mut record: JobRecord, job: JobFn) -> anyhow::Result<Value> {
        let lane = self.lane(record.priority);
        lane.pending.fetch_add(1, Ordering::Relaxed);

        // Wait out the gate, then take a lane permit (FIFO). A closed gate
        // drains this dispatch; the queued record survives for reconcile.
        let mut gate = self.gate.subscribe();
        loop {
            let state = *gate.borrow();
            match state {
                Gate::Open => break,
                Gate::Closed => {
                    lane.pending.fetch_sub(1, Ordering::Relaxed);
                    return Err(Error::Cancelled {
                        what: format!("job {}", record.id),
                    }
                    .into());
                }
                Gate::Paused => {
                    if gate.changed().await.is_err() {
                        lane.pending.fetch_sub(1, Ordering::Relaxed);
                        return Err(Error::Cancelled {
                            what: format!("job {}", record.id),
                        }
                        .into());
                    }
                }
            }
        }
        let permit = lane
            .sem
            .clone()
            .acquire_owned()
            .await
            .context("lane closed")?;

        lane.pending.fetch_sub(1, Ordering::Relaxed);
        lane.running.fetch_add(1, Ordering::Relaxed);

        record.status = JobStatus::Running;
        record.started_at_ms = Some(now_ms());
        if let Err(e) = self.persist(&record) {
            lane.running.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
            return Err(e.into());
        }

        let outcome = job().await;

        record.finished_at_ms = Some(now_ms());
        match &outcome {
            Ok(value) => {
                record.status = JobStatus::Completed;
                record.result = Some(summarise(value));
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                record.status = JobStatus::Failed;
                record.error = Some(format!("{:#}", e));
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let path = self.record_path(record.priority, &record.id);
        if record.status == JobStatus::Completed && !self.retain_terminal {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove job record {}: {}", path.display(), e);
                }
            }
        } else if let Err(e) = self.persist(&record) {
            warn!("could not persist terminal job record {}: {}", record.id, e);
        }

        lane.running.fetch_sub(1, Ordering::Relaxed);
        drop(permit);
        outcome
    }

    fn lane(&self, priority: Priority) -> &Lane {
        match priority {
            Priority::High => &self.lanes[0],
            Priority::Medium => &self.lanes[1],
            Priority::Low => &self.lanes[2],
        }
    }

    fn record_path(&self, priority: Priority, id: &JobId) -> PathBuf {
        self.root
            .join(priority.as_str())
            .join(format!("{}.json", id))
    }

    /// Write and fsync the record; a transition only counts once this
    /// returns.
    fn persist(&self, record: &JobRecord) -> Result<()> {
        let dir = self.root.join(record.priority.as_str());
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(dir.display().to_string(), e))?;
        let path = self.record_path(record.priority, &record.id);
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::corruption("job record", e))?;
        let mut file = std::fs::File::create(&path)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        file.write_all(&bytes)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        file.sync_all()
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        Ok(())
    }

    fn load_record(&self, path: &Path) -> Result<JobRecord> {
        let bytes =
            std::fs::read(path).map_err(|e| Error::io(path.display().to_string(), e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::corruption(path.display().to_string(), e))
    }
}

fn summarise(value: &Value) -> Value {
    let rendered = value.to_string();
    if rendered.len() <= RESULT_SUMMARY_MAX {
        value.clone()
    } else {
        json!({ "truncated_bytes": rendered.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    fn manager_with(config: Config) -> (tempfile::TempDir, Arc<QueueManager>) {
        let dir = tempdir().unwrap();
        let mgr = Arc::new(QueueManager::new(dir.path(), &config));
        (dir, mgr)
    }

    fn manager() -> (tempfile::TempDir, Arc<QueueManager>) {
        manager_with(Config::default())
    }

    fn sleepy_job(
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        millis: u64,
    ) -> JobFn {
        Box::new(move || {
            Box::pin(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({"slept_ms": millis}))
            })
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lane_concurrency_is_bounded() {
        let (_dir, mgr) = manager_with(Config {
            queue_concurrency_medium: 2,
            ..Config::default()
        });

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let mgr = mgr.clone();
            let job = sleepy_job(active.clone(), peak.clone(), 30);
            handles.push(tokio::spawn(async move {
                mgr.add_job(Priority::Medium, job, None).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(mgr.statistics().completed, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lanes_do_not_starve_each_other() {
        let (_dir, mgr) = manager_with(Config {
            queue_concurrency_medium: 1,
            ..Config::default()
        });

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let slow_order = order.clone();
        let slow_mgr = mgr.clone();
        let slow = tokio::spawn(async move {
            slow_mgr
                .add_job(
                    Priority::Medium,
                    Box::new(move || {
                        Box::pin(async move {
                            tokio::time::sleep(Duration::from_millis(150)).await;
                            slow_order.lock().unwrap().push("medium");
                            Ok(Value::Null)
                        })
                    }),
                    None,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast_order = order.clone();
        mgr.add_job(
            Priority::Low,
            Box::new(move || {
                Box::pin(async move {
                    fast_order.lock().unwrap().push("low");
                    Ok(Value::Null)
                })
            }),
            None,
        )
        .await
        .unwrap();

        slow.await.unwrap().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["low", "medium"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_gates_dispatch_without_cancelling() {
        let (_dir, mgr) = manager();
        mgr.pause_all();

        let run_mgr = mgr.clone();
        let handle = tokio::spawn(async move {
            run_mgr
                .add_job(
                    Priority::High,
                    Box::new(|| Box::pin(async { Ok(json!("done")) })),
                    None,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = mgr.status();
        assert_eq!(status.high.pending, 1);
        assert_eq!(status.high.running, 0);
        assert!(status.high.paused);

        mgr.resume_all();
        assert_eq!(handle.await.unwrap().unwrap(), json!("done"));
        assert!(!mgr.status().high.paused);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_drains_parked_dispatches_with_cancelled() {
        let (dir, mgr) = manager();
        mgr.pause_all();

        let run_mgr = mgr.clone();
        let parked = tokio::spawn(async move {
            run_mgr
                .add_job(
                    Priority::Medium,
                    Box::new(|| Box::pin(async { Ok(json!("never")) })),
                    None,
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mgr.status().medium.pending, 1);

        mgr.close();
        let err = parked.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));

        // The record stays queued on disk for the next reconcile.
        let lane_dir = dir.path().join(".gitvan/queue/medium");
        let files: Vec<_> = std::fs::read_dir(&lane_dir).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let record: JobRecord =
            serde_json::from_slice(&std::fs::read(files[0].path()).unwrap()).unwrap();
        assert_eq!(record.status, JobStatus::Queued);

        // New dispatches are refused immediately, and a resume cannot reopen.
        mgr.resume_all();
        let err = mgr
            .add_job(
                Priority::High,
                Box::new(|| Box::pin(async { Ok(Value::Null) })),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn completed_records_are_removed_and_failed_retained() {
        let (dir, mgr) = manager();

        mgr.add_job(
            Priority::Medium,
            Box::new(|| Box::pin(async { Ok(json!(1)) })),
            None,
        )
        .await
        .unwrap();

        let err = mgr
            .add_job(
                Priority::Medium,
                Box::new(|| Box::pin(async { anyhow::bail!("boom") })),
                Some(json!({"case": "failure"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        let lane_dir = dir.path().join(".gitvan/queue/medium");
        let files: Vec<_> = std::fs::read_dir(&lane_dir).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let record: JobRecord =
            serde_json::from_slice(&std::fs::read(files[0].path()).unwrap()).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("boom"));
        assert_eq!(record.metadata, json!({"case": "failure"}));

        assert_eq!(mgr.clear_completed().unwrap(), 1);
        assert!(std::fs::read_dir(&lane_dir).unwrap().next().is_none());

        let stats = mgr.statistics();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn reconcile_resets_non_terminal_records() {
        let (dir, mgr) = manager();
        let lane_dir = dir.path().join(".gitvan/queue/medium");
        std::fs::create_dir_all(&lane_dir).unwrap();

        let mut write = |id: &str, status: JobStatus| {
            let rec = JobRecord {
                id: JobId::from_str(id),
                priority: Priority::Medium,
                status,
                enqueued_at_ms: 1,
                started_at_ms: (status == JobStatus::Running).then_some(2),
                finished_at_ms: None,
                metadata: Value::Null,
                result: None,
                error: None,
            };
            std::fs::write(
                lane_dir.join(format!("{}.json", id)),
                serde_json::to_vec_pretty(&rec).unwrap(),
            )
            .unwrap();
        };
        write("interrupted", JobStatus::Running);
        write("waiting", JobStatus::Queued);
        write("done", JobStatus::Completed);
        std::fs::write(lane_dir.join("garbage.json"), b"not json").unwrap();

        let recovered = mgr.reconcile().unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(recovered.iter().all(|r| r.status == JobStatus::Queued));
        assert!(recovered.iter().all(|r| r.started_at_ms.is_none()));

        // Re-bind one recovered job by id and run it to completion.
        let out = mgr
            .resume_job(
                &JobId::from_str("interrupted"),
                Box::new(|| Box::pin(async { Ok(json!("recovered")) })),
            )
            .await
            .unwrap();
        assert_eq!(out, json!("recovered"));
        assert!(!lane_dir.join("interrupted.json").exists());

        // Terminal records are left alone.
        let done: JobRecord =
            serde_json::from_slice(&std::fs::read(lane_dir.join("done.json")).unwrap()).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn resume_job_requires_a_queued_record() {
        let (_dir, mgr) = manager();
        let err = mgr
            .resume_job(
                &JobId::from_str("ghost"),
                Box::new(|| Box::pin(async { Ok(Value::Null) })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
