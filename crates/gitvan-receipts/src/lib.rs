//! Batched NDJSON execution records written into git notes.
//!
//! Three record kinds land on three note refs; a batch flush appends every
//! buffered record for a ref as newline-delimited JSON on the note attached
//! to HEAD. Flushing is all-or-nothing per batch: on failure the batch is
//! retained for retry, so an interrupted flush delivers at least once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gitvan_core::{now_ms, Result};
use gitvan_git::GitRepo;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteKind {
    Results,
    Metrics,
    Executions,
}

impl NoteKind {
    pub const ALL: [NoteKind; 3] = [NoteKind::Results, NoteKind::Metrics, NoteKind::Executions];

    pub fn ref_name(&self) -> &'static str {
        match self {
            NoteKind::Results => "refs/notes/gitvan/results",
            NoteKind::Metrics => "refs/notes/gitvan/metrics",
            NoteKind::Executions => "refs/notes/gitvan/executions",
        }
    }

    fn index(&self) -> usize {
        match self {
            NoteKind::Results => 0,
            NoteKind::Metrics => 1,
            NoteKind::Executions => 2,
        }
    }
}

pub struct ReceiptWriter {
    repo: Arc<GitRepo>,
    batch_size: usize,
    buffers: Mutex<[Vec<Value>; 3]>,
    records_flushed: AtomicU64,
}

impl ReceiptWriter {
    pub fn new(repo: Arc<GitRepo>, batch_size: usize) -> Self {
        Self {
            repo,
            batch_size: batch_size.max(1),
            buffers: Mutex::new(Default::default()),
            records_flushed: AtomicU64::new(0),
        }
    }

    pub async fn write_receipt(
        &self,
        hook_id: &str,
        result: Value,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.push(
            NoteKind::Results,
            json!({
                "hook_id": hook_id,
                "result": result,
                "metadata": metadata.unwrap_or(Value::Null),
                "timestamp_ms": now_ms(),
            }),
        )
        .await
    }

    pub async fn write_metrics(&self, values: Value) -> Result<()> {
        self.push(
            NoteKind::Metrics,
            json!({
                "values": values,
                "timestamp_ms": now_ms(),
            }),
        )
        .await
    }

    pub async fn write_execution(&self, execution_id: &str, details: Value) -> Result<()> {
        self.push(
            NoteKind::Executions,
            json!({
                "execution_id": execution_id,
                "details": details,
                "timestamp_ms": now_ms(),
            }),
        )
        .await
    }

    /// Flush one kind's buffer to its note ref.
    pub async fn flush(&self, kind: NoteKind) -> Result<()> {
        let mut buffers = self.buffers.lock().await;
        self.flush_locked(kind, &mut buffers).await
    }

    /// Flush every kind. All refs are attempted even if one fails; the
    /// first error is returned and its batch retained.
    pub async fn flush_all(&self) -> Result<()> {
        let mut buffers = self.buffers.lock().await;
        let mut first_err = None;
        for kind in NoteKind::ALL {
            if let Err(e) = self.flush_locked(kind, &mut buffers).await {
                warn!("flush of {} failed: {}", kind.ref_name(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Records on the note for `commit` (HEAD when unset), oldest first.
    /// Malformed lines are skipped and logged once per read; each record is
    /// annotated with the owning commit and, when absent, the current branch.
    pub async fn read(&self, kind: NoteKind, commit: Option<&str>) -> Result<Vec<Value>> {
        let target = match commit {
            Some(c) => c.to_string(),
            None => self.repo.head_commit().await?,
        };
        let text = match self.repo.show_note(kind.ref_name(), &target).await? {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };
        let branch = self.repo.current_branch().await?;

        let mut records = Vec::new();
        let mut corrupt = 0usize;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(mut value) => {
                    if let Some(obj) = value.as_object_mut() {
                        obj.insert("commit".to_string(), Value::String(target.clone()));
                        if !obj.contains_key("branch") {
                            if let Some(b) = &branch {
                                obj.insert("branch".to_string(), Value::String(b.clone()));
                            }
                        }
                    }
                    records.push(value);
                }
                Err(_) => corrupt += 1,
            }
        }
        if corrupt > 0 {
            warn!(
                "skipped {} corrupt line(s) in {} note on {}",
                corrupt,
                kind.ref_name(),
                target
            );
        }
        Ok(records)
    }

    /// Drop notes whose target commit is older than the N most recent
    /// commits reachable from HEAD. Returns the number of notes removed.
    pub async fn cleanup_old(&self, keep_recent_commits: usize) -> Result<usize> {
        let recent = self.repo.recent_commits(keep_recent_commits).await?;
        let mut removed = 0;
        for kind in NoteKind::ALL {
            for (_, target) in self.repo.list_notes(kind.ref_name()).await? {
                if !recent.contains(&target) {
                    self.repo.remove_note(kind.ref_name(), &target).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Buffered record counts per kind, in `NoteKind::ALL` order.
    pub async fn pending(&self) -> [usize; 3] {
        let buffers = self.buffers.lock().await;
        [buffers[0].len(), buffers[1].len(), buffers[2].len()]
    }

    /// Buffers are process-local; nothing to adopt at startup.
    pub async fn reconcile(&self) -> Result<usize> {
        Ok(0)
    }

    pub fn records_flushed(&self) -> u64 {
        self.records_flushed.load(Ordering::Relaxed)
    }

    async fn push(&self, kind: NoteKind, record: Value) -> Result<()> {
        let mut buffers = self.buffers.lock().await;
        buffers[kind.index()].push(record);
        if buffers[kind.index()].len() >= self.batch_size {
            // Auto-flush failure keeps the batch; it stays observable via
            // the next flush_all.
            if let Err(e) = self.flush_locked(kind, &mut buffers).await {
                warn!("auto-flush of {} failed: {}", kind.ref_name(), e);
            }
        }
        Ok(())
    }

    async fn flush_locked(&self, kind: NoteKind, buffers: &mut [Vec<Value>; 3]) -> Result<()> {
        let buffer = &mut buffers[kind.index()];
        if buffer.is_empty() {
            return Ok(());
        }

        let commit = self.repo.head_commit().await?;
        let branch = self.repo.current_branch().await?;

        let mut lines = Vec::with_capacity(buffer.len());
        for record in buffer.iter() {
            let mut annotated = record.clone();
            if let Some(obj) = annotated.as_object_mut() {
                obj.insert("commit".to_string(), Value::String(commit.clone()));
                if let Some(b) = &branch {
                    obj.insert("branch".to_string(), Value::String(b.clone()));
                }
            }
            lines.push(annotated.to_string());
        }

        self.repo
            .append_note(kind.ref_name(), &commit, &lines.join("\n"))
            .await?;
        self.records_flushed
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        buffer.clear();
        Ok(())
    }
}
