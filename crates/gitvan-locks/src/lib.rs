//! Locks stored as git refs under `refs/gitvan/locks/*`.
//!
//! The ref itself is the mutual exclusion: acquisition is an atomic
//! "create ref only if absent" and contention is resolved by git's own
//! ref locking. Lock records are JSON blobs pointed at by the ref.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use gitvan_core::{now_ms, validate_name, Error, LockId, LockRecord, Result};
use gitvan_git::GitRepo;
use tracing::{debug, warn};

const LOCK_PREFIX: &str = "refs/gitvan/locks/";
const SHARED_SEGMENT: &str = "shared";
const TAKEOVER_ATTEMPTS: usize = 3;

#[derive(Clone, Debug)]
pub struct AcquireOptions {
    /// `None` means the lock never expires.
    pub timeout_ms: Option<u64>,
    pub fingerprint: Option<String>,
    pub exclusive: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            fingerprint: None,
            exclusive: true,
        }
    }
}

pub struct LockManager {
    repo: Arc<GitRepo>,
    /// Shared acquisitions made by this process: lock name -> our ref uuid.
    held_shared: Mutex<HashMap<String, String>>,
}

impl LockManager {
    pub fn new(repo: Arc<GitRepo>) -> Self {
        Self {
            repo,
            held_shared: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take the lock. Never blocks and never retries beyond the
    /// bounded CAS loop; callers implement their own wait policy.
    pub async fn acquire(&self, name: &str, opts: AcquireOptions) -> Result<bool> {
        validate_lock_name(name)?;

        let record = LockRecord {
            id: LockId::new(),
            fingerprint: opts.fingerprint.clone(),
            pid: std::process::id(),
            hostname: hostname().to_string(),
            acquired_at_ms: now_ms(),
            timeout_ms: opts.timeout_ms,
            exclusive: opts.exclusive,
        };
        let bytes =
            serde_json::to_vec(&record).map_err(|e| Error::corruption("lock record", e))?;
        let blob_sha = self.repo.write_blob(&bytes).await?;

        if !opts.exclusive {
            let reference = shared_ref(name, record.id.as_str());
            if self.repo.update_ref_if_absent(&reference, &blob_sha).await? {
                self.shared_map().insert(name.to_string(), record.id.as_str().to_string());
                return Ok(true);
            }
            return Ok(false);
        }

        let reference = exclusive_ref(name);
        if self.repo.update_ref_if_absent(&reference, &blob_sha).await? {
            return Ok(true);
        }

        // Holder exists: take over only if it expired, CAS on the sha we saw.
        for _ in 0..TAKEOVER_ATTEMPTS {
            let current = match self.repo.read_ref(&reference).await? {
                Some(sha) => sha,
                None => {
                    if self.repo.update_ref_if_absent(&reference, &blob_sha).await? {
                        return Ok(true);
                    }
                    continue;
                }
            };
            match self.load_record(name, &current).await? {
                Some(holder) if !holder.is_expired(now_ms()) => return Ok(false),
                Some(_) => {}
                None => {}
            }
            if self.repo.update_ref(&reference, &blob_sha, &current).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Idempotent: releasing a lock nobody holds returns `false`. When the
    /// caller supplies a fingerprint it must match the one recorded at
    /// acquire time.
    pub async fn release(&self, name: &str, fingerprint: Option<&str>) -> Result<bool> {
        validate_lock_name(name)?;

        let reference = exclusive_ref(name);
        if let Some(current) = self.repo.read_ref(&reference).await? {
            if let Some(rec) = self.load_record(name, &current).await? {
                if let (Some(supplied), Some(stored)) = (fingerprint, rec.fingerprint.as_deref())
                {
                    if supplied != stored {
                        debug!("fingerprint mismatch releasing lock {}", name);
                        return Ok(false);
                    }
                }
            }
            return self.repo.delete_ref_expecting(&reference, &current).await;
        }

        // Drop our shared registration only once the ref is actually gone;
        // on error the entry stays so the release can be retried.
        let own = self.shared_map().get(name).cloned();
        if let Some(id) = own {
            let deleted = self.repo.delete_ref(&shared_ref(name, &id)).await?;
            self.shared_map().remove(name);
            return Ok(deleted);
        }
        Ok(false)
    }

    /// Expired and stale-blob locks read as unlocked. Never mutates refs.
    pub async fn is_locked(&self, name: &str) -> Result<bool> {
        Ok(self.lock_info(name).await?.is_some())
    }

    /// The live lock record, exclusive first, then any live shared holder.
    pub async fn lock_info(&self, name: &str) -> Result<Option<LockRecord>> {
        validate_lock_name(name)?;

        if let Some(sha) = self.repo.read_ref(&exclusive_ref(name)).await? {
            if let Some(rec) = self.load_record(name, &sha).await? {
                if !rec.is_expired(now_ms()) {
                    return Ok(Some(rec));
                }
            }
        }

        let prefix = format!("{}{}/{}/", LOCK_PREFIX, SHARED_SEGMENT, name);
        for (_, sha) in self.repo.list_refs(&prefix).await? {
            if let Some(rec) = self.load_record(name, &sha).await? {
                if !rec.is_expired(now_ms()) {
                    return Ok(Some(rec));
                }
            }
        }
        Ok(None)
    }

    /// All live locks as `(name, record)` pairs; expired and stale entries
    /// are skipped.
    pub async fn list(&self) -> Result<Vec<(String, LockRecord)>> {
        let mut live = Vec::new();
        for (reference, sha) in self.repo.list_refs(LOCK_PREFIX).await? {
            let name = match lock_name_of(&reference) {
                Some(n) => n,
                None => continue,
            };
            if let Some(rec) = self.load_record(&name, &sha).await? {
                if !rec.is_expired(now_ms()) {
                    live.push((name, rec));
                }
            }
        }
        Ok(live)
    }

    /// Delete every expired or unreadable lock ref. Returns the count.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let mut removed = 0;
        for (reference, sha) in self.repo.list_refs(LOCK_PREFIX).await? {
            let stale = match self.load_record(&reference, &sha).await? {
                Some(rec) => rec.is_expired(now_ms()),
                None => true,
            };
            if stale && self.repo.delete_ref_expecting(&reference, &sha).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every lock ref regardless of state. Returns the count.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        for (reference, _) in self.repo.list_refs(LOCK_PREFIX).await? {
            if self.repo.delete_ref(&reference).await? {
                removed += 1;
            }
        }
        self.shared_map().clear();
        Ok(removed)
    }

    /// A ref pointing at a missing or unparsable blob reads as unlocked.
    async fn load_record(&self, name: &str, sha: &str) -> Result<Option<LockRecord>> {
        let bytes = match self.repo.read_blob(sha).await {
            Ok(b) => b,
            Err(Error::Git { .. }) => {
                warn!("lock {} points at missing blob {}; treating as unlocked", name, sha);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(rec) => Ok(Some(rec)),
            Err(e) => {
                warn!("lock {} record is corrupt ({}); treating as unlocked", name, e);
                Ok(None)
            }
        }
    }

    fn shared_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.held_shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn exclusive_ref(name: &str) -> String {
    format!("{}{}", LOCK_PREFIX, name)
}

fn shared_ref(name: &str, id: &str) -> String {
    format!("{}{}/{}/{}", LOCK_PREFIX, SHARED_SEGMENT, name, id)
}

/// Lock name from a full ref, collapsing shared refs to their lock name.
fn lock_name_of(reference: &str) -> Option<String> {
    let rest = reference.strip_prefix(LOCK_PREFIX)?;
    match rest.strip_prefix("shared/") {
        Some(shared) => shared.split('/').next().map(|s| s.to_string()),
        None => Some(rest.to_string()),
    }
}

fn validate_lock_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if name == SHARED_SEGMENT {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "reserved for shared lock refs",
        });
    }
    Ok(())
}

fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .filter(|out| out.status.success())
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    })
}
