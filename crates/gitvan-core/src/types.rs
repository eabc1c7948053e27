use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JobId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// On-disk job record under `.gitvan/queue/<lane>/<id>.json`. The job body
/// itself is never persisted; recovery re-binds it by id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub priority: Priority,
    pub status: JobStatus,
    pub enqueued_at_ms: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lock record stored as a blob behind `refs/gitvan/locks/<name>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: crate::LockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at_ms: u64,
    /// `None` means the lock never expires.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
}

fn default_exclusive() -> bool {
    true
}

impl LockRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.timeout_ms {
            Some(t) => self.acquired_at_ms.saturating_add(t) < now_ms,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn lock_expiry_is_passive_on_the_record() {
        let rec = LockRecord {
            id: crate::LockId::new(),
            fingerprint: None,
            pid: 1,
            hostname: "h".into(),
            acquired_at_ms: 1_000,
            timeout_ms: Some(50),
            exclusive: true,
        };
        assert!(!rec.is_expired(1_040));
        assert!(rec.is_expired(1_051));

        let forever = LockRecord {
            timeout_ms: None,
            ..rec
        };
        assert!(!forever.is_expired(u64::MAX));
    }

    #[test]
    fn priority_lane_names() {
        let names: Vec<&str> = Priority::ALL.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, ["high", "medium", "low"]);
    }

    #[test]
    fn job_record_round_trips() {
        let rec = JobRecord {
            id: JobId::from_str("j1"),
            priority: Priority::Medium,
            status: JobStatus::Queued,
            enqueued_at_ms: 7,
            started_at_ms: None,
            finished_at_ms: None,
            metadata: serde_json::json!({"source": "test"}),
            result: None,
            error: None,
        };
        let text = serde_json::to_string(&rec).unwrap();
        let back: JobRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id.as_str(), "j1");
        assert_eq!(back.priority, Priority::Medium);
        assert_eq!(back.status, JobStatus::Queued);
    }
}
