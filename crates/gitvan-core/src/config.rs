use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

use crate::Priority;

/// Core configuration. Read once from the environment; unrecognised
/// variables are ignored, unparsable values fall back to the default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub queue_concurrency_high: usize,
    pub queue_concurrency_medium: usize,
    pub queue_concurrency_low: usize,
    pub notes_batch_size: usize,
    pub snapshot_max_bytes: u64,
    pub snapshot_max_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_concurrency_high: 3,
            queue_concurrency_medium: 3,
            queue_concurrency_low: 3,
            notes_batch_size: 10,
            snapshot_max_bytes: 64 * 1024 * 1024,
            snapshot_max_entries: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            queue_concurrency_high: env_parse(
                "GITVAN_QUEUE_CONCURRENCY_HIGH",
                d.queue_concurrency_high,
            ),
            queue_concurrency_medium: env_parse(
                "GITVAN_QUEUE_CONCURRENCY_MEDIUM",
                d.queue_concurrency_medium,
            ),
            queue_concurrency_low: env_parse(
                "GITVAN_QUEUE_CONCURRENCY_LOW",
                d.queue_concurrency_low,
            ),
            notes_batch_size: env_parse("GITVAN_RECEIPT_BATCH", d.notes_batch_size),
            snapshot_max_bytes: env_parse("GITVAN_SNAPSHOT_MAX_BYTES", d.snapshot_max_bytes),
            snapshot_max_entries: env_parse(
                "GITVAN_SNAPSHOT_MAX_ENTRIES",
                d.snapshot_max_entries,
            ),
        }
    }

    pub fn concurrency_for(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.queue_concurrency_high,
            Priority::Medium => self.queue_concurrency_medium,
            Priority::Low => self.queue_concurrency_low,
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("ignoring {}={:?}: {}", name, raw, e);
                default
            }
        },
        Err(_) => default,
    }
}
