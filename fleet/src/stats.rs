use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable counter names used by the orchestrator and its tasks.
pub mod keys {
    pub const RUN_LOOP: &str = "run_jobs loop";
    pub const SLEEP: &str = "sleep";
    pub const TRACK_STATUSES: &str = "track_statuses";
    pub const JOB_DESCRIBE: &str = "job describe";
    pub const JOB_DESCRIBE_ERROR: &str = "job describe error";
    pub const JOB_GET_STATUS: &str = "job get status";
    pub const JOB_DB_PERSIST: &str = "job_db persist";
    pub const START_JOB_CALL: &str = "start_job call";
    pub const START_JOB_ERROR: &str = "start_job error";
    pub const START_JOB_SKIPPED: &str = "start_job skipped";
    pub const JOB_QUEUED_FOR_START: &str = "job_queued_for_start";
    pub const JOB_QUEUED_FOR_START_FAILED: &str = "job queued for start failed";
    pub const JOB_START_RESUBMITTED: &str = "job start resubmitted";
    pub const JOB_START: &str = "job start";
    pub const JOB_STARTED_RUNNING: &str = "job started running";
    pub const JOB_FINISHED: &str = "job finished";
    pub const JOB_FAILED: &str = "job failed";
    pub const JOB_CANCELED: &str = "job canceled";
    pub const JOB_CANCEL: &str = "job cancel";
    pub const JOB_CANCEL_FAILED: &str = "job cancel failed";
    pub const CALLBACK_ERROR: &str = "lifecycle callback error";
    pub const TOKEN_REFRESH: &str = "token refresh";
    pub const WORKER_RESULT_MERGED: &str = "worker result merged";
    pub const WORKER_RESULT_DROPPED: &str = "worker result dropped";
}

/// Named counters accumulated over one orchestration run.
///
/// Purely observational: nothing in the control loop branches on these.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    counters: BTreeMap<String, u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: &str, amount: u64) {
        *self.counters.entry(key.to_string()).or_insert(0) += amount;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Fold another set of counters into this one.
    pub fn merge(&mut self, other: &Stats) {
        for (key, value) in &other.counters {
            self.add(key, *value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.counters {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
            first = false;
        }
        Ok(())
    }
}

impl<'a> FromIterator<(&'a str, u64)> for Stats {
    fn from_iter<T: IntoIterator<Item = (&'a str, u64)>>(iter: T) -> Self {
        let mut stats = Stats::new();
        for (key, value) in iter {
            stats.add(key, value);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_accumulates() {
        let mut total = Stats::new();
        total.incr(keys::JOB_START);

        let delta: Stats = [(keys::JOB_START, 2), (keys::START_JOB_ERROR, 1)]
            .into_iter()
            .collect();
        total.merge(&delta);

        assert_eq!(total.get(keys::JOB_START), 3);
        assert_eq!(total.get(keys::START_JOB_ERROR), 1);
        assert_eq!(total.get(keys::SLEEP), 0);
    }

    #[test]
    fn test_display_is_sorted() {
        let stats: Stats = [("b", 2), ("a", 1)].into_iter().collect();
        assert_eq!(stats.to_string(), "a: 1, b: 2");
    }
}
