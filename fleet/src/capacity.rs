use std::collections::HashMap;

use crate::job::{JobRecord, JobStatus};

/// Concurrency and queue budget of one backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackendCapacity {
    /// Maximum number of jobs in `created`, `queued_for_start`, `queued`
    /// or `running`.
    pub parallel_jobs: usize,
    /// Maximum number of jobs in `queued`.
    pub queueing_limit: usize,
}

impl BackendCapacity {
    pub fn new(parallel_jobs: usize, queueing_limit: usize) -> Self {
        Self {
            parallel_jobs,
            queueing_limit,
        }
    }

    /// Number of new jobs the backend can take given its current load.
    pub fn free_slots(&self, load: BackendLoad) -> usize {
        let run_capacity = self.parallel_jobs.saturating_sub(load.active);
        let queue_capacity = self.queueing_limit.saturating_sub(load.queued);
        run_capacity.min(queue_capacity)
    }
}

/// Current load of one backend.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BackendLoad {
    /// Jobs in any capacity-occupying state.
    pub active: usize,
    /// Jobs waiting in the backend's queue.
    pub queued: usize,
}

/// Aggregate per-backend load from in-flight records.
///
/// Records without a backend name are ignored.
pub fn load_by_backend<'a>(
    records: impl IntoIterator<Item = &'a JobRecord>,
) -> HashMap<String, BackendLoad> {
    let mut loads: HashMap<String, BackendLoad> = HashMap::new();
    for record in records {
        let Some(backend) = record.backend_name.as_ref() else {
            continue;
        };
        if !record.status.is_active() {
            continue;
        }
        let load = loads.entry(backend.clone()).or_default();
        load.active += 1;
        if record.status == JobStatus::Queued {
            load.queued += 1;
        }
    }
    loads
}
