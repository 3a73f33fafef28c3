use async_trait::async_trait;
use fleet::*;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// [`JobStarter`] creating one job per row, with scripted exceptions.
///
/// The payload carries the row index and all caller columns. Rows can be
/// marked to be skipped or to fail with a given error before any backend
/// call is made.
#[derive(Clone, Default)]
pub struct ScriptedStarter {
    skip: Arc<Mutex<BTreeSet<RowIndex>>>,
    fail: Arc<Mutex<HashMap<RowIndex, BackendError>>>,
    calls: Arc<Mutex<Vec<(RowIndex, String)>>>,
}

impl ScriptedStarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_row(self, row: usize) -> Self {
        self.skip.lock().insert(RowIndex(row));
        self
    }

    pub fn fail_row(self, row: usize, error: BackendError) -> Self {
        self.fail.lock().insert(RowIndex(row), error);
        self
    }

    /// `(row, backend)` of every start attempt, in call order.
    pub fn calls(&self) -> Vec<(RowIndex, String)> {
        self.calls.lock().clone()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.calls.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} start calls, got {}",
            expected, actual
        );
    }
}

#[async_trait]
impl JobStarter for ScriptedStarter {
    async fn start_job(
        &self,
        record: &JobRecord,
        backend: &str,
        connection: Arc<dyn BackendConnection>,
    ) -> Result<Option<RemoteJob>, BackendError> {
        self.calls.lock().push((record.row, backend.to_string()));
        if self.skip.lock().contains(&record.row) {
            return Ok(None);
        }
        let failure = self.fail.lock().get(&record.row).cloned();
        if let Some(error) = failure {
            return Err(error);
        }
        let payload = payload_for(record);
        connection.create_job(&payload).await.map(Some)
    }
}

/// JSON payload describing a row, as sent to `create_job`.
pub fn payload_for(record: &JobRecord) -> serde_json::Value {
    let columns: serde_json::Map<String, serde_json::Value> = record
        .columns
        .iter()
        .map(|(name, value)| (name.clone(), serde_json::Value::String(value.to_string())))
        .collect();
    serde_json::json!({
        "row": record.row.0,
        "columns": columns,
    })
}
