use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::job::{JobRecord, JobStatus, RowIndex};
use crate::ledger::{JobLedger, LedgerSchema, RecordTable};

/// Process-local ledger.
///
/// Useful for tests and for callers that keep their own durable copy; a
/// crash loses everything.
#[derive(Debug)]
pub struct InMemoryLedger {
    schema: LedgerSchema,
    table: RwLock<Option<RecordTable>>,
}

impl InMemoryLedger {
    pub fn new(schema: LedgerSchema) -> Self {
        Self {
            schema,
            table: RwLock::new(None),
        }
    }

    /// Ledger that already holds `records`.
    pub fn with_records(schema: LedgerSchema, records: Vec<JobRecord>) -> Self {
        let ledger = Self::new(schema);
        {
            let mut table = RecordTable::default();
            table.upsert(&records, &ledger.schema);
            *ledger.table.write() = Some(table);
        }
        ledger
    }

    pub fn len(&self) -> usize {
        self.table.read().as_ref().map_or(0, RecordTable::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobLedger for InMemoryLedger {
    fn location(&self) -> String {
        "memory".to_string()
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        Ok(self.table.read().is_some())
    }

    async fn persist(&self, records: &[JobRecord]) -> anyhow::Result<()> {
        let mut guard = self.table.write();
        guard
            .get_or_insert_with(RecordTable::default)
            .upsert(records, &self.schema);
        Ok(())
    }

    async fn count_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> anyhow::Result<HashMap<JobStatus, usize>> {
        let guard = self.table.read();
        Ok(match guard.as_ref() {
            Some(table) => table.count_by_status(statuses),
            None => RecordTable::default().count_by_status(statuses),
        })
    }

    async fn get_by_status(
        &self,
        statuses: &[JobStatus],
        max: Option<usize>,
    ) -> anyhow::Result<Vec<JobRecord>> {
        Ok(self
            .table
            .read()
            .as_ref()
            .map(|t| t.get_by_status(statuses, max))
            .unwrap_or_default())
    }

    async fn get_by_indices(&self, indices: &[RowIndex]) -> anyhow::Result<Vec<JobRecord>> {
        Ok(self
            .table
            .read()
            .as_ref()
            .map(|t| t.get_by_indices(indices))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ColumnValue;

    #[tokio::test]
    async fn test_persist_creates_and_merges() {
        let ledger = InMemoryLedger::new(LedgerSchema::new().with_column("tile", "none"));
        assert!(!ledger.exists().await.unwrap());

        ledger
            .persist(&[JobRecord::new(0), JobRecord::new(1)])
            .await
            .unwrap();
        assert!(ledger.exists().await.unwrap());
        assert_eq!(ledger.len(), 2);

        let mut update = JobRecord::new(1).with_status(JobStatus::Running);
        update.cpu = Some("3 cpu-seconds".into());
        ledger.persist(&[update]).await.unwrap();

        let running = ledger.get_by_status(&[JobStatus::Running], None).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].cpu.as_deref(), Some("3 cpu-seconds"));
        assert_eq!(
            running[0].column("tile"),
            Some(&ColumnValue::Text("none".into()))
        );
    }
}
