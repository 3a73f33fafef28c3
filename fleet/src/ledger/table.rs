use std::collections::{BTreeMap, HashMap};

use crate::job::{JobRecord, JobStatus, RowIndex};
use crate::ledger::LedgerSchema;

/// Ordered record set shared by the ledger realizations that load the
/// whole table into memory.
#[derive(Clone, Debug, Default)]
pub(crate) struct RecordTable {
    rows: BTreeMap<RowIndex, JobRecord>,
}

impl RecordTable {
    pub(crate) fn from_records(records: impl IntoIterator<Item = JobRecord>) -> Self {
        Self {
            rows: records.into_iter().map(|r| (r.row, r)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn upsert(&mut self, records: &[JobRecord], schema: &LedgerSchema) {
        for record in records {
            let stored = self
                .rows
                .entry(record.row)
                .or_insert_with(|| JobRecord::new(record.row.0));
            stored.merge(record);
            schema.fill_defaults(stored);
        }
    }

    fn matches(statuses: &[JobStatus], record: &JobRecord) -> bool {
        statuses.is_empty() || statuses.contains(&record.status)
    }

    pub(crate) fn count_by_status(&self, statuses: &[JobStatus]) -> HashMap<JobStatus, usize> {
        let mut counts: HashMap<JobStatus, usize> =
            statuses.iter().map(|status| (*status, 0)).collect();
        for record in self.rows.values() {
            if Self::matches(statuses, record) {
                *counts.entry(record.status).or_default() += 1;
            }
        }
        counts
    }

    pub(crate) fn get_by_status(&self, statuses: &[JobStatus], max: Option<usize>) -> Vec<JobRecord> {
        self.rows
            .values()
            .filter(|record| Self::matches(statuses, record))
            .take(max.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub(crate) fn get_by_indices(&self, indices: &[RowIndex]) -> Vec<JobRecord> {
        indices
            .iter()
            .filter_map(|row| self.rows.get(row).cloned())
            .collect()
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.rows.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ColumnValue;

    #[test]
    fn test_upsert_merges_partial_rows() {
        let schema = LedgerSchema::new();
        let mut table = RecordTable::from_records(vec![
            JobRecord::new(0).with_column("year", 2020i64),
            JobRecord::new(1),
        ]);

        let mut update = JobRecord::new(0)
            .with_status(JobStatus::Queued)
            .with_backend("foo");
        update.id = Some("j-1".into());
        table.upsert(&[update], &schema);

        let stored = &table.get_by_indices(&[RowIndex(0)])[0];
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.id.as_deref(), Some("j-1"));
        assert_eq!(stored.column("year"), Some(&ColumnValue::Int(2020)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_queries_keep_ledger_order() {
        let table = RecordTable::from_records(vec![
            JobRecord::new(2),
            JobRecord::new(0),
            JobRecord::new(1).with_status(JobStatus::Finished),
            JobRecord::new(3),
        ]);

        let rows: Vec<_> = table
            .get_by_status(&[JobStatus::NotStarted], Some(2))
            .into_iter()
            .map(|r| r.row)
            .collect();
        assert_eq!(rows, vec![RowIndex(0), RowIndex(2)]);

        let counts = table.count_by_status(&[JobStatus::NotStarted, JobStatus::Running]);
        assert_eq!(counts[&JobStatus::NotStarted], 3);
        assert_eq!(counts[&JobStatus::Running], 0);
        assert!(!counts.contains_key(&JobStatus::Finished));

        assert_eq!(table.count_by_status(&[]).values().sum::<usize>(), 4);
        assert!(table.get_by_indices(&[RowIndex(9)]).is_empty());
    }
}
