use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::job::{ColumnMap, ColumnValue, JobRecord, JobStatus, RowIndex};
use crate::ledger::wkt::Geometry;
use crate::ledger::{JobLedger, LedgerSchema, RecordTable, REQUIRED_COLUMNS};

/// Ledger stored as a comma-separated file with a header row.
///
/// Row identity is the line position below the header. Geometry columns are
/// written as WKT. Every write replaces the file atomically via a sibling
/// temporary file, so a crash mid-write leaves the previous version intact.
#[derive(Clone, Debug)]
pub struct CsvLedger {
    path: PathBuf,
    schema: LedgerSchema,
}

impl CsvLedger {
    pub fn new(path: impl Into<PathBuf>, schema: LedgerSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<RecordTable> {
        let this = self.clone();
        let table = tokio::task::spawn_blocking(move || this.read_table()).await??;
        Ok(table)
    }

    fn read_table(&self) -> Result<RecordTable, LedgerError> {
        if !self.path.exists() {
            return Ok(RecordTable::default());
        }
        let location = self.path.display().to_string();
        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| !headers.iter().any(|header| header == *name))
            .collect();
        if !missing.is_empty() {
            return Err(LedgerError::malformed(
                location,
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }

        let mut records = Vec::new();
        for (i, row) in reader.records().enumerate() {
            let row = row?;
            let mut cells = ColumnMap::new();
            for (name, raw) in headers.iter().zip(row.iter()) {
                let value = self
                    .decode_cell(name, raw)
                    .map_err(|message| LedgerError::malformed(format!("{location} row {i}"), message))?;
                cells.insert(name.to_string(), value);
            }
            records.push(self.schema.decode_row(RowIndex(i), cells, &location)?);
        }
        tracing::debug!(ledger = %location, rows = records.len(), "loaded csv ledger");
        Ok(RecordTable::from_records(records))
    }

    fn decode_cell(&self, name: &str, raw: &str) -> Result<ColumnValue, String> {
        if raw.is_empty() {
            return Ok(ColumnValue::Null);
        }
        if LedgerSchema::is_required(name) {
            return Ok(ColumnValue::Text(raw.to_string()));
        }
        if self.schema.is_geometry(name) {
            return raw
                .parse::<Geometry>()
                .map(ColumnValue::Geometry)
                .map_err(|err| format!("column {name}: {err}"));
        }
        Ok(infer_cell(raw))
    }

    fn write_table(&self, table: &RecordTable) -> Result<(), LedgerError> {
        let columns = self.schema.column_order(table.records());
        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut writer = ::csv::Writer::from_path(&tmp)?;
            writer.write_record(&columns)?;
            for record in table.records() {
                let mut cells: HashMap<&str, ColumnValue> =
                    LedgerSchema::encode_required(record).into_iter().collect();
                for (name, value) in &record.columns {
                    cells.insert(name.as_str(), value.clone());
                }
                writer.write_record(
                    columns
                        .iter()
                        .map(|name| cells.get(name.as_str()).map(cell_text).unwrap_or_default()),
                )?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Cell text for a value; missing values and NaN become empty cells.
fn cell_text(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Float(v) if v.is_nan() => String::new(),
        other => other.to_string(),
    }
}

/// Best-effort typing of a caller column read back from text.
fn infer_cell(raw: &str) -> ColumnValue {
    match raw {
        "true" | "True" => return ColumnValue::Bool(true),
        "false" | "False" => return ColumnValue::Bool(false),
        _ => {}
    }
    if let Ok(v) = raw.parse::<i64>() {
        return ColumnValue::Int(v);
    }
    if raw.bytes().any(|b| b.is_ascii_digit()) {
        if let Ok(v) = raw.parse::<f64>() {
            return ColumnValue::Float(v);
        }
    }
    ColumnValue::Text(raw.to_string())
}

#[async_trait]
impl JobLedger for CsvLedger {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    async fn persist(&self, records: &[JobRecord]) -> anyhow::Result<()> {
        let this = self.clone();
        let records = records.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), LedgerError> {
            let mut table = this.read_table()?;
            table.upsert(&records, &this.schema);
            this.write_table(&table)
        })
        .await??;
        Ok(())
    }

    async fn count_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> anyhow::Result<HashMap<JobStatus, usize>> {
        Ok(self.load().await?.count_by_status(statuses))
    }

    async fn get_by_status(
        &self,
        statuses: &[JobStatus],
        max: Option<usize>,
    ) -> anyhow::Result<Vec<JobRecord>> {
        Ok(self.load().await?.get_by_status(statuses, max))
    }

    async fn get_by_indices(&self, indices: &[RowIndex]) -> anyhow::Result<Vec<JobRecord>> {
        Ok(self.load().await?.get_by_indices(indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{parse_timestamp, OnExists};

    #[test]
    fn test_infer_cell() {
        assert_eq!(infer_cell("42"), ColumnValue::Int(42));
        assert_eq!(infer_cell("4.5"), ColumnValue::Float(4.5));
        assert_eq!(infer_cell("True"), ColumnValue::Bool(true));
        assert_eq!(infer_cell("inf"), ColumnValue::Text("inf".into()));
        assert_eq!(infer_cell("31UFS"), ColumnValue::Text("31UFS".into()));
    }

    #[tokio::test]
    async fn test_geometry_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CsvLedger::new(dir.path().join("jobs.csv"), LedgerSchema::new());
        let bbox = Geometry::bbox(5.0, 51.2, 5.1, 51.3);

        let mut record = JobRecord::new(0)
            .with_backend("foo")
            .with_status(JobStatus::Running)
            .with_column("geometry", bbox.clone())
            .with_column("tile", "31UFS")
            .with_column("year", 2021i64);
        record.id = Some("0042".into());
        record.running_start_time = parse_timestamp("2024-05-01T12:00:00Z");
        record.costs = Some(1.25);
        ledger.initialize(vec![record.clone()], OnExists::Error).await.unwrap();

        let back = ledger.records().await.unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0], record);
        assert_eq!(back[0].column("geometry"), Some(&ColumnValue::Geometry(bbox)));
        assert_eq!(back[0].id.as_deref(), Some("0042"));
    }

    #[tokio::test]
    async fn test_persist_does_not_blank_fields() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CsvLedger::new(dir.path().join("jobs.csv"), LedgerSchema::new());
        let mut first = JobRecord::new(0).with_backend("foo").with_status(JobStatus::Queued);
        first.id = Some("j-1".into());
        ledger
            .initialize(vec![first, JobRecord::new(1)], OnExists::Error)
            .await
            .unwrap();

        ledger
            .persist(&[JobRecord::new(0).with_status(JobStatus::Running)])
            .await
            .unwrap();

        let row = &ledger.get_by_indices(&[RowIndex(0)]).await.unwrap()[0];
        assert_eq!(row.status, JobStatus::Running);
        assert_eq!(row.id.as_deref(), Some("j-1"));
        assert_eq!(row.backend_name.as_deref(), Some("foo"));
        let counts = ledger.count_by_status(&[JobStatus::NotStarted]).await.unwrap();
        assert_eq!(counts[&JobStatus::NotStarted], 1);
    }

    #[tokio::test]
    async fn test_malformed_file_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.csv");
        std::fs::write(
            &path,
            "id,backend_name,status,start_time,running_start_time,cpu,memory,duration,costs,geometry\n\
             1,,not_started,,,,,,,POINT (1 2)\n\
             2,,not_started,,,,,,,POINT (oops)\n",
        )
        .unwrap();

        let ledger = CsvLedger::new(&path, LedgerSchema::new());
        let err = ledger.records().await.unwrap_err();
        let err = err.downcast_ref::<LedgerError>().unwrap();
        assert!(matches!(err, LedgerError::Malformed { .. }));
        assert!(err.to_string().contains("row 1"));
    }

    #[tokio::test]
    async fn test_header_without_required_columns_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.csv");
        std::fs::write(&path, "id,status,geometry\n1,not_started,POINT (1 2)\n").unwrap();

        let ledger = CsvLedger::new(&path, LedgerSchema::new());
        let err = ledger.records().await.unwrap_err();
        let err = err.downcast_ref::<LedgerError>().unwrap();
        assert!(matches!(err, LedgerError::Malformed { .. }));
        let message = err.to_string();
        assert!(message.contains("backend_name"), "{message}");
        assert!(message.contains("running_start_time"), "{message}");
    }
}
