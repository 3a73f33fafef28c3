//! Typed columnar ledger file.
//!
//! Required columns keep their native types (timestamps as UTC microseconds,
//! `costs` as float64). Caller columns are typed from their values: integer,
//! float, boolean or text. Geometry columns are stored as WKT text and
//! tagged in the field metadata so they are restored as geometries on load.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::DateTime;
use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use ::parquet::arrow::ArrowWriter;

use crate::error::LedgerError;
use crate::job::{ColumnMap, ColumnValue, JobRecord, JobStatus, RowIndex};
use crate::ledger::{ColumnKind, JobLedger, LedgerSchema, RecordTable, REQUIRED_COLUMNS};

const GEOMETRY_ENCODING_KEY: &str = "fleet:geometry_encoding";

#[derive(Clone, Debug)]
pub struct ParquetLedger {
    path: PathBuf,
    schema: LedgerSchema,
}

impl ParquetLedger {
    pub fn new(path: impl Into<PathBuf>, schema: LedgerSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn malformed(&self, message: impl Into<String>) -> LedgerError {
        LedgerError::malformed(self.path.display().to_string(), message)
    }

    async fn load(&self) -> anyhow::Result<RecordTable> {
        let this = self.clone();
        Ok(tokio::task::spawn_blocking(move || this.read_table()).await??)
    }

    fn read_table(&self) -> anyhow::Result<RecordTable> {
        if !self.path.exists() {
            return Ok(RecordTable::default());
        }
        let location = self.path.display().to_string();
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&self.path)?)?.build()?;

        let mut records = Vec::new();
        for batch in reader {
            let batch = batch?;
            let schema = batch.schema();
            let mut rows = vec![ColumnMap::new(); batch.num_rows()];
            for (field, column) in schema.fields().iter().zip(batch.columns()) {
                let geometry = field.metadata().contains_key(GEOMETRY_ENCODING_KEY);
                for (i, cells) in rows.iter_mut().enumerate() {
                    let value = self.decode_value(field.name(), column, i, geometry)?;
                    cells.insert(field.name().clone(), value);
                }
            }
            for cells in rows {
                let row = RowIndex(records.len());
                records.push(self.schema.decode_row(row, cells, &location)?);
            }
        }
        Ok(RecordTable::from_records(records))
    }

    fn decode_value(
        &self,
        name: &str,
        column: &ArrayRef,
        i: usize,
        geometry: bool,
    ) -> Result<ColumnValue, LedgerError> {
        if column.is_null(i) {
            return Ok(ColumnValue::Null);
        }
        let any = column.as_any();
        if let Some(a) = any.downcast_ref::<StringArray>() {
            let text = a.value(i);
            if geometry {
                return text
                    .parse()
                    .map(ColumnValue::Geometry)
                    .map_err(|err| self.malformed(format!("column {name} row {i}: {err}")));
            }
            return Ok(ColumnValue::Text(text.to_string()));
        }
        if let Some(a) = any.downcast_ref::<Int64Array>() {
            return Ok(ColumnValue::Int(a.value(i)));
        }
        if let Some(a) = any.downcast_ref::<Float64Array>() {
            return Ok(ColumnValue::Float(a.value(i)));
        }
        if let Some(a) = any.downcast_ref::<BooleanArray>() {
            return Ok(ColumnValue::Bool(a.value(i)));
        }
        if let Some(a) = any.downcast_ref::<TimestampMicrosecondArray>() {
            return DateTime::from_timestamp_micros(a.value(i))
                .map(|t| ColumnValue::Text(t.to_rfc3339()))
                .ok_or_else(|| self.malformed(format!("column {name} row {i}: timestamp out of range")));
        }
        Err(self.malformed(format!(
            "column {name} has unsupported type {}",
            column.data_type()
        )))
    }

    fn write_table(&self, table: &RecordTable) -> anyhow::Result<()> {
        let records: Vec<&JobRecord> = table.records().collect();
        let mut fields = Vec::new();
        let mut arrays: Vec<ArrayRef> = Vec::new();

        for (name, kind) in REQUIRED_COLUMNS {
            let (field, array) = required_column(name, kind, &records);
            fields.push(field);
            arrays.push(array);
        }
        for name in self.schema.column_order(records.iter().copied()) {
            if LedgerSchema::is_required(&name) {
                continue;
            }
            let values: Vec<Option<&ColumnValue>> = records
                .iter()
                .map(|r| r.columns.get(&name).filter(|v| !v.is_null()))
                .collect();
            let (field, array) = caller_column(&name, &values, self.schema.is_geometry(&name));
            fields.push(field);
            arrays.push(array);
        }

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema.clone(), arrays)?;
        let tmp = self.path.with_extension("parquet.tmp");
        {
            let mut writer = ArrowWriter::try_new(File::create(&tmp)?, schema, None)?;
            writer.write(&batch)?;
            writer.close()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn required_column(name: &str, kind: ColumnKind, records: &[&JobRecord]) -> (Field, ArrayRef) {
    let text = |get: fn(&JobRecord) -> Option<String>| -> ArrayRef {
        Arc::new(records.iter().map(|r| get(r)).collect::<StringArray>())
    };
    match (name, kind) {
        ("costs", _) => (
            Field::new(name, DataType::Float64, true),
            Arc::new(records.iter().map(|r| r.costs).collect::<Float64Array>()),
        ),
        (_, ColumnKind::Timestamp) => {
            let values: Vec<Option<i64>> = records
                .iter()
                .map(|r| match name {
                    "start_time" => r.start_time,
                    _ => r.running_start_time,
                })
                .map(|t| t.map(|t| t.timestamp_micros()))
                .collect();
            (
                Field::new(
                    name,
                    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                    true,
                ),
                Arc::new(TimestampMicrosecondArray::from(values).with_timezone("UTC")),
            )
        }
        ("status", _) => (
            Field::new(name, DataType::Utf8, false),
            text(|r| Some(r.status.as_str().to_string())),
        ),
        ("id", _) => (Field::new(name, DataType::Utf8, true), text(|r| r.id.clone())),
        ("backend_name", _) => (
            Field::new(name, DataType::Utf8, true),
            text(|r| r.backend_name.clone()),
        ),
        ("cpu", _) => (Field::new(name, DataType::Utf8, true), text(|r| r.cpu.clone())),
        ("memory", _) => (Field::new(name, DataType::Utf8, true), text(|r| r.memory.clone())),
        _ => (Field::new(name, DataType::Utf8, true), text(|r| r.duration.clone())),
    }
}

fn caller_column(name: &str, values: &[Option<&ColumnValue>], geometry: bool) -> (Field, ArrayRef) {
    let present = || values.iter().flatten();
    if geometry {
        let field = Field::new(name, DataType::Utf8, true).with_metadata(HashMap::from([(
            GEOMETRY_ENCODING_KEY.to_string(),
            "wkt".to_string(),
        )]));
        let array: StringArray = values.iter().map(|v| v.map(|v| v.to_string())).collect();
        return (field, Arc::new(array));
    }
    if present().all(|v| matches!(v, ColumnValue::Int(_))) && present().next().is_some() {
        let array: Int64Array = values
            .iter()
            .map(|v| match v {
                Some(ColumnValue::Int(i)) => Some(*i),
                _ => None,
            })
            .collect();
        return (Field::new(name, DataType::Int64, true), Arc::new(array));
    }
    if present().all(|v| matches!(v, ColumnValue::Int(_) | ColumnValue::Float(_)))
        && present().next().is_some()
    {
        let array: Float64Array = values.iter().map(|v| v.and_then(|v| v.as_f64())).collect();
        return (Field::new(name, DataType::Float64, true), Arc::new(array));
    }
    if present().all(|v| matches!(v, ColumnValue::Bool(_))) && present().next().is_some() {
        let array: BooleanArray = values
            .iter()
            .map(|v| match v {
                Some(ColumnValue::Bool(b)) => Some(*b),
                _ => None,
            })
            .collect();
        return (Field::new(name, DataType::Boolean, true), Arc::new(array));
    }
    let array: StringArray = values.iter().map(|v| v.map(|v| v.to_string())).collect();
    (Field::new(name, DataType::Utf8, true), Arc::new(array))
}

#[async_trait]
impl JobLedger for ParquetLedger {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    async fn persist(&self, records: &[JobRecord]) -> anyhow::Result<()> {
        let this = self.clone();
        let records = records.to_vec();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
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
    use crate::ledger::wkt::Geometry;
    use crate::ledger::{parse_timestamp, OnExists};

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ParquetLedger::new(dir.path().join("jobs.parquet"), LedgerSchema::new());

        let mut record = JobRecord::new(0)
            .with_backend("foo")
            .with_status(JobStatus::Finished)
            .with_column("geometry", Geometry::point(3.5, 50.0))
            .with_column("year", 2022i64)
            .with_column("ratio", 0.5)
            .with_column("label", "north");
        record.id = Some("j-9".into());
        record.start_time = parse_timestamp("2024-01-02T03:04:05Z");
        record.costs = Some(4.0);

        let second = JobRecord::new(1).with_column("year", 2023i64);
        ledger
            .initialize(vec![record.clone(), second], OnExists::Error)
            .await
            .unwrap();

        let back = ledger.records().await.unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].id, record.id);
        assert_eq!(back[0].start_time, record.start_time);
        assert_eq!(back[0].costs, Some(4.0));
        assert_eq!(back[0].column("year"), Some(&ColumnValue::Int(2022)));
        assert_eq!(back[0].column("ratio"), Some(&ColumnValue::Float(0.5)));
        assert_eq!(
            back[0].column("geometry"),
            Some(&ColumnValue::Geometry(Geometry::point(3.5, 50.0)))
        );
        assert_eq!(back[1].status, JobStatus::NotStarted);
        assert_eq!(back[1].column("geometry"), Some(&ColumnValue::Null));
    }
}
