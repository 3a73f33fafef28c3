//! Durable, resumable job ledger.
//!
//! A ledger is the table of [`JobRecord`]s one orchestration run works
//! through. Rows are never deleted; writes upsert on [`RowIndex`] so a
//! partial update never blanks out fields it does not carry. Because every
//! mutating step is persisted, restarting against an existing ledger resumes
//! the run where it stopped.
//!
//! Realizations:
//! - [`InMemoryLedger`]: process-local, used by tests and embedding callers.
//! - [`CsvLedger`]: flat delimited file; geometry columns are stored as WKT.
//! - `ParquetLedger` (feature `parquet`): typed columnar file.
//! - `PostgresLedger` (feature `postgres`): remote catalog with bulk upsert.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{ConfigError, LedgerError};
use crate::job::{ColumnMap, ColumnValue, JobRecord, JobStatus, RowIndex};

pub mod csv;
pub mod memory;
#[cfg(feature = "parquet")]
pub mod parquet;
#[cfg(feature = "postgres")]
pub mod postgres;
mod table;
pub mod wkt;

pub use self::csv::CsvLedger;
pub use self::memory::InMemoryLedger;
#[cfg(feature = "parquet")]
pub use self::parquet::ParquetLedger;
#[cfg(feature = "postgres")]
pub use self::postgres::PostgresLedger;
pub(crate) use self::table::RecordTable;

/// Storage contract for job records.
///
/// An empty `statuses` slice matches every status.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Human-readable location (path, table name) used in logs and errors.
    fn location(&self) -> String;

    /// Whether the backing store has been initialized.
    async fn exists(&self) -> anyhow::Result<bool>;

    /// Upsert `records` on row identity.
    async fn persist(&self, records: &[JobRecord]) -> anyhow::Result<()>;

    async fn count_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> anyhow::Result<HashMap<JobStatus, usize>>;

    /// Records in one of `statuses`, in ledger order, at most `max` of them.
    async fn get_by_status(
        &self,
        statuses: &[JobStatus],
        max: Option<usize>,
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Records at the given rows; unknown rows are skipped.
    async fn get_by_indices(&self, indices: &[RowIndex]) -> anyhow::Result<Vec<JobRecord>>;

    /// Every record in ledger order.
    async fn records(&self) -> anyhow::Result<Vec<JobRecord>> {
        self.get_by_status(&[], None).await
    }

    /// Write the initial set of records.
    ///
    /// Returns `false` when the ledger already existed and `on_exists` is
    /// [`OnExists::Skip`].
    async fn initialize(&self, records: Vec<JobRecord>, on_exists: OnExists) -> anyhow::Result<bool> {
        if self.exists().await? {
            match on_exists {
                OnExists::Error => return Err(LedgerError::AlreadyExists(self.location()).into()),
                OnExists::Skip => {
                    tracing::info!(ledger = %self.location(), "ledger exists, resuming");
                    return Ok(false);
                }
            }
        }
        tracing::info!(ledger = %self.location(), rows = records.len(), "initializing ledger");
        self.persist(&records).await?;
        Ok(true)
    }
}

/// What to do when initializing a ledger that already exists.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OnExists {
    #[default]
    Error,
    Skip,
}

/// Declared type of a ledger column.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ColumnKind {
    Text,
    Float,
    Timestamp,
    Status,
}

/// Columns every ledger carries, in storage order.
pub const REQUIRED_COLUMNS: [(&str, ColumnKind); 9] = [
    ("id", ColumnKind::Text),
    ("backend_name", ColumnKind::Text),
    ("status", ColumnKind::Status),
    ("start_time", ColumnKind::Timestamp),
    ("running_start_time", ColumnKind::Timestamp),
    ("cpu", ColumnKind::Text),
    ("memory", ColumnKind::Text),
    ("duration", ColumnKind::Text),
    ("costs", ColumnKind::Float),
];

/// Caller-defined column that must be present on every record.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtraColumn {
    pub name: String,
    pub default: ColumnValue,
}

/// Column layout shared by all ledger realizations.
///
/// Built once and handed to the ledger; the required columns are fixed, the
/// caller may add columns of their own and declare which columns hold
/// geometries.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerSchema {
    extra: Vec<ExtraColumn>,
    geometry_columns: BTreeSet<String>,
}

impl Default for LedgerSchema {
    fn default() -> Self {
        Self {
            extra: Vec::new(),
            geometry_columns: BTreeSet::from(["geometry".to_string()]),
        }
    }
}

impl LedgerSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require an additional column, filled with `default` where missing.
    pub fn with_column(mut self, name: impl Into<String>, default: impl Into<ColumnValue>) -> Self {
        let name = name.into();
        self.extra.retain(|c| c.name != name);
        self.extra.push(ExtraColumn {
            name,
            default: default.into(),
        });
        self
    }

    pub fn with_geometry_column(mut self, name: impl Into<String>) -> Self {
        self.geometry_columns.insert(name.into());
        self
    }

    pub fn is_required(name: &str) -> bool {
        REQUIRED_COLUMNS.iter().any(|(n, _)| *n == name)
    }

    pub fn is_geometry(&self, name: &str) -> bool {
        self.geometry_columns.contains(name)
    }

    pub fn extra_columns(&self) -> &[ExtraColumn] {
        &self.extra
    }

    /// Storage column order for `records`: required columns, then the
    /// schema's extra columns, then any other caller column by name.
    pub fn column_order<'a>(&self, records: impl IntoIterator<Item = &'a JobRecord>) -> Vec<String> {
        let mut order: Vec<String> = REQUIRED_COLUMNS.iter().map(|(n, _)| n.to_string()).collect();
        order.extend(self.extra.iter().map(|c| c.name.clone()));
        let mut others = BTreeSet::new();
        for record in records {
            for name in record.columns.keys() {
                if !order.contains(name) {
                    others.insert(name.clone());
                }
            }
        }
        order.extend(others);
        order
    }

    /// Add the schema's extra columns that `record` lacks.
    pub fn fill_defaults(&self, record: &mut JobRecord) {
        for column in &self.extra {
            record
                .columns
                .entry(column.name.clone())
                .or_insert_with(|| column.default.clone());
        }
    }

    /// Turn caller-provided rows into fresh ledger records.
    ///
    /// Rows are numbered in input order. Required columns present in the
    /// input are decoded (so a pre-filled `status` is honored); missing ones
    /// get their defaults.
    pub fn normalize(&self, rows: Vec<ColumnMap>) -> Result<Vec<JobRecord>, LedgerError> {
        rows.into_iter()
            .enumerate()
            .map(|(i, cells)| {
                let mut record = self.decode_row(RowIndex(i), cells, "input")?;
                self.fill_defaults(&mut record);
                Ok(record)
            })
            .collect()
    }

    /// Decode one stored row into a record.
    ///
    /// An unknown `status` or a non-numeric `costs` value is malformed data
    /// and fails the load. Unparseable timestamps are dropped with a warning
    /// so the control loop can re-stamp them.
    pub fn decode_row(
        &self,
        row: RowIndex,
        mut cells: ColumnMap,
        location: &str,
    ) -> Result<JobRecord, LedgerError> {
        let mut record = JobRecord::new(row.0);
        let at = || format!("{location} row {row}");

        record.id = take_text(&mut cells, "id");
        record.backend_name = take_text(&mut cells, "backend_name");
        record.status = match take_text(&mut cells, "status") {
            Some(status) => status
                .parse()
                .map_err(|message: String| LedgerError::malformed(at(), message))?,
            None => JobStatus::NotStarted,
        };
        record.start_time = take_timestamp(&mut cells, "start_time", row);
        record.running_start_time = take_timestamp(&mut cells, "running_start_time", row);
        record.cpu = take_text(&mut cells, "cpu");
        record.memory = take_text(&mut cells, "memory");
        record.duration = take_text(&mut cells, "duration");
        record.costs = match cells.remove("costs") {
            None | Some(ColumnValue::Null) => None,
            Some(ColumnValue::Text(text)) if text.trim().is_empty() => None,
            Some(ColumnValue::Text(text)) => Some(text.trim().parse::<f64>().map_err(|_| {
                LedgerError::malformed(at(), format!("costs is not a number: {text:?}"))
            })?),
            Some(value) => match value.as_f64() {
                Some(v) => Some(v).filter(|v| !v.is_nan()),
                None => {
                    return Err(LedgerError::malformed(
                        at(),
                        format!("costs is not a number: {value}"),
                    ))
                }
            },
        };
        record.columns = cells;
        Ok(record)
    }

    /// Encode a record's required fields as column values.
    pub fn encode_required(record: &JobRecord) -> Vec<(&'static str, ColumnValue)> {
        let text = |v: &Option<String>| v.clone().map(ColumnValue::Text).unwrap_or(ColumnValue::Null);
        let time = |v: &Option<DateTime<Utc>>| {
            v.map(|t| ColumnValue::Text(t.to_rfc3339()))
                .unwrap_or(ColumnValue::Null)
        };
        vec![
            ("id", text(&record.id)),
            ("backend_name", text(&record.backend_name)),
            ("status", ColumnValue::Text(record.status.as_str().to_string())),
            ("start_time", time(&record.start_time)),
            ("running_start_time", time(&record.running_start_time)),
            ("cpu", text(&record.cpu)),
            ("memory", text(&record.memory)),
            ("duration", text(&record.duration)),
            ("costs", record.costs.map(ColumnValue::Float).unwrap_or(ColumnValue::Null)),
        ]
    }
}

fn take_text(cells: &mut ColumnMap, name: &str) -> Option<String> {
    match cells.remove(name)? {
        ColumnValue::Null => None,
        ColumnValue::Text(text) if text.is_empty() => None,
        ColumnValue::Float(v) if v.is_nan() => None,
        value => Some(value.to_string()),
    }
}

fn take_timestamp(cells: &mut ColumnMap, name: &str, row: RowIndex) -> Option<DateTime<Utc>> {
    let text = take_text(cells, name)?;
    let parsed = parse_timestamp(&text);
    if parsed.is_none() {
        tracing::warn!(row = %row, column = name, value = %text, "dropping unparseable timestamp");
    }
    parsed
}

/// Parse RFC 3339 or a naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` timestamp (as UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Open the file-backed ledger matching `path`'s extension.
pub fn open_ledger(
    path: impl AsRef<Path>,
    schema: LedgerSchema,
) -> Result<Arc<dyn JobLedger>, LedgerError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("csv") => Ok(Arc::new(CsvLedger::new(path, schema))),
        #[cfg(feature = "parquet")]
        Some("parquet") => Ok(Arc::new(ParquetLedger::new(path, schema))),
        _ => Err(LedgerError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// Create a file-backed ledger at `path` from caller rows.
pub async fn create_ledger(
    path: impl AsRef<Path>,
    rows: Vec<ColumnMap>,
    schema: LedgerSchema,
    on_exists: OnExists,
) -> anyhow::Result<Arc<dyn JobLedger>> {
    let records = schema.normalize(rows)?;
    let ledger = open_ledger(path, schema)?;
    ledger.initialize(records, on_exists).await?;
    Ok(ledger)
}

/// Where an orchestration run gets its jobs from.
///
/// Either caller rows plus an output file path, or a ready ledger object.
/// Supplying both (or neither) is a configuration error.
#[derive(Default)]
pub struct JobSource {
    rows: Option<Vec<ColumnMap>>,
    output_path: Option<PathBuf>,
    ledger: Option<Arc<dyn JobLedger>>,
    schema: LedgerSchema,
}

impl std::fmt::Debug for JobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSource")
            .field("rows", &self.rows.as_ref().map(Vec::len))
            .field("output_path", &self.output_path)
            .field("ledger", &self.ledger.as_ref().map(|l| l.location()))
            .finish()
    }
}

impl JobSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, rows: Vec<ColumnMap>) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn JobLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_schema(mut self, schema: LedgerSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Resolve to an initialized ledger.
    ///
    /// With rows and an output path, an existing file at that path is
    /// resumed and the rows are ignored. With rows only, an in-memory
    /// ledger is used.
    pub async fn resolve(self) -> anyhow::Result<Arc<dyn JobLedger>> {
        let legacy = self.rows.is_some() || self.output_path.is_some();
        match (legacy, self.ledger) {
            (true, Some(_)) => Err(ConfigError::AmbiguousJobSource.into()),
            (false, None) => Err(ConfigError::MissingJobSource.into()),
            (false, Some(ledger)) => {
                if !ledger.exists().await? {
                    ledger.initialize(Vec::new(), OnExists::Skip).await?;
                }
                Ok(ledger)
            }
            (true, None) => {
                let rows = self.rows.unwrap_or_default();
                match self.output_path {
                    Some(path) => create_ledger(path, rows, self.schema, OnExists::Skip).await,
                    None => {
                        let records = self.schema.normalize(rows)?;
                        let ledger: Arc<dyn JobLedger> = Arc::new(InMemoryLedger::new(self.schema));
                        ledger.initialize(records, OnExists::Error).await?;
                        Ok(ledger)
                    }
                }
            }
        }
    }
}

impl From<Arc<dyn JobLedger>> for JobSource {
    fn from(ledger: Arc<dyn JobLedger>) -> Self {
        Self::new().with_ledger(ledger)
    }
}
