use fleet::*;

/// `count` caller rows with a `year` and a point `geometry` column.
pub fn rows(count: usize) -> Vec<ColumnMap> {
    (0..count)
        .map(|i| {
            let mut cells = ColumnMap::new();
            cells.insert("year".to_string(), ColumnValue::Int(2000 + i as i64));
            cells.insert(
                "geometry".to_string(),
                ColumnValue::Geometry(ledger::wkt::Geometry::point(i as f64, -(i as f64))),
            );
            cells
        })
        .collect()
}

/// Control loop settings that keep tests fast: short polls, no backoff,
/// retries without sleeping.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_poll_interval(5)
        .with_connection_error_backoff(0)
        .with_stop_timeout(2_000)
        .with_retry(RetryConfig::immediate(2))
}
