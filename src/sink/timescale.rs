use super::{BatchWriter, MeasurementRow, SinkError};
use crate::telemetry::SensorEvent;
use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};

/// Keeps each INSERT well below the 65535 bind parameter limit.
const ROWS_PER_STATEMENT: usize = 10_000;

/// TimescaleDB (or plain PostgreSQL) using the same one-row-per-event shape as
/// ClickHouse.
pub struct TimescaleWriter {
    pool: PgPool,
}

/// The pool connects on first use, so an unreachable database at startup is
/// a write failure like any other rather than a fatal error.
pub fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy(database_url)?;
    Ok(pool)
}

impl TimescaleWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl BatchWriter for TimescaleWriter {
    type Row = MeasurementRow;

    fn backend(&self) -> &'static str {
        "timescale"
    }

    fn rows_from_event(&self, event: &SensorEvent) -> Vec<MeasurementRow> {
        MeasurementRow::from_event(event).into_iter().collect()
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS measurements (
                ts timestamptz not null,
                instance text not null,
                metric_names text[] not null,
                metric_values real[] not null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS measurements_instance_ts_idx ON measurements (instance, ts DESC)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            DO $$
            BEGIN
                IF EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb') THEN
                    PERFORM create_hypertable('measurements', 'ts', if_not_exists => TRUE, migrate_data => TRUE);
                END IF;
            END
            $$
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_rows(&self, rows: &[MeasurementRow]) -> Result<(), SinkError> {
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO measurements (ts, instance, metric_names, metric_values) ",
            );
            builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(&row.instance)
                    .push_bind(&row.metric_names)
                    .push_bind(&row.metric_values);
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
