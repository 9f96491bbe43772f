mod buffered;
mod clickhouse;
mod influx;
mod simulator;
mod timescale;


pub use buffered::BufferedSink;
pub use clickhouse::ClickHouseWriter;
pub use influx::InfluxWriter;
pub use simulator::SimulatorWriter;
pub use timescale::{build_pool, TimescaleWriter};

use crate::telemetry::SensorEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("schema setup failed: {0}")]
    Schema(#[source] Box<SinkError>),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the delivery loop needs from a storage backend.
pub trait Sink: Send + Sync + 'static {
    /// Converts the event and appends it to the buffer. No I/O.
    fn buffer_event(&self, event: &SensorEvent);

    /// Writes the buffer as one batch if it is full or too old, otherwise
    /// returns immediately. A failed write leaves the buffer as it was.
    fn insert_buffer_if_needed(&self) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Store-specific half of a sink: the row shape and the batch write.
pub trait BatchWriter: Send + Sync + 'static {
    type Row: Clone + Send + Sync + 'static;

    fn backend(&self) -> &'static str;

    fn rows_from_event(&self, event: &SensorEvent) -> Vec<Self::Row>;

    /// Idempotent; called until it succeeds once.
    fn ensure_schema(&self) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// All or nothing from the caller's point of view.
    fn write_rows(&self, rows: &[Self::Row]) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// One row per event with parallel metric name and value arrays, the shape
/// used by the columnar stores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRow {
    pub ts: DateTime<Utc>,
    pub instance: String,
    pub metric_names: Vec<&'static str>,
    pub metric_values: Vec<f32>,
}

impl MeasurementRow {
    pub fn from_event(event: &SensorEvent) -> Option<Self> {
        let metrics = event.metrics();
        if metrics.is_empty() {
            return None;
        }
        Some(Self {
            ts: event.ts,
            instance: event.instance.clone(),
            metric_names: metrics.iter().map(|m| m.name).collect(),
            metric_values: metrics.iter().map(|m| m.value as f32).collect(),
        })
    }
}

async fn check_response(response: reqwest::Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Rejected {
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}
