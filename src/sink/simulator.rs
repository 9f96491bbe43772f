use super::{BatchWriter, SinkError};
use crate::telemetry::{MetricRecord, SensorEvent};

/// Logs batches instead of writing them. Useful on a workstation without a
/// store at hand.
#[derive(Debug, Default)]
pub struct SimulatorWriter;

impl BatchWriter for SimulatorWriter {
    type Row = MetricRecord;

    fn backend(&self) -> &'static str {
        "simulator"
    }

    fn rows_from_event(&self, event: &SensorEvent) -> Vec<MetricRecord> {
        event.metrics()
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn write_rows(&self, rows: &[MetricRecord]) -> Result<(), SinkError> {
        let json = serde_json::to_string(rows)?;
        tracing::info!(len = rows.len(), points = %json, "simulator writing points");
        Ok(())
    }
}
