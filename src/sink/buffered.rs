use super::{BatchWriter, Sink, SinkError};
use crate::buffer::DataBuffer;
use crate::stats::BridgeStats;
use crate::telemetry::SensorEvent;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};

/// Buffers rows for one store and flushes them in batches.
///
/// The buffer mutex is only held for in-memory work, so producers never wait
/// on the network. Flushes are serialized by a separate async gate: a flush
/// snapshots the buffer, writes without holding the buffer lock, and on
/// success removes exactly the rows it wrote.
pub struct BufferedSink<W: BatchWriter> {
    writer: W,
    buffer: Mutex<DataBuffer<W::Row>>,
    flush_gate: AsyncMutex<()>,
    schema_ready: OnceCell<()>,
    stats: Arc<BridgeStats>,
}

impl<W: BatchWriter> BufferedSink<W> {
    pub fn new(writer: W, max_items: usize, max_age: Duration, stats: Arc<BridgeStats>) -> Self {
        Self {
            writer,
            buffer: Mutex::new(DataBuffer::new(max_items, max_age)),
            flush_gate: AsyncMutex::new(()),
            schema_ready: OnceCell::new(),
            stats,
        }
    }

    #[cfg(test)]
    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn buffered(&self) -> usize {
        self.lock_buffer().size()
    }

    fn lock_buffer(&self) -> MutexGuard<'_, DataBuffer<W::Row>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the buffer if a flush is due.
    fn take_due_batch(&self) -> Option<Vec<W::Row>> {
        let buffer = self.lock_buffer();
        if buffer.is_empty() || !(buffer.is_full() || buffer.is_too_old()) {
            return None;
        }
        Some(buffer.data())
    }

    async fn write_batch(&self, rows: &[W::Row]) -> Result<(), SinkError> {
        self.schema_ready
            .get_or_try_init(|| async {
                tracing::info!(backend = self.writer.backend(), "creating schema");
                self.writer
                    .ensure_schema()
                    .await
                    .map_err(|err| SinkError::Schema(Box::new(err)))
            })
            .await?;
        self.writer.write_rows(rows).await
    }
}

impl<W: BatchWriter> Sink for BufferedSink<W> {
    fn buffer_event(&self, event: &SensorEvent) {
        let rows = self.writer.rows_from_event(event);
        if rows.is_empty() {
            tracing::debug!(instance = %event.instance, tag = %event.tag, "event carries no metrics");
            return;
        }
        let added = rows.len() as u64;
        let depth = {
            let mut buffer = self.lock_buffer();
            buffer.append(rows);
            buffer.size()
        };
        self.stats.rows_buffered.fetch_add(added, Ordering::Relaxed);
        self.stats.buffer_depth.store(depth as u64, Ordering::Relaxed);
        tracing::trace!(depth, instance = %event.instance, "buffered event");
    }

    async fn insert_buffer_if_needed(&self) -> Result<(), SinkError> {
        let _gate = self.flush_gate.lock().await;

        let Some(batch) = self.take_due_batch() else {
            return Ok(());
        };
        let len = batch.len();
        let started = Instant::now();

        match self.write_batch(&batch).await {
            Ok(()) => {
                let depth = {
                    let mut buffer = self.lock_buffer();
                    buffer.remove_flushed(len);
                    buffer.size()
                };
                let micros = started.elapsed().as_micros() as u64;
                self.stats.buffer_depth.store(depth as u64, Ordering::Relaxed);
                self.stats
                    .record_flush(len, micros, Utc::now().timestamp_millis() as u64);
                tracing::debug!(backend = self.writer.backend(), len, micros, "flushed batch");
                Ok(())
            }
            Err(err) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(backend = self.writer.backend(), len, error = %err, "failed to flush batch");
                Err(err)
            }
        }
    }
}
