use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

#[derive(Debug, Default)]
pub struct BridgeStats {
    pub events_received: AtomicU64,
    pub events_discarded: AtomicU64,
    pub events_acked: AtomicU64,
    pub rows_buffered: AtomicU64,
    pub buffer_depth: AtomicU64,
    pub rows_flushed: AtomicU64,
    pub failed_flushes: AtomicU64,
    pub pending_retries: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn record_flush(&self, len: usize, micros: u64, now_unix_ms: u64) {
        self.rows_flushed.fetch_add(len as u64, Ordering::Relaxed);
        self.last_flush_unix_ms.store(now_unix_ms, Ordering::Relaxed);
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 {
            micros
        } else {
            (prev + micros) / 2
        };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
        self.clear_error();
    }

    pub fn log_summary(&self) {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_default();
        tracing::info!(
            received = self.events_received.load(Ordering::Relaxed),
            discarded = self.events_discarded.load(Ordering::Relaxed),
            acked = self.events_acked.load(Ordering::Relaxed),
            rows_buffered = self.rows_buffered.load(Ordering::Relaxed),
            buffered = self.buffer_depth.load(Ordering::Relaxed),
            flushed = self.rows_flushed.load(Ordering::Relaxed),
            failed_flushes = self.failed_flushes.load(Ordering::Relaxed),
            pending_retries = self.pending_retries.load(Ordering::Relaxed),
            avg_flush_micros = self.average_flush_micros.load(Ordering::Relaxed),
            last_flush_unix_ms = self.last_flush_unix_ms.load(Ordering::Relaxed),
            mqtt_connected = self.mqtt_connected.load(Ordering::Relaxed),
            last_error = %last_error,
            "bridge stats"
        );
    }
}
