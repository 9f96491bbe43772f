//! Acknowledgment-gated delivery of inbound events into a sink.
//!
//! Every decoded message is buffered exactly once and then owned by a retry
//! ticket: a task that calls `insert_buffer_if_needed` until it succeeds and
//! only then acknowledges the message. Until that point the broker still
//! considers the message undelivered and will redeliver it after a crash.

use crate::sink::Sink;
use crate::stats::BridgeStats;
use crate::telemetry::{decode_event, SensorEvent};
use anyhow::Result;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Handle used to acknowledge one inbound message.
pub trait Acknowledge: Send + 'static {
    fn acknowledge(self) -> impl Future<Output = Result<()>> + Send;
}

pub struct DeliveryLoop<S: Sink> {
    sink: Arc<S>,
    retry_delay: Duration,
    stats: Arc<BridgeStats>,
    tickets: JoinSet<()>,
}

impl<S: Sink> DeliveryLoop<S> {
    pub fn new(sink: Arc<S>, retry_delay: Duration, stats: Arc<BridgeStats>) -> Self {
        Self {
            sink,
            retry_delay,
            stats,
            tickets: JoinSet::new(),
        }
    }

    /// Decodes and delivers one payload. Payloads that do not decode are
    /// acknowledged and dropped since redelivery cannot fix them.
    pub fn handle_payload<A: Acknowledge>(&mut self, topic: &str, payload: &mut [u8], ack: A) {
        self.reap();
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        match decode_event(payload) {
            Ok(event) => self.handle_event(event, ack),
            Err(err) => {
                tracing::warn!(error = %err, topic = %topic, "discarding undecodable message");
                self.stats.events_discarded.fetch_add(1, Ordering::Relaxed);
                let stats = self.stats.clone();
                self.tickets.spawn(async move {
                    send_ack(ack, &stats).await;
                });
            }
        }
    }

    pub fn handle_event<A: Acknowledge>(&mut self, event: SensorEvent, ack: A) {
        self.reap();
        self.sink.buffer_event(&event);
        let ticket = RetryTicket {
            instance: event.instance,
            ack,
        };
        self.tickets.spawn(ticket.run(
            self.sink.clone(),
            self.retry_delay,
            self.stats.clone(),
        ));
    }

    /// Messages buffered or being discarded whose acknowledgment is still
    /// outstanding.
    pub fn pending(&self) -> usize {
        self.tickets.len()
    }

    fn reap(&mut self) {
        while let Some(res) = self.tickets.try_join_next() {
            if let Err(err) = res {
                if err.is_panic() {
                    tracing::error!(error = %err, "delivery task panicked");
                }
            }
        }
    }

    /// Aborts outstanding tickets. Their messages stay unacknowledged and are
    /// redelivered on the next session.
    pub async fn shutdown(mut self) {
        let pending = self.tickets.len();
        if pending > 0 {
            tracing::warn!(pending, "abandoning unacknowledged messages on shutdown");
        }
        self.tickets.shutdown().await;
    }

    #[cfg(test)]
    async fn drain(&mut self) {
        while self.tickets.join_next().await.is_some() {}
    }
}

/// One buffered, not yet acknowledged message.
struct RetryTicket<A> {
    instance: String,
    ack: A,
}

impl<A: Acknowledge> RetryTicket<A> {
    async fn run<S: Sink>(self, sink: Arc<S>, retry_delay: Duration, stats: Arc<BridgeStats>) {
        let mut attempt: u32 = 1;
        loop {
            match sink.insert_buffer_if_needed().await {
                Ok(()) => break,
                Err(err) => {
                    if attempt == 1 {
                        stats.pending_retries.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::warn!(
                        error = %err,
                        instance = %self.instance,
                        attempt,
                        retry_in_ms = retry_delay.as_millis() as u64,
                        "error writing to store; retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                    attempt += 1;
                }
            }
        }
        if attempt > 1 {
            stats.pending_retries.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(instance = %self.instance, attempt, "store write succeeded after retry");
        }
        send_ack(self.ack, &stats).await;
    }
}

async fn send_ack<A: Acknowledge>(ack: A, stats: &BridgeStats) {
    match ack.acknowledge().await {
        Ok(()) => {
            stats.events_acked.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to acknowledge message; broker will redeliver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::{temperature_event, FakeWriter};
    use crate::sink::BufferedSink;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct ChannelAck {
        id: u32,
        tx: mpsc::UnboundedSender<(u32, Instant)>,
    }

    impl Acknowledge for ChannelAck {
        async fn acknowledge(self) -> Result<()> {
            self.tx.send((self.id, Instant::now()))?;
            Ok(())
        }
    }

    fn delivery(
        writer: FakeWriter,
        max_items: usize,
    ) -> (DeliveryLoop<BufferedSink<FakeWriter>>, Arc<BufferedSink<FakeWriter>>, Arc<BridgeStats>) {
        let stats = Arc::new(BridgeStats::new());
        let sink = Arc::new(BufferedSink::new(
            writer,
            max_items,
            Duration::from_secs(60),
            stats.clone(),
        ));
        let delivery = DeliveryLoop::new(sink.clone(), Duration::from_secs(10), stats.clone());
        (delivery, sink, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledges_only_after_third_attempt() {
        let (mut delivery, sink, stats) = delivery(FakeWriter::failing(2), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();

        delivery.handle_event(temperature_event("a", 21.5), ChannelAck { id: 1, tx });
        delivery.drain().await;

        let (id, acked_at) = rx.recv().await.unwrap();
        assert_eq!(id, 1);
        assert!(acked_at - started >= Duration::from_secs(20));
        assert_eq!(sink.writer().write_calls.load(Ordering::SeqCst), 3);

        let written = sink.writer().written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].len(), 1, "metric must not be buffered twice");
        assert_eq!(sink.buffered(), 0);
        assert_eq!(stats.events_acked.load(Ordering::Relaxed), 1);
        assert_eq!(stats.pending_retries.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_ack_while_store_is_down() {
        let (mut delivery, sink, _stats) = delivery(FakeWriter::failing(usize::MAX), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        delivery.handle_event(temperature_event("a", 1.0), ChannelAck { id: 1, tx });
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(delivery.pending(), 1);
        assert_eq!(sink.buffered(), 1);
        delivery.shutdown().await;
    }

    #[tokio::test]
    async fn below_threshold_is_acknowledged_without_write() {
        let (mut delivery, sink, _stats) = delivery(FakeWriter::default(), 10);
        let (tx, mut rx) = mpsc::unbounded_channel();

        delivery.handle_event(temperature_event("a", 1.0), ChannelAck { id: 7, tx });
        delivery.drain().await;

        assert_eq!(rx.recv().await.unwrap().0, 7);
        assert_eq!(sink.buffered(), 1);
        assert!(sink.writer().written().is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_is_acknowledged_and_dropped() {
        let (mut delivery, sink, stats) = delivery(FakeWriter::default(), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut payload = b"{not json".to_vec();
        delivery.handle_payload("/sensor/a/t/state", &mut payload, ChannelAck { id: 3, tx });
        delivery.drain().await;

        assert_eq!(rx.recv().await.unwrap().0, 3);
        assert_eq!(sink.buffered(), 0);
        assert_eq!(sink.writer().write_calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.events_discarded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn finished_discard_acks_are_reaped() {
        let (mut delivery, _sink, _stats) = delivery(FakeWriter::default(), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for id in 0..3 {
            let mut payload = b"garbage".to_vec();
            delivery.handle_payload("/sensor/a/t/state", &mut payload, ChannelAck { id, tx: tx.clone() });
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        tokio::task::yield_now().await;

        let mut payload = b"garbage".to_vec();
        delivery.handle_payload("/sensor/a/t/state", &mut payload, ChannelAck { id: 3, tx });
        assert_eq!(delivery.pending(), 1);
        delivery.drain().await;
        assert_eq!(delivery.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn later_events_are_buffered_while_a_retry_is_pending() {
        let (mut delivery, sink, _stats) = delivery(FakeWriter::failing(1), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        delivery.handle_event(
            temperature_event("a", 1.0),
            ChannelAck { id: 1, tx: tx.clone() },
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        delivery.handle_event(temperature_event("b", 2.0), ChannelAck { id: 2, tx });
        delivery.drain().await;

        let mut acked = vec![rx.recv().await.unwrap().0, rx.recv().await.unwrap().0];
        acked.sort();
        assert_eq!(acked, vec![1, 2]);

        let written: Vec<f64> = sink
            .writer()
            .written()
            .into_iter()
            .flatten()
            .map(|m| m.value)
            .collect();
        assert_eq!(written, vec![1.0, 2.0]);
        assert_eq!(sink.buffered(), 0);
    }
}
