//! In-memory batch buffer with size and age flush thresholds.
//!
//! Records are kept in insertion order together with the instant they were
//! enqueued. The age threshold is measured from the oldest record, so a steady
//! trickle of new records cannot postpone a flush indefinitely.

use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct Buffered<T> {
    datum: T,
    enqueued_at: Instant,
}

#[derive(Debug)]
pub struct DataBuffer<T> {
    items: VecDeque<Buffered<T>>,
    max_items: usize,
    max_age: Duration,
}

impl<T> DataBuffer<T> {
    pub fn new(max_items: usize, max_age: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            max_items,
            max_age,
        }
    }

    /// Appends in order. May overshoot `max_items`; the producer is never
    /// blocked.
    pub fn append(&mut self, data: impl IntoIterator<Item = T>) {
        let now = Instant::now();
        self.items.extend(data.into_iter().map(|datum| Buffered {
            datum,
            enqueued_at: now,
        }));
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drops the `count` oldest records, i.e. a batch taken with [`data`]
    /// that has since been written. Records appended after the snapshot stay.
    ///
    /// [`data`]: DataBuffer::data
    pub fn remove_flushed(&mut self, count: usize) {
        if count >= self.items.len() {
            self.clear();
            return;
        }
        self.items.drain(..count);
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_items
    }

    pub fn is_too_old(&self) -> bool {
        self.oldest_age()
            .map(|age| age >= self.max_age)
            .unwrap_or(false)
    }

    pub fn oldest_age(&self) -> Option<Duration> {
        self.items
            .front()
            .map(|oldest| Instant::now().saturating_duration_since(oldest.enqueued_at))
    }
}

impl<T: Clone> DataBuffer<T> {
    /// Snapshot of the buffered records in insertion order.
    pub fn data(&self) -> Vec<T> {
        self.items.iter().map(|b| b.datum.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counts_everything_since_last_clear() {
        let mut buf = DataBuffer::new(100, Duration::from_secs(60));
        buf.append([1, 2]);
        buf.append(Vec::<i32>::new());
        buf.append([3]);
        assert_eq!(buf.size(), 3);

        buf.clear();
        assert_eq!(buf.size(), 0);
        assert!(buf.is_empty());

        buf.append([4, 5]);
        assert_eq!(buf.size(), 2);
        assert_eq!(buf.data(), vec![4, 5]);
    }

    #[test]
    fn full_at_max_items_and_not_after_clear() {
        let mut buf = DataBuffer::new(3, Duration::from_secs(60));
        buf.append(["t1", "t2"]);
        assert!(!buf.is_full());

        buf.append(["t3"]);
        assert!(buf.is_full());

        buf.append(["t4"]);
        assert!(buf.is_full());
        assert_eq!(buf.size(), 4);

        buf.clear();
        assert!(!buf.is_full());
    }

    #[test]
    fn remove_flushed_keeps_later_records() {
        let mut buf = DataBuffer::new(10, Duration::from_secs(60));
        buf.append([1, 2, 3]);
        let snapshot = buf.data();
        buf.append([4]);

        buf.remove_flushed(snapshot.len());
        assert_eq!(buf.data(), vec![4]);

        buf.remove_flushed(10);
        assert!(buf.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_buffer_is_never_too_old() {
        let buf: DataBuffer<u8> = DataBuffer::new(10, Duration::from_millis(0));
        assert!(!buf.is_too_old());
        assert_eq!(buf.oldest_age(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn age_is_measured_from_the_oldest_record() {
        let mut buf = DataBuffer::new(10, Duration::from_millis(5000));
        buf.append(["old"]);

        tokio::time::advance(Duration::from_millis(4000)).await;
        buf.append(["new"]);
        assert!(!buf.is_too_old());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(buf.is_too_old());

        // Once the old record is gone only the newer one counts.
        buf.remove_flushed(1);
        assert!(!buf.is_too_old());

        tokio::time::advance(Duration::from_millis(4000)).await;
        assert!(buf.is_too_old());
    }
}
