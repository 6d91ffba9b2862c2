use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the bus. Monotonic; read via [`BusMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Envelopes handed to the transport for publication.
    pub published: AtomicU64,
    /// Envelopes enqueued to subscriber handlers.
    pub delivered: AtomicU64,
    /// Publishes dropped from the disconnect queue because it was full.
    pub dropped_overflow: AtomicU64,
    /// Deliveries dropped because one subscriber's queue was full.
    pub dropped_subscriber: AtomicU64,
    /// Incoming messages that failed envelope or payload decoding.
    pub decode_errors: AtomicU64,
    /// Successful reconnects after a transport loss.
    pub reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped_overflow: u64,
    pub dropped_subscriber: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
}

impl BusMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_subscriber: self.dropped_subscriber.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
