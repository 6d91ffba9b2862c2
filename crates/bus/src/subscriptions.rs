use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use envelope::Envelope;

use crate::{BusMetrics, Handler};

/// Queue depth of one subscriber. A handler that falls this far behind
/// starts losing messages (at-most-once delivery permits it).
const SUBSCRIBER_QUEUE: usize = 256;

/// A handle for one live subscription, consumed by `unsubscribe`.
#[derive(Debug)]
pub struct SubscriptionToken {
    pub(crate) channel: String,
    pub(crate) id: u64,
}

impl SubscriptionToken {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct Entry {
    id: u64,
    tx: tokio::sync::mpsc::Sender<Envelope>,
    metrics: Arc<BusMetrics>,
}

/// The channel → subscriber fan-out table. Each subscriber owns a bounded
/// queue drained by a dedicated worker task, so per-subscriber delivery is
/// serialized while subscribers never block one another.
///
/// For the in-memory transport a single `Subscriptions` is the shared hub
/// between every bus in the process; the Redis transport gives each bus
/// its own, fed by the connection's reader.
pub(crate) struct Subscriptions {
    entries: std::sync::RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
    handler_budget: Duration,
}

impl Subscriptions {
    pub fn new(handler_budget: Duration) -> Self {
        Self {
            entries: Default::default(),
            next_id: AtomicU64::new(1),
            handler_budget,
        }
    }

    /// Register `handler` on `channel`. Returns the token and whether this
    /// is the channel's first subscriber (the Redis transport then issues
    /// a SUBSCRIBE).
    pub fn subscribe(
        &self,
        channel: &str,
        handler: Handler,
        metrics: Arc<BusMetrics>,
    ) -> (SubscriptionToken, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Envelope>(SUBSCRIBER_QUEUE);

        let budget = self.handler_budget;
        let worker_channel = channel.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let started = tokio::time::Instant::now();
                handler(envelope).await;
                let elapsed = started.elapsed();
                if elapsed > budget {
                    tracing::warn!(
                        channel = %worker_channel,
                        ?elapsed,
                        "bus handler exceeded its execution budget"
                    );
                }
            }
        });

        let mut entries = self.entries.write().unwrap();
        let list = entries.entry(channel.to_string()).or_default();
        let first = list.is_empty();
        list.push(Entry { id, tx, metrics });

        (
            SubscriptionToken {
                channel: channel.to_string(),
                id,
            },
            first,
        )
    }

    /// Remove a subscription. Returns true when the channel has no
    /// subscribers left (the Redis transport then issues UNSUBSCRIBE).
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut entries = self.entries.write().unwrap();
        let Some(list) = entries.get_mut(&token.channel) else {
            return false;
        };
        list.retain(|entry| entry.id != token.id);
        if list.is_empty() {
            entries.remove(&token.channel);
            true
        } else {
            false
        }
    }

    /// Fan an envelope out to every subscriber of `channel`. Never blocks:
    /// a full subscriber queue drops the envelope for that subscriber only.
    pub fn dispatch(&self, channel: &str, envelope: &Envelope) {
        let txs: Vec<(tokio::sync::mpsc::Sender<Envelope>, Arc<BusMetrics>)> = {
            let entries = self.entries.read().unwrap();
            match entries.get(channel) {
                Some(list) => list
                    .iter()
                    .map(|e| (e.tx.clone(), e.metrics.clone()))
                    .collect(),
                None => return,
            }
        };

        for (tx, metrics) in txs {
            match tx.try_send(envelope.clone()) {
                Ok(()) => BusMetrics::incr(&metrics.delivered),
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    BusMetrics::incr(&metrics.dropped_subscriber);
                    tracing::warn!(channel, "subscriber queue full, dropping message");
                }
                // The worker is gone; unsubscribe will clean the entry up.
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}
