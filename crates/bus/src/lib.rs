//! The asynchronous message bus every Fulcrum process communicates
//! through: pub/sub on named channels, directed sends, and
//! request/response with correlation and timeouts.
//!
//! Production runs over Redis pub/sub; [`Bus::connect`] transparently
//! falls back to the in-memory transport when Redis cannot be reached at
//! construction time. Delivery is at-most-once per subscriber, ordered
//! per (publisher, channel) for any single subscriber, and fan-out to
//! subscribers is independent: a slow handler never stalls its peers.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envelope::{Envelope, Message};

mod metrics;
mod redis_transport;
mod subscriptions;

pub use metrics::{BusMetrics, MetricsSnapshot};
pub use subscriptions::SubscriptionToken;

use subscriptions::Subscriptions;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A `request` saw no correlated response before its deadline.
    #[error("request on {channel:?} timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },
    /// The bus has shut down and accepts no further traffic.
    #[error("bus is closed")]
    Closed,
    #[error("invalid redis endpoint")]
    Endpoint(#[source] redis::RedisError),
}

/// A subscriber callback. Receives fully decoded envelopes; invocations
/// for one subscription are serialized in publish order.
pub type Handler = Arc<dyn Fn(Envelope) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Adapt an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| -> futures::future::BoxFuture<'static, ()> {
        Box::pin(f(envelope))
    })
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Initial sender id stamped on outbound envelopes; replaced with the
    /// permanent id once registration succeeds.
    pub sender_id: String,
    /// `redis://` endpoint of the production transport. None selects the
    /// in-memory transport outright.
    pub redis_url: Option<String>,
    /// Budget for the initial connection attempt before falling back to
    /// the in-memory transport.
    pub connect_timeout: Duration,
    /// Cap on publishes queued while the transport is down; beyond it the
    /// oldest queued envelope is dropped.
    pub publish_queue_cap: usize,
    /// Handlers running longer than this are logged as stuck.
    pub handler_budget: Duration,
}

impl BusConfig {
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            redis_url: None,
            connect_timeout: Duration::from_secs(5),
            publish_queue_cap: 1_000,
            handler_budget: Duration::from_secs(1),
        }
    }

    pub fn with_redis(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }
}

/// Shared channel table for in-memory buses. Every bus created from one
/// hub sees every other's publishes, which is how single-process
/// deployments and unit tests wire a whole fleet together.
#[derive(Clone, Default)]
pub struct MemoryHub {
    subs: Arc<OnceSubs>,
}

/// Lazily built so `MemoryHub::default()` needs no runtime.
#[derive(Default)]
struct OnceSubs(std::sync::OnceLock<Arc<Subscriptions>>);

impl OnceSubs {
    fn get(&self, budget: Duration) -> Arc<Subscriptions> {
        self.0.get_or_init(|| Arc::new(Subscriptions::new(budget))).clone()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }
}

enum Transport {
    Memory,
    Redis(redis_transport::RedisHandle),
}

struct Inner {
    sender_id: std::sync::RwLock<String>,
    /// Ids this bus answers directed envelopes for: the initial temporary
    /// id plus any permanent id adopted later.
    local_ids: Arc<std::sync::RwLock<BTreeSet<String>>>,
    subs: Arc<Subscriptions>,
    replies: Arc<ReplyMap>,
    transport: Transport,
    metrics: Arc<BusMetrics>,
    response_tokens: Mutex<Vec<SubscriptionToken>>,
}

type ReplyMap = Mutex<HashMap<uuid::Uuid, tokio::sync::oneshot::Sender<Envelope>>>;

#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    /// Connect the production transport, or fall back to in-memory with a
    /// warning when Redis is unreachable at construction time.
    pub async fn connect(config: BusConfig) -> Result<Self, Error> {
        let Some(url) = config.redis_url.clone() else {
            return Ok(Self::in_memory(&MemoryHub::new(), &config));
        };

        let client = redis::Client::open(url.as_str()).map_err(Error::Endpoint)?;
        match redis_transport::establish(&client, config.connect_timeout).await {
            Ok(session) => {
                let metrics = Arc::new(BusMetrics::default());
                let subs = Arc::new(Subscriptions::new(config.handler_budget));
                let handle = redis_transport::spawn(
                    client,
                    session,
                    subs.clone(),
                    metrics.clone(),
                    config.publish_queue_cap,
                );
                Ok(Self::build(&config, subs, Transport::Redis(handle), metrics))
            }
            Err(err) => {
                tracing::warn!(
                    %url,
                    error = %err,
                    "redis is unreachable, falling back to the in-memory bus"
                );
                Ok(Self::in_memory(&MemoryHub::new(), &config))
            }
        }
    }

    /// A bus over the process-local hub. All buses sharing `hub` deliver
    /// to each other.
    pub fn in_memory(hub: &MemoryHub, config: &BusConfig) -> Self {
        let subs = hub.subs.get(config.handler_budget);
        let metrics = Arc::new(BusMetrics::default());
        Self::build(config, subs, Transport::Memory, metrics)
    }

    fn build(
        config: &BusConfig,
        subs: Arc<Subscriptions>,
        transport: Transport,
        metrics: Arc<BusMetrics>,
    ) -> Self {
        let bus = Self {
            inner: Arc::new(Inner {
                sender_id: std::sync::RwLock::new(config.sender_id.clone()),
                local_ids: Arc::new(std::sync::RwLock::new(BTreeSet::from([config
                    .sender_id
                    .clone()]))),
                subs,
                replies: Arc::new(Mutex::new(HashMap::new())),
                transport,
                metrics,
                response_tokens: Mutex::new(Vec::new()),
            }),
        };
        bus.listen_for_replies(&config.sender_id);
        bus
    }

    /// The id currently stamped on outbound envelopes.
    pub fn sender_id(&self) -> String {
        self.inner.sender_id.read().unwrap().clone()
    }

    /// Adopt a new outbound sender id (the permanent id after a successful
    /// registration). The previous id keeps receiving directed traffic.
    pub fn set_sender_id(&self, id: &str) {
        *self.inner.sender_id.write().unwrap() = id.to_string();
        let inserted = self.inner.local_ids.write().unwrap().insert(id.to_string());
        if inserted {
            self.listen_for_replies(id);
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Fire-and-forget broadcast on a named channel.
    pub fn publish(&self, channel: &str, message: &Message) -> Result<(), Error> {
        let envelope = Envelope::new(message, self.sender_id(), None);
        self.publish_envelope(channel, envelope)
    }

    /// Directed delivery: the envelope's target id is set and subscribers
    /// that are not the target filter it out.
    pub fn send(&self, target: &str, channel: &str, message: &Message) -> Result<(), Error> {
        let envelope = Envelope::new(message, self.sender_id(), Some(target.to_string()));
        self.publish_envelope(channel, envelope)
    }

    /// Issue a request and suspend until a response with the same
    /// correlation id arrives, or `timeout` elapses.
    ///
    /// `target` is the peer's id when one peer owns the channel suffix;
    /// None addresses channels owned by a well-known responder (the
    /// registry's query channels).
    pub async fn request(
        &self,
        target: Option<&str>,
        channel: &str,
        message: &Message,
        timeout: Duration,
    ) -> Result<Envelope, Error> {
        let correlation_id = uuid::Uuid::new_v4();
        let envelope = Envelope::with_correlation(
            message,
            self.sender_id(),
            target.map(str::to_string),
            correlation_id,
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.inner.replies.lock().unwrap().insert(correlation_id, tx);

        if let Err(err) = self.publish_envelope(channel, envelope) {
            self.inner.replies.lock().unwrap().remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_elapsed) => {
                self.inner.replies.lock().unwrap().remove(&correlation_id);
                Err(Error::Timeout {
                    channel: channel.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Answer a request: the response reuses the request's correlation id
    /// and travels on the requester's reply channel.
    pub fn respond(&self, request: &Envelope, message: &Message) -> Result<(), Error> {
        let envelope = Envelope::with_correlation(
            message,
            self.sender_id(),
            Some(request.sender_id.clone()),
            request.correlation_id,
        );
        self.publish_envelope(&models::channels::response(&request.sender_id), envelope)
    }

    /// Register a handler on `channel`. Handlers receive decoded
    /// envelopes; directed envelopes whose target is not this bus are
    /// filtered before the handler runs.
    pub fn subscribe(&self, channel: &str, handler: Handler) -> SubscriptionToken {
        let local_ids = self.inner.local_ids.clone();
        let filtered: Handler = Arc::new(move |envelope: Envelope| {
            if let Some(target) = &envelope.target_id {
                if !local_ids.read().unwrap().contains(target) {
                    return Box::pin(std::future::ready(()));
                }
            }
            handler(envelope)
        });

        let (token, first) = self
            .inner
            .subs
            .subscribe(channel, filtered, self.inner.metrics.clone());
        if first {
            if let Transport::Redis(handle) = &self.inner.transport {
                handle.subscribe(channel);
            }
        }
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let emptied = self.inner.subs.unsubscribe(&token);
        if emptied {
            if let Transport::Redis(handle) = &self.inner.transport {
                handle.unsubscribe(&token.channel);
            }
        }
    }

    fn publish_envelope(&self, channel: &str, envelope: Envelope) -> Result<(), Error> {
        BusMetrics::incr(&self.inner.metrics.published);
        match &self.inner.transport {
            Transport::Memory => {
                self.inner.subs.dispatch(channel, &envelope);
                Ok(())
            }
            Transport::Redis(handle) => handle.publish(channel, envelope.encode()),
        }
    }

    /// Route responses arriving on this id's reply channel into the
    /// correlation table.
    fn listen_for_replies(&self, id: &str) {
        let replies = self.inner.replies.clone();
        let reply_handler: Handler = Arc::new(move |envelope: Envelope| {
            let waiter = replies.lock().unwrap().remove(&envelope.correlation_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => tracing::debug!(
                    correlation_id = %envelope.correlation_id,
                    "response arrived after its request completed"
                ),
            }
            Box::pin(std::future::ready(()))
        });

        let (token, first) = self.inner.subs.subscribe(
            &models::channels::response(id),
            reply_handler,
            self.inner.metrics.clone(),
        );
        if first {
            if let Transport::Redis(handle) = &self.inner.transport {
                handle.subscribe(token.channel());
            }
        }
        self.inner.response_tokens.lock().unwrap().push(token);
    }
}
