//! Redis pub/sub transport: one multiplexed connection for publishes and
//! one dedicated pub/sub connection drained by the supervisor task below.
//! The supervisor owns reconnection: bounded exponential backoff, a capped
//! queue of publishes made while disconnected, and re-establishment of
//! every live subscription before that queue drains.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use exponential_backoff::Backoff;
use futures::StreamExt;

use envelope::Envelope;

use crate::subscriptions::Subscriptions;
use crate::{BusMetrics, Error};

const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub(crate) struct RedisHandle {
    cmd_tx: tokio::sync::mpsc::UnboundedSender<Cmd>,
}

enum Cmd {
    Publish { channel: String, bytes: Vec<u8> },
    Subscribe(String),
    Unsubscribe(String),
}

impl RedisHandle {
    pub fn publish(&self, channel: &str, bytes: Vec<u8>) -> Result<(), Error> {
        self.cmd_tx
            .send(Cmd::Publish {
                channel: channel.to_string(),
                bytes,
            })
            .map_err(|_| Error::Closed)
    }

    pub fn subscribe(&self, channel: &str) {
        let _ = self.cmd_tx.send(Cmd::Subscribe(channel.to_string()));
    }

    pub fn unsubscribe(&self, channel: &str) {
        let _ = self.cmd_tx.send(Cmd::Unsubscribe(channel.to_string()));
    }
}

pub(crate) struct Session {
    conn: redis::aio::MultiplexedConnection,
    pubsub: redis::aio::PubSub,
}

pub(crate) async fn establish(
    client: &redis::Client,
    timeout: Duration,
) -> Result<Session, redis::RedisError> {
    let connect = async {
        let conn = client.get_multiplexed_async_connection().await?;
        let pubsub = client.get_async_pubsub().await?;
        Ok(Session { conn, pubsub })
    };
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result,
        Err(_elapsed) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "redis connection attempt timed out",
        )
        .into()),
    }
}

pub(crate) fn spawn(
    client: redis::Client,
    session: Session,
    subs: Arc<Subscriptions>,
    metrics: Arc<BusMetrics>,
    queue_cap: usize,
) -> RedisHandle {
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(run(client, session, cmd_rx, subs, metrics, queue_cap));
    RedisHandle { cmd_tx }
}

enum ServeEnd {
    /// Every Bus handle is gone; stop for good.
    Closed,
    /// The transport failed; reconnect.
    Disconnected,
}

enum SubChange {
    Add(String),
    Remove(String),
}

async fn run(
    client: redis::Client,
    initial: Session,
    mut cmd_rx: tokio::sync::mpsc::UnboundedReceiver<Cmd>,
    subs: Arc<Subscriptions>,
    metrics: Arc<BusMetrics>,
    queue_cap: usize,
) {
    let mut queue: VecDeque<(String, Vec<u8>)> = VecDeque::new();
    let mut channels: HashSet<String> = HashSet::new();
    let backoff = {
        let mut backoff = Backoff::new(u32::MAX, RECONNECT_MIN, Some(RECONNECT_MAX));
        backoff.set_factor(2);
        backoff.set_jitter(0.2);
        backoff
    };
    let mut attempt: u32 = 0;
    let mut initial = Some(initial);

    loop {
        let mut session = match initial.take() {
            Some(session) => session,
            None => match establish(&client, Duration::from_secs(5)).await {
                Ok(session) => session,
                Err(err) => {
                    attempt += 1;
                    let delay = backoff.next(attempt).unwrap_or(RECONNECT_MAX);
                    tracing::warn!(error = %err, ?delay, "bus transport is down, backing off");
                    if !buffer_while_waiting(
                        delay, &mut cmd_rx, &mut queue, &mut channels, queue_cap, &metrics,
                    )
                    .await
                    {
                        return;
                    }
                    continue;
                }
            },
        };

        // Subscriptions come back before any queued publish goes out, so
        // this process cannot miss replies to its own drained traffic.
        if let Err(err) = prepare(&mut session, &channels, &mut queue).await {
            attempt += 1;
            let delay = backoff.next(attempt).unwrap_or(RECONNECT_MAX);
            tracing::warn!(error = %err, ?delay, "lost the bus transport while resuming");
            if !buffer_while_waiting(delay, &mut cmd_rx, &mut queue, &mut channels, queue_cap, &metrics)
                .await
            {
                return;
            }
            continue;
        }

        if attempt > 0 {
            BusMetrics::incr(&metrics.reconnects);
            tracing::info!("bus transport reconnected");
        }
        attempt = 0;

        match serve(
            &mut session,
            &mut cmd_rx,
            &mut queue,
            &mut channels,
            queue_cap,
            &metrics,
            &subs,
        )
        .await
        {
            ServeEnd::Closed => return,
            ServeEnd::Disconnected => {
                attempt += 1;
                let delay = backoff.next(attempt).unwrap_or(RECONNECT_MAX);
                tracing::warn!(?delay, "bus transport lost, backing off");
                if !buffer_while_waiting(
                    delay, &mut cmd_rx, &mut queue, &mut channels, queue_cap, &metrics,
                )
                .await
                {
                    return;
                }
            }
        }
    }
}

/// Re-subscribe every live channel, then drain the publish queue.
async fn prepare(
    session: &mut Session,
    channels: &HashSet<String>,
    queue: &mut VecDeque<(String, Vec<u8>)>,
) -> redis::RedisResult<()> {
    for channel in channels {
        session.pubsub.subscribe(channel).await?;
    }
    while let Some((channel, bytes)) = queue.pop_front() {
        if let Err(err) = publish(&mut session.conn, &channel, &bytes).await {
            queue.push_front((channel, bytes));
            return Err(err);
        }
    }
    Ok(())
}

async fn serve(
    session: &mut Session,
    cmd_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Cmd>,
    queue: &mut VecDeque<(String, Vec<u8>)>,
    channels: &mut HashSet<String>,
    queue_cap: usize,
    metrics: &BusMetrics,
    subs: &Subscriptions,
) -> ServeEnd {
    let Session { conn, pubsub } = session;

    'session: loop {
        let mut stream = pubsub.on_message();
        let change = loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(msg) => deliver(&msg, subs, metrics),
                    None => break 'session ServeEnd::Disconnected,
                },
                cmd = cmd_rx.recv() => match cmd {
                    None => break 'session ServeEnd::Closed,
                    Some(Cmd::Publish { channel, bytes }) => {
                        if let Err(err) = publish(conn, &channel, &bytes).await {
                            tracing::warn!(error = %err, "publish failed, queueing for reconnect");
                            enqueue(queue, channel, bytes, queue_cap, metrics);
                            break 'session ServeEnd::Disconnected;
                        }
                    }
                    Some(Cmd::Subscribe(channel)) => {
                        if channels.insert(channel.clone()) {
                            break SubChange::Add(channel);
                        }
                    }
                    Some(Cmd::Unsubscribe(channel)) => {
                        if channels.remove(&channel) {
                            break SubChange::Remove(channel);
                        }
                    }
                },
            }
        };

        // Subscription changes need exclusive access to the pub/sub
        // connection, which the message stream borrows.
        drop(stream);
        let result = match change {
            SubChange::Add(channel) => pubsub.subscribe(&channel).await,
            SubChange::Remove(channel) => pubsub.unsubscribe(&channel).await,
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "subscription change failed, transport lost");
            break ServeEnd::Disconnected;
        }
    }
}

async fn publish(
    conn: &mut redis::aio::MultiplexedConnection,
    channel: &str,
    bytes: &[u8],
) -> redis::RedisResult<()> {
    redis::cmd("PUBLISH")
        .arg(channel)
        .arg(bytes)
        .query_async::<i64>(conn)
        .await?;
    Ok(())
}

fn deliver(msg: &redis::Msg, subs: &Subscriptions, metrics: &BusMetrics) {
    let channel = msg.get_channel_name();
    let bytes = msg.get_payload_bytes();
    match Envelope::decode(bytes) {
        Ok(envelope) => subs.dispatch(channel, &envelope),
        Err(err) => {
            BusMetrics::incr(&metrics.decode_errors);
            tracing::warn!(
                channel,
                message_type = %offending_type(bytes),
                error = %err,
                "dropping undecodable message"
            );
        }
    }
}

/// Best-effort extraction of the `type` field for decode diagnostics.
fn offending_type(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "<unparseable>".to_string())
}

fn enqueue(
    queue: &mut VecDeque<(String, Vec<u8>)>,
    channel: String,
    bytes: Vec<u8>,
    cap: usize,
    metrics: &BusMetrics,
) {
    if queue.len() == cap {
        queue.pop_front();
        BusMetrics::incr(&metrics.dropped_overflow);
        tracing::warn!("publish queue overflowed, dropping the oldest envelope");
    }
    queue.push_back((channel, bytes));
}

/// Sit out a backoff delay while still absorbing commands, so publishes
/// issued during the outage land in the queue and subscription intent is
/// not lost. Returns false when every Bus handle is gone.
async fn buffer_while_waiting(
    delay: Duration,
    cmd_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Cmd>,
    queue: &mut VecDeque<(String, Vec<u8>)>,
    channels: &mut HashSet<String>,
    cap: usize,
    metrics: &BusMetrics,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                None => return false,
                Some(Cmd::Publish { channel, bytes }) => {
                    enqueue(queue, channel, bytes, cap, metrics);
                }
                Some(Cmd::Subscribe(channel)) => {
                    channels.insert(channel);
                }
                Some(Cmd::Unsubscribe(channel)) => {
                    channels.remove(&channel);
                }
            },
        }
    }
}
