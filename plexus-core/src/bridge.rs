//! Optional pub/sub backbone bridging dispatch across processes.
//!
//! The bridge is absent by default; dispatch stays process-local until one
//! is installed. With a bridge configured, every dispatched envelope is
//! additionally published on a well-known channel, and a background
//! subscriber task re-injects envelopes published by other processes into
//! the local fan-out path.
//!
//! Delivery through the bridge is best-effort: at-most-once across crash
//! boundaries, no ordering guarantee relative to other processes'
//! publishes. Publish failures are surfaced to the log, never to the
//! sending call. Subscriber connection loss triggers an unbounded retry
//! loop with backoff under the same subscription parameters.
//!
//! # Examples
//!
//! ```no_run
//! use plexus_core::bridge::RedisBridge;
//! use plexus_core::dispatch::MessageDispatch;
//! use plexus_core::registry::ConnectionRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() -> plexus_core::error::Result<()> {
//! let registry = Arc::new(ConnectionRegistry::new("srv1"));
//! let dispatch = Arc::new(MessageDispatch::new(registry));
//!
//! let bridge = RedisBridge::connect(
//!     "redis://127.0.0.1:6379",
//!     "myapp_pubsub",
//!     dispatch.clone(),
//! )
//! .await?;
//! dispatch.set_bridge(bridge);
//! # Ok(())
//! # }
//! ```

use crate::dispatch::{Envelope, MessageDispatch};
use crate::error::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Publishing side of a pub/sub backbone.
///
/// Pluggable: [`RedisBridge`] is the provided implementation, and tests
/// install recording fakes through the same trait.
#[async_trait]
pub trait PubSubBridge: Send + Sync {
    /// Publishes an envelope on the shared channel.
    async fn publish(&self, envelope: &Envelope) -> Result<()>;
}

/// Redis-backed pub/sub bridge.
///
/// Holds a multiplexed connection for publishing and owns one background
/// subscriber task that runs for the process lifetime.
pub struct RedisBridge {
    conn: MultiplexedConnection,
    channel: String,
}

impl RedisBridge {
    /// Connects to Redis and spawns the subscriber task.
    ///
    /// The subscriber listens on `channel`, decodes JSON envelopes, and
    /// re-injects them through [`MessageDispatch::accept_remote`] — the
    /// same local fan-out path direct calls use, so re-injected deliveries
    /// have identical semantics. Envelopes this process published are
    /// filtered out there.
    pub async fn connect(
        url: &str,
        channel: impl Into<String>,
        dispatch: Arc<MessageDispatch>,
    ) -> Result<Arc<Self>> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        let channel = channel.into();
        let bridge = Arc::new(Self {
            conn,
            channel: channel.clone(),
        });
        tokio::spawn(subscriber_loop(client, channel, dispatch));
        Ok(bridge)
    }

    /// The channel this bridge publishes and subscribes on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl PubSubBridge for RedisBridge {
    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(&self.channel, payload).await?;
        Ok(())
    }
}

/// Runs the subscriber forever, resubscribing with backoff on any failure.
async fn subscriber_loop(client: redis::Client, channel: String, dispatch: Arc<MessageDispatch>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match run_subscriber(&client, &channel, &dispatch).await {
            Ok(()) => {
                warn!("Subscription to '{}' ended; resubscribing", channel);
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!(
                    "Subscriber error on '{}': {} (retrying in {:?})",
                    channel, e, backoff
                );
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

async fn run_subscriber(
    client: &redis::Client,
    channel: &str,
    dispatch: &Arc<MessageDispatch>,
) -> Result<()> {
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(channel).await?;
    info!("Subscribed to pub/sub channel '{}'", channel);

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Unreadable pub/sub payload on '{}': {}", channel, e);
                continue;
            }
        };
        match serde_json::from_str::<Envelope>(&payload) {
            Ok(envelope) => {
                dispatch.accept_remote(&envelope);
            }
            Err(e) => {
                warn!("Undecodable envelope on '{}': {}", channel, e);
            }
        }
    }
    Ok(())
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
