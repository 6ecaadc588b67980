//! Unicast, broadcast, and multicast message dispatch.
//!
//! All three delivery shapes follow the same algorithm: build an
//! [`Envelope`] tagged with this process's server id, resolve the local
//! target set through the [`ConnectionRegistry`], push the envelope onto
//! every resolved handle tolerating per-handle failure, and — when a
//! [`PubSubBridge`] is configured — publish the envelope on the shared
//! channel so other processes can serve their own members. Publication is
//! unconditional because the sender cannot know the remote membership.
//!
//! # Loop prevention
//!
//! Every subscriber of the shared channel, including this process's own,
//! discards envelopes whose `server` field equals the local server id:
//! local members were already served by the synchronous branch.
//! [`MessageDispatch::accept_remote`] applies the filter and re-injects
//! through the identical local fan-out path as direct calls.
//!
//! # Examples
//!
//! ```no_run
//! use plexus_core::dispatch::MessageDispatch;
//! use plexus_core::registry::ConnectionRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let registry = Arc::new(ConnectionRegistry::new("srv1"));
//! let dispatch = Arc::new(MessageDispatch::new(registry));
//!
//! dispatch
//!     .broadcast(None, "chat", "joined", vec!["alice".into()])
//!     .await;
//! # }
//! ```

use crate::bridge::PubSubBridge;
use crate::connection::Connection;
use crate::registry::{ConnectionId, ConnectionRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

/// The wire envelope carried between processes and queued to local
/// handles.
///
/// Created at the sending call, consumed once at each receiving process;
/// never persisted. `target` carries a connection id for unicast; `tag`
/// carries a class/topic tag for broadcast and multicast; both absent means
/// every registered connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Origin server id, used for loop prevention.
    pub server: String,
    /// Target connection id, for unicast.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target: Option<ConnectionId>,
    /// Target class/topic tag, for broadcast and multicast.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tag: Option<String>,
    /// Event name invoked on each receiving connection's event table.
    pub event: String,
    /// Positional event arguments.
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl Envelope {
    /// Builds a point-to-point envelope.
    pub fn unicast(
        server: impl Into<String>,
        target: ConnectionId,
        event: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            server: server.into(),
            target: Some(target),
            tag: None,
            event: event.into(),
            arguments,
        }
    }

    /// Builds a tag-addressed envelope.
    pub fn to_tag(
        server: impl Into<String>,
        tag: impl Into<String>,
        event: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            server: server.into(),
            target: None,
            tag: Some(tag.into()),
            event: event.into(),
            arguments,
        }
    }
}

/// Message dispatch over a connection registry, with an optional pub/sub
/// bridge for cross-process delivery.
pub struct MessageDispatch {
    registry: Arc<ConnectionRegistry>,
    bridge: OnceLock<Arc<dyn PubSubBridge>>,
}

impl MessageDispatch {
    /// Creates a dispatcher over the given registry. No bridge is
    /// configured by default; delivery stays process-local.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            bridge: OnceLock::new(),
        }
    }

    /// The local origin server id stamped onto every envelope.
    pub fn server_id(&self) -> &str {
        self.registry.server_id()
    }

    /// The registry this dispatcher resolves targets through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Installs the pub/sub bridge. May be called at most once; later
    /// calls are ignored with a warning.
    pub fn set_bridge(&self, bridge: Arc<dyn PubSubBridge>) {
        if self.bridge.set(bridge).is_err() {
            warn!("Bridge already configured; ignoring replacement");
        }
    }

    /// Sends an event to a single connection, local or remote.
    ///
    /// Returns the number of local deliveries (0 or 1); remote delivery is
    /// best-effort through the bridge.
    pub async fn unicast(
        &self,
        _sender: Option<&ConnectionId>,
        target: &ConnectionId,
        event: &str,
        arguments: Vec<Value>,
    ) -> usize {
        let envelope = Envelope::unicast(self.server_id(), target.clone(), event, arguments);
        self.send(envelope, None).await
    }

    /// Sends an event to every member of a class tag, excluding the
    /// sender's own connection.
    pub async fn broadcast(
        &self,
        sender: Option<&ConnectionId>,
        tag: &str,
        event: &str,
        arguments: Vec<Value>,
    ) -> usize {
        let envelope = Envelope::to_tag(self.server_id(), tag, event, arguments);
        self.send(envelope, sender).await
    }

    /// Sends an event to a named subset tag. Delivery mechanics are
    /// identical to [`broadcast`](Self::broadcast); only target selection
    /// differs by convention.
    pub async fn multicast(
        &self,
        sender: Option<&ConnectionId>,
        tag: &str,
        event: &str,
        arguments: Vec<Value>,
    ) -> usize {
        let envelope = Envelope::to_tag(self.server_id(), tag, event, arguments);
        self.send(envelope, sender).await
    }

    async fn send(&self, envelope: Envelope, exclude: Option<&ConnectionId>) -> usize {
        let delivered = self.deliver_local(&envelope, exclude);
        if let Some(bridge) = self.bridge.get() {
            // Published even when local delivery succeeded: remote
            // membership is unknown to the sender. Failures go to the log,
            // never to the caller.
            if let Err(e) = bridge.publish(&envelope).await {
                error!("Bridge publish failed for event '{}': {}", envelope.event, e);
            }
        }
        delivered
    }

    /// Fans an envelope out to the local target set.
    ///
    /// This is the single local delivery path: direct calls and bridge
    /// re-injection both land here. Per-handle failure is logged and does
    /// not abort delivery to the remaining handles; a closed-but-not-yet
    /// unregistered connection must not break fan-out to its siblings.
    pub fn deliver_local(&self, envelope: &Envelope, exclude: Option<&ConnectionId>) -> usize {
        let targets: Vec<Connection> = if let Some(id) = &envelope.target {
            self.registry.lookup(id).into_iter().collect()
        } else if let Some(tag) = &envelope.tag {
            self.registry
                .members_of(tag)
                .iter()
                .filter_map(|id| self.registry.lookup(id))
                .collect()
        } else {
            self.registry.all_connections()
        };

        let mut delivered = 0;
        let mut failed = 0;
        for conn in &targets {
            if Some(conn.id()) == exclude {
                continue;
            }
            match conn.deliver(envelope) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    warn!("Delivery of '{}' to {} failed: {}", envelope.event, conn.id(), e);
                }
            }
        }
        if failed > 0 {
            info!(
                "Fan-out of '{}' complete: {} delivered, {} failed",
                envelope.event, delivered, failed
            );
        } else {
            debug!("Fan-out of '{}' complete: {} delivered", envelope.event, delivered);
        }
        delivered
    }

    /// Re-injects an envelope received from the shared channel.
    ///
    /// Envelopes originating from this process are discarded (the local
    /// members were already served directly). Returns `true` when the
    /// envelope was accepted for local fan-out.
    pub fn accept_remote(&self, envelope: &Envelope) -> bool {
        if envelope.server == self.server_id() {
            debug!("Discarding own envelope for event '{}'", envelope.event);
            return false;
        }
        self.deliver_local(envelope, None);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct RecordingBridge {
        published: Mutex<Vec<Envelope>>,
        fail: bool,
    }

    impl RecordingBridge {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl PubSubBridge for RecordingBridge {
        async fn publish(&self, envelope: &Envelope) -> Result<()> {
            self.published.lock().unwrap().push(envelope.clone());
            if self.fail {
                Err(crate::error::Error::custom("publish refused"))
            } else {
                Ok(())
            }
        }
    }

    fn register_member(
        registry: &Arc<ConnectionRegistry>,
        tags: &[&str],
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        std::mem::forget(frames_rx);
        let (envelopes_tx, envelopes_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            registry.allocate_id(),
            tags.iter().map(|t| t.to_string()).collect(),
            "127.0.0.1:0".parse().unwrap(),
            frames_tx,
            envelopes_tx,
        );
        let id = registry.register(conn).unwrap();
        (id, envelopes_rx)
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_target() {
        let registry = Arc::new(ConnectionRegistry::new("srv1"));
        let dispatch = MessageDispatch::new(registry.clone());
        let (target, mut target_rx) = register_member(&registry, &[]);
        let (_other, mut other_rx) = register_member(&registry, &[]);

        let delivered = dispatch.unicast(None, &target, "poke", vec![json!(1)]).await;
        assert_eq!(delivered, 1);

        let envelope = target_rx.recv().await.unwrap();
        assert_eq!(envelope.event, "poke");
        assert_eq!(envelope.arguments, vec![json!(1)]);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unicast_to_unknown_target_delivers_nothing() {
        let registry = Arc::new(ConnectionRegistry::new("srv1"));
        let dispatch = MessageDispatch::new(registry.clone());
        let delivered = dispatch
            .unicast(None, &"srv9-1".to_string(), "poke", Vec::new())
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let registry = Arc::new(ConnectionRegistry::new("srv1"));
        let dispatch = MessageDispatch::new(registry.clone());
        let (sender, mut sender_rx) = register_member(&registry, &["room"]);
        let (_a, mut a_rx) = register_member(&registry, &["room"]);
        let (_b, mut b_rx) = register_member(&registry, &["room"]);

        let delivered = dispatch
            .broadcast(Some(&sender), "room", "joined", Vec::new())
            .await;
        assert_eq!(delivered, 2);
        assert!(sender_rx.try_recv().is_err());
        assert_eq!(a_rx.recv().await.unwrap().event, "joined");
        assert_eq!(b_rx.recv().await.unwrap().event, "joined");
    }

    #[tokio::test]
    async fn test_multicast_restricted_to_tag() {
        let registry = Arc::new(ConnectionRegistry::new("srv1"));
        let dispatch = MessageDispatch::new(registry.clone());
        let (_in_tag, mut in_rx) = register_member(&registry, &["vip"]);
        let (_out_of_tag, mut out_rx) = register_member(&registry, &["other"]);

        let delivered = dispatch.multicast(None, "vip", "offer", Vec::new()).await;
        assert_eq!(delivered, 1);
        assert_eq!(in_rx.recv().await.unwrap().event, "offer");
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_abort_fanout() {
        let registry = Arc::new(ConnectionRegistry::new("srv1"));
        let dispatch = MessageDispatch::new(registry.clone());
        let (_a, mut a_rx) = register_member(&registry, &["room"]);
        let (_dead, dead_rx) = register_member(&registry, &["room"]);
        let (_b, mut b_rx) = register_member(&registry, &["room"]);
        // closed but not yet unregistered
        drop(dead_rx);

        let delivered = dispatch.broadcast(None, "room", "news", Vec::new()).await;
        assert_eq!(delivered, 2);
        assert_eq!(a_rx.recv().await.unwrap().event, "news");
        assert_eq!(b_rx.recv().await.unwrap().event, "news");
    }

    #[tokio::test]
    async fn test_loop_prevention() {
        let registry = Arc::new(ConnectionRegistry::new("srv1"));
        let dispatch = MessageDispatch::new(registry.clone());
        let (_member, mut member_rx) = register_member(&registry, &["room"]);

        // own envelope coming back from the channel: discarded
        let own = Envelope::to_tag("srv1", "room", "dup", Vec::new());
        assert!(!dispatch.accept_remote(&own));
        assert!(member_rx.try_recv().is_err());

        // foreign envelope: delivered to local members
        let foreign = Envelope::to_tag("srv2", "room", "hello", Vec::new());
        assert!(dispatch.accept_remote(&foreign));
        assert_eq!(member_rx.recv().await.unwrap().event, "hello");
    }

    #[tokio::test]
    async fn test_publish_is_unconditional() {
        let registry = Arc::new(ConnectionRegistry::new("srv1"));
        let dispatch = MessageDispatch::new(registry.clone());
        let bridge = RecordingBridge::new(false);
        dispatch.set_bridge(bridge.clone());
        let (target, mut target_rx) = register_member(&registry, &[]);

        // local delivery succeeds, publish still happens
        dispatch.unicast(None, &target, "poke", Vec::new()).await;
        assert!(target_rx.recv().await.is_some());
        let published = bridge.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].server, "srv1");
        assert_eq!(published[0].target.as_deref(), Some(target.as_str()));
    }

    #[tokio::test]
    async fn test_publish_failure_never_reaches_caller() {
        let registry = Arc::new(ConnectionRegistry::new("srv1"));
        let dispatch = MessageDispatch::new(registry.clone());
        dispatch.set_bridge(RecordingBridge::new(true));
        let (target, mut target_rx) = register_member(&registry, &[]);

        // the failing publish is logged; local delivery is unaffected
        let delivered = dispatch.unicast(None, &target, "poke", Vec::new()).await;
        assert_eq!(delivered, 1);
        assert!(target_rx.recv().await.is_some());
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::to_tag("srv1", "room", "hello", vec![json!("a"), json!(2)]);
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["server"], "srv1");
        assert_eq!(wire["tag"], "room");
        assert_eq!(wire["event"], "hello");
        assert_eq!(wire["arguments"], json!(["a", 2]));
        // unicast target omitted entirely for tag envelopes
        assert!(wire.get("target").is_none());

        let back: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back, envelope);
    }
}
