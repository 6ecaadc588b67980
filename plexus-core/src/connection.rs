//! Connection handles and WebSocket lifecycle.
//!
//! Each connection runs a read task, a write task fed by an unbounded
//! channel, and an envelope task that feeds dispatched messages through the
//! connection's event table. The unbounded writer channel keeps slow peers
//! from stalling fan-out: delivery is a non-blocking queue push.
//!
//! # Inbound protocol
//!
//! Connections speak an auto-dispatch protocol over text frames. Every
//! frame must parse as a JSON object with a string `event` field naming the
//! callback to run. If the payload carries an `_EID_` correlation id, an
//! acknowledgment frame echoing it is sent back immediately, before the
//! event callback runs:
//!
//! ```text
//! {"event":"_ack_","_EID_":<id>}
//! ```
//!
//! Malformed payloads, binary frames, and events with no callback (and no
//! `unknown` fallback) close the connection.

use crate::dispatch::{Envelope, MessageDispatch};
use crate::error::{Error, Result};
use crate::handler::{EventContext, SocketMount};
use crate::message::{Message, MessageType};
use crate::registry::{ConnectionId, ConnectionRegistry};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Metadata about a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// The connection's identity.
    pub id: ConnectionId,
    /// Socket address of the connected peer.
    pub addr: SocketAddr,
    /// Unix timestamp of connection establishment.
    pub connected_at: u64,
}

/// A live connection handle.
///
/// Cheaply cloneable; the registry, dispatch layer, and event callbacks all
/// hold clones. The handle knows nothing about the transport beyond its two
/// outbound queues: raw frames for the peer and envelopes for the event
/// table.
pub struct Connection {
    id: ConnectionId,
    tags: Arc<Vec<String>>,
    info: ConnectionInfo,
    frames: mpsc::UnboundedSender<Message>,
    envelopes: mpsc::UnboundedSender<Envelope>,
}

impl Connection {
    /// Creates a connection handle around its outbound queues.
    pub fn new(
        id: ConnectionId,
        tags: Vec<String>,
        addr: SocketAddr,
        frames: mpsc::UnboundedSender<Message>,
        envelopes: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let info = ConnectionInfo {
            id: id.clone(),
            addr,
            connected_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        Self {
            id,
            tags: Arc::new(tags),
            info,
            frames,
            envelopes,
        }
    }

    /// The connection's identity.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The class/topic tags this connection registered under.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Connection metadata.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Queues a frame for the peer.
    ///
    /// Returns an error if the connection's write task has gone away.
    pub fn send(&self, message: Message) -> Result<()> {
        self.frames
            .send(message)
            .map_err(|_| Error::ConnectionNotFound(self.id.clone()))
    }

    /// Queues a text frame for the peer.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text.into()))
    }

    /// Queues a binary frame for the peer.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.send(Message::binary(data))
    }

    /// Serializes `data` as JSON and queues it as a text frame.
    pub fn send_json<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string(data)?;
        self.send_text(json)
    }

    /// Delivers a dispatched envelope to this connection's event table.
    ///
    /// This is the delivery capability the dispatch layer fans out over: a
    /// non-blocking queue push that fails when the connection is closed but
    /// never blocks the caller.
    pub fn deliver(&self, envelope: &Envelope) -> Result<()> {
        self.envelopes
            .send(envelope.clone())
            .map_err(|_| Error::ConnectionNotFound(self.id.clone()))
    }
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tags: self.tags.clone(),
            info: self.info.clone(),
            frames: self.frames.clone(),
            envelopes: self.envelopes.clone(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Builds the acknowledgment frame for a payload carrying `_EID_`.
pub(crate) fn ack_frame(eid: &Value) -> Message {
    Message::text(json!({ "event": "_ack_", "_EID_": eid }).to_string())
}

/// Decodes an inbound frame into its event name and payload.
///
/// Fails with [`Error::InvalidMessage`] on a non-text frame, an
/// unparseable payload, or a payload without a string `event` field.
fn decode_event(msg: &Message) -> Result<(String, Value)> {
    let text = msg.as_text().ok_or(Error::InvalidMessage)?;
    let payload: Value = serde_json::from_str(text).map_err(|_| Error::InvalidMessage)?;
    let event = payload
        .get("event")
        .and_then(Value::as_str)
        .ok_or(Error::InvalidMessage)?
        .to_string();
    Ok((event, payload))
}

/// Processes one inbound frame through the auto-dispatch protocol.
///
/// Returns `false` when the connection must be closed: non-text frame,
/// unparseable payload, missing `event` field, or an event with no
/// callback.
pub(crate) async fn process_frame(
    conn: &Connection,
    mount: &SocketMount,
    dispatch: &Arc<MessageDispatch>,
    msg: Message,
) -> bool {
    let (event, payload) = match decode_event(&msg) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("Rejecting frame from {}: {}; closing connection", conn.id(), e);
            return false;
        }
    };

    // Acknowledge before the event callback runs.
    if let Some(eid) = payload.get("_EID_") {
        if let Err(e) = conn.send(ack_frame(eid)) {
            warn!("Failed to ack {} on {}: {}", event, conn.id(), e);
        }
    }

    let Some(callback) = mount.table().get(&event) else {
        warn!(
            "No callback for event '{}' from {}; closing connection",
            event,
            conn.id()
        );
        return false;
    };

    let ctx = EventContext {
        conn: conn.clone(),
        payload,
        dispatch: dispatch.clone(),
    };
    match callback(ctx).await {
        Ok(Some(reply)) => {
            if let Err(e) = conn.send(reply) {
                warn!("Failed to reply to {}: {}", conn.id(), e);
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!("Event '{}' failed on {}: {}", event, conn.id(), e);
        }
    }
    true
}

/// Runs a dispatched envelope through the connection's event table.
async fn process_envelope(
    conn: &Connection,
    mount: &SocketMount,
    dispatch: &Arc<MessageDispatch>,
    envelope: Envelope,
) {
    let Some(callback) = mount.table().get(&envelope.event) else {
        debug!(
            "No callback for dispatched event '{}' on {}",
            envelope.event,
            conn.id()
        );
        return;
    };
    let ctx = EventContext {
        conn: conn.clone(),
        payload: Value::Array(envelope.arguments),
        dispatch: dispatch.clone(),
    };
    match callback(ctx).await {
        Ok(Some(reply)) => {
            if let Err(e) = conn.send(reply) {
                warn!("Failed to forward dispatched reply to {}: {}", conn.id(), e);
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!(
                "Dispatched event '{}' failed on {}: {}",
                envelope.event,
                conn.id(),
                e
            );
        }
    }
}

/// Handles the full lifecycle of an accepted WebSocket connection.
///
/// 1. Allocates an identity and registers the handle (with the mount's
///    tags) in the registry; a closed registry drops the socket.
/// 2. Invokes the mount's open hook.
/// 3. Runs write, envelope, and read tasks until any of them ends, then
///    aborts and joins the others.
/// 4. Unregisters and invokes the close hook.
///
/// The registry entry is removed before the close hook fires, so in-flight
/// fan-out either finds the handle or skips it; it never observes a
/// half-dead registration.
pub async fn handle_socket(
    stream: WebSocketStream<TcpStream>,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    dispatch: Arc<MessageDispatch>,
    mount: Arc<SocketMount>,
) {
    let (mut ws_sender, mut ws_receiver) = stream.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Message>();
    let (envelopes_tx, mut envelopes_rx) = mpsc::unbounded_channel::<Envelope>();

    let conn = Connection::new(
        registry.allocate_id(),
        mount.tags().to_vec(),
        peer_addr,
        frames_tx,
        envelopes_tx,
    );

    let conn_id = match registry.register(conn.clone()) {
        Ok(id) => id,
        Err(e) => {
            warn!("Dropping connection from {}: {}", peer_addr, e);
            let _ = ws_sender.close().await;
            return;
        }
    };
    info!("Connection {} established from {}", conn_id, peer_addr);

    if let Some(hook) = mount.open_hook() {
        hook(conn.clone(), dispatch.clone()).await;
    }

    let write_id = conn_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(message) = frames_rx.recv().await {
            if let Err(e) = ws_sender.send(message.into_tungstenite()).await {
                error!("Failed to write frame to {}: {}", write_id, e);
                break;
            }
        }
        debug!("Write task ended for {}", write_id);
    });

    let env_conn = conn.clone();
    let env_mount = mount.clone();
    let env_dispatch = dispatch.clone();
    let mut envelope_task = tokio::spawn(async move {
        while let Some(envelope) = envelopes_rx.recv().await {
            process_envelope(&env_conn, &env_mount, &env_dispatch, envelope).await;
        }
        debug!("Envelope task ended for {}", env_conn.id());
    });

    let read_conn = conn.clone();
    let read_mount = mount.clone();
    let read_dispatch = dispatch.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(raw) => {
                    if raw.is_close() {
                        info!("Close frame from {}", read_conn.id());
                        break;
                    }
                    let message = Message::from_tungstenite(raw);
                    if matches!(message.msg_type, MessageType::Ping | MessageType::Pong) {
                        continue;
                    }
                    if !process_frame(&read_conn, &read_mount, &read_dispatch, message).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("WebSocket error on {}: {}", read_conn.id(), e);
                    break;
                }
            }
        }
    });

    // The surviving tasks hold Connection clones whose senders keep each
    // other's channels open, so they never end on their own. Abort and
    // join them before unregistering. Only the two handles that did not
    // complete in the select may be polled again.
    tokio::select! {
        _ = &mut write_task => {
            envelope_task.abort();
            read_task.abort();
            let _ = tokio::join!(envelope_task, read_task);
        }
        _ = &mut envelope_task => {
            write_task.abort();
            read_task.abort();
            let _ = tokio::join!(write_task, read_task);
        }
        _ = &mut read_task => {
            write_task.abort();
            envelope_task.abort();
            let _ = tokio::join!(write_task, envelope_task);
        }
    }

    registry.unregister(&conn_id);
    if let Some(hook) = mount.close_hook() {
        hook(conn, dispatch.clone()).await;
    }
    info!("Connection {} closed", conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EventTable;
    use crate::message::Message;

    fn test_parts() -> (
        Connection,
        mpsc::UnboundedReceiver<Message>,
        Arc<MessageDispatch>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new("srv"));
        let dispatch = Arc::new(MessageDispatch::new(registry.clone()));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (envelopes_tx, envelopes_rx) = mpsc::unbounded_channel();
        std::mem::forget(envelopes_rx);
        let conn = Connection::new(
            registry.allocate_id(),
            Vec::new(),
            "127.0.0.1:0".parse().unwrap(),
            frames_tx,
            envelopes_tx,
        );
        (conn, frames_rx, dispatch)
    }

    fn echo_mount() -> SocketMount {
        SocketMount::new(
            EventTable::builder()
                .on("echo", |ctx: EventContext| async move {
                    let text = ctx.payload["text"].as_str().unwrap_or("").to_string();
                    Ok(Some(Message::text(text)))
                })
                .build(),
        )
    }

    #[tokio::test]
    async fn test_known_event_keeps_connection_open() {
        let (conn, mut frames, dispatch) = test_parts();
        let mount = echo_mount();
        let keep = process_frame(
            &conn,
            &mount,
            &dispatch,
            Message::text(r#"{"event":"echo","text":"hi"}"#),
        )
        .await;
        assert!(keep);
        assert_eq!(frames.recv().await.unwrap().as_text(), Some("hi"));
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(
            decode_event(&Message::binary(vec![1, 2])),
            Err(Error::InvalidMessage)
        ));
        assert!(matches!(
            decode_event(&Message::text("not json")),
            Err(Error::InvalidMessage)
        ));
        assert!(matches!(
            decode_event(&Message::text(r#"{"no":"event"}"#)),
            Err(Error::InvalidMessage)
        ));

        let (event, payload) = decode_event(&Message::text(r#"{"event":"say","n":1}"#)).unwrap();
        assert_eq!(event, "say");
        assert_eq!(payload["n"], 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_closes_connection() {
        let (conn, _frames, dispatch) = test_parts();
        let mount = echo_mount();
        assert!(!process_frame(&conn, &mount, &dispatch, Message::text("not json")).await);
        assert!(!process_frame(&conn, &mount, &dispatch, Message::binary(vec![1, 2])).await);
        assert!(
            !process_frame(&conn, &mount, &dispatch, Message::text(r#"{"no":"event"}"#)).await
        );
    }

    #[tokio::test]
    async fn test_unknown_event_without_fallback_closes() {
        let (conn, _frames, dispatch) = test_parts();
        let mount = echo_mount();
        let keep = process_frame(
            &conn,
            &mount,
            &dispatch,
            Message::text(r#"{"event":"nope"}"#),
        )
        .await;
        assert!(!keep);
    }

    #[tokio::test]
    async fn test_eid_ack_precedes_handler_reply() {
        let (conn, mut frames, dispatch) = test_parts();
        let mount = echo_mount();
        let keep = process_frame(
            &conn,
            &mount,
            &dispatch,
            Message::text(r#"{"event":"echo","_EID_":"abc","text":"x"}"#),
        )
        .await;
        assert!(keep);

        let first = frames.recv().await.unwrap();
        let ack: Value = first.json().unwrap();
        assert_eq!(ack["event"], "_ack_");
        assert_eq!(ack["_EID_"], "abc");

        let second = frames.recv().await.unwrap();
        assert_eq!(second.as_text(), Some("x"));
    }

    #[tokio::test]
    async fn test_closed_connection_releases_tasks() {
        let registry = Arc::new(ConnectionRegistry::new("srv"));
        let dispatch = Arc::new(MessageDispatch::new(registry.clone()));
        let mount = Arc::new(echo_mount());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = {
            let registry = registry.clone();
            let dispatch = dispatch.clone();
            let mount = mount.clone();
            tokio::spawn(async move {
                let (stream, peer_addr) = listener.accept().await.unwrap();
                let ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();
                handle_socket(ws_stream, peer_addr, registry, dispatch, mount).await;
            })
        };

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut client, _) = tokio_tungstenite::client_async(format!("ws://{addr}"), stream)
            .await
            .unwrap();
        client.close(None).await.unwrap();
        drop(client);

        server.await.unwrap();
        assert_eq!(registry.count(), 0);
        // the per-connection tasks went down with the socket; only the
        // test's own handle remains
        assert_eq!(Arc::strong_count(&mount), 1);
    }

    #[tokio::test]
    async fn test_deliver_fails_when_event_queue_dropped() {
        let registry = Arc::new(ConnectionRegistry::new("srv"));
        let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
        let (envelopes_tx, envelopes_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            registry.allocate_id(),
            Vec::new(),
            "127.0.0.1:0".parse().unwrap(),
            frames_tx,
            envelopes_tx,
        );
        drop(envelopes_rx);
        let envelope = Envelope::unicast("srv", conn.id().clone(), "ping", Vec::new());
        assert!(matches!(
            conn.deliver(&envelope),
            Err(Error::ConnectionNotFound(_))
        ));
    }
}
