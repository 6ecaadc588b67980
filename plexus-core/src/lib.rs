//! # Plexus Core - Realtime Routing and Dispatch
//!
//! `plexus-core` is the foundational library for the Plexus realtime
//! framework. It provides path-pattern routing with rewrite support and
//! distributed message dispatch for WebSocket applications, built on
//! `tokio-tungstenite`.
//!
//! ## Overview
//!
//! Plexus serves HTTP and WebSocket traffic on one port. Request paths
//! are resolved through an ordered, first-match-wins route table whose
//! patterns are compiled from a compact string grammar; matched socket
//! mounts get event-driven connections that can message each other
//! across processes through an optional Redis bridge.
//!
//! ## Key Features
//!
//! - **Route patterns**: literals, `:name`, `(:name)`, `(:name){regex}`,
//!   and a terminal `*` catch-all, compiled once at registration
//! - **Rewrite routes**: transform the request path mid-resolution, for
//!   URL-embedded options like a leading locale or format segment
//! - **Targeted dispatch**: unicast to one connection id, broadcast to a
//!   tag, multicast to everything
//! - **Cross-process delivery**: an optional Redis pub/sub bridge with a
//!   self-healing subscriber, transparent to callers
//! - **Event tables**: named JSON events mapped to async callbacks, with
//!   automatic `_EID_` acknowledgements
//! - **Explicit context**: no globals; handlers reach the registry and
//!   dispatch through the contexts they are handed
//!
//! ## Module Structure
//!
//! - [`pattern`]: route-string compilation and path matching
//! - [`router`]: ordered resolution with rewrite semantics
//! - [`server`]: the server context object and accept loop
//! - [`handler`]: request handlers, event tables, and socket mounts
//! - [`connection`]: per-connection lifecycle and frame processing
//! - [`registry`]: the id and tag index of live connections
//! - [`dispatch`]: envelope fan-out, local and remote
//! - [`bridge`]: the Redis pub/sub bridge
//! - [`message`]: WebSocket message types
//! - [`state`]: shared application state container
//! - [`config`]: server and bridge configuration
//! - [`error`]: error types and result handling
//!
//! ## Quick Start
//!
//! ```no_run
//! use plexus_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let chat = SocketMount::new(
//!         EventTable::builder()
//!             .on("say", |ctx: EventContext| async move {
//!                 let text = ctx.payload["text"].clone();
//!                 ctx.dispatch
//!                     .broadcast(Some(ctx.conn.id()), "chat", "said", vec![text])
//!                     .await;
//!                 Ok(None)
//!             })
//!             .build(),
//!     )
//!     .tag("chat");
//!
//!     Server::new()
//!         .socket("/chat", chat)?
//!         .route("/users/:id", |params, _ctx| async move {
//!             Ok(Some(Message::text(format!("user {}", params["id"]))))
//!         })?
//!         .run()
//!         .await
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod message;
pub mod pattern;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;

pub use bridge::{PubSubBridge, RedisBridge};
pub use config::{BridgeConfig, ServerConfig};
pub use connection::{Connection, ConnectionInfo};
pub use dispatch::{Envelope, MessageDispatch};
pub use error::{Error, Result};
pub use handler::{
    route_handler, EventContext, EventSet, EventTable, RequestContext, RouteHandler, SocketMount,
};
pub use message::{Message, MessageType};
pub use pattern::{CompiledPattern, ParamSet, CATCH_ALL};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use router::{Router, Target};
pub use server::{Server, ServerHandle};
pub use state::AppState;

/// Commonly used types for Plexus applications.
///
/// # Examples
///
/// ```
/// use plexus_core::prelude::*;
///
/// # fn example() -> Result<()> {
/// let server = Server::new().route("/ping", |_params, _ctx| async move {
///     Ok(Some(Message::text("pong")))
/// })?;
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    pub use crate::config::{BridgeConfig, ServerConfig};
    pub use crate::connection::{Connection, ConnectionInfo};
    pub use crate::dispatch::{Envelope, MessageDispatch};
    pub use crate::error::{Error, Result};
    pub use crate::handler::{
        route_handler, EventContext, EventSet, EventTable, RequestContext, RouteHandler,
        SocketMount,
    };
    pub use crate::message::{Message, MessageType};
    pub use crate::pattern::{CompiledPattern, ParamSet};
    pub use crate::registry::{ConnectionId, ConnectionRegistry};
    pub use crate::router::{Router, Target};
    pub use crate::server::{Server, ServerHandle};
    pub use crate::state::AppState;
}
