//! # Plexus - Realtime Web Framework for Rust
//!
//! Plexus is a realtime framework that serves HTTP and WebSocket traffic
//! on one port, routes requests through compiled path patterns with
//! rewrite support, and dispatches messages between connections locally
//! or across processes over Redis. Built on `tokio-tungstenite`.
//!
//! This crate is the user-facing facade; the implementation lives in
//! `plexus-core`.
//!
//! ## Quick Start
//!
//! Add Plexus to your `Cargo.toml`:
//!
//! ```text
//! [dependencies]
//! plexus = "0.1.0"
//! tokio = { version = "1.40", features = ["full"] }
//! serde_json = "1.0"
//! ```
//!
//! ### Routed Requests
//!
//! Route patterns support literals, required `:name` segments, optional
//! `(:name)` segments, constrained `(:name){regex}` segments, and a
//! terminal `*` catch-all. A pattern that extracts nothing gains an
//! implicit optional `id` parameter:
//!
//! ```no_run
//! use plexus::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     Server::new()
//!         // "/users/42" resolves here with params["id"] == "42"
//!         .route("/users", |params, _ctx| async move {
//!             let id = params.get("id").cloned().unwrap_or_default();
//!             Ok(Some(Message::text(format!("user {id}"))))
//!         })?
//!         .run()
//!         .await
//! }
//! ```
//!
//! ### Chat Over WebSocket
//!
//! Socket mounts register connections under tags and dispatch named JSON
//! events to async callbacks:
//!
//! ```no_run
//! use plexus::prelude::*;
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
//!     Server::new().socket("/chat", chat)?.run().await
//! }
//! ```
//!
//! ### Scaling Out
//!
//! Configure a bridge and every process of the application delivers the
//! same broadcasts, with loop prevention by origin server id:
//!
//! ```no_run
//! use plexus::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServerConfig {
//!         addr: "0.0.0.0:3000".to_string(),
//!         app_name: "chat".to_string(),
//!         bridge: Some(BridgeConfig::new("redis://localhost:6379")),
//!     };
//!
//!     Server::with_config(config).run().await
//! }
//! ```

pub use plexus_core::*;

/// Commonly used types for Plexus applications.
pub mod prelude {
    pub use plexus_core::prelude::*;
}
