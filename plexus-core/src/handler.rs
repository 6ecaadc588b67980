//! Handler traits and event tables.
//!
//! Plexus routes dispatch to values implementing an explicit capability
//! interface, checked at compile time: [`RouteHandler`] for request targets
//! and the [`EventTable`] of a [`SocketMount`] for connection events. There
//! is no runtime introspection; a handler either implements the trait or
//! does not compile.
//!
//! Event tables are assembled once, at mount construction time, from a
//! fixed list of composed [`EventSet`]s. A live connection never gains or
//! loses event handlers.
//!
//! # Examples
//!
//! ## A function route handler
//!
//! ```
//! use plexus_core::handler::{route_handler, RequestContext};
//! use plexus_core::message::Message;
//! use plexus_core::pattern::ParamSet;
//! use plexus_core::error::Result;
//!
//! async fn show_user(params: ParamSet, _ctx: RequestContext) -> Result<Option<Message>> {
//!     let id = params.get("id").cloned().unwrap_or_default();
//!     Ok(Some(Message::text(format!("user {id}"))))
//! }
//!
//! let handler = route_handler(show_user);
//! ```
//!
//! ## Composing an event table
//!
//! ```
//! use plexus_core::handler::{EventSet, EventTable};
//! use plexus_core::message::Message;
//!
//! let chat = EventSet::new()
//!     .on("say", |ctx| async move {
//!         let text = ctx.payload["text"].as_str().unwrap_or("").to_string();
//!         Ok(Some(Message::text(text)))
//!     });
//!
//! let table = EventTable::builder()
//!     .compose(chat)
//!     .build();
//! assert!(table.get("say").is_some());
//! ```

use crate::connection::Connection;
use crate::dispatch::MessageDispatch;
use crate::error::Result;
use crate::message::Message;
use crate::pattern::ParamSet;
use crate::state::AppState;
use futures_util::future::BoxFuture;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// The request description a route handler receives alongside its extracted
/// parameters.
#[derive(Clone)]
pub struct RequestContext {
    /// Request method (e.g. `GET`).
    pub method: String,
    /// The request path as it arrived, before any rewrites.
    pub path: String,
    /// Shared application state.
    pub state: AppState,
}

/// Capability interface for terminal route targets.
///
/// `handle` receives the parameters extracted by the matched pattern and
/// returns an optional response message. Implement this trait directly, or
/// wrap an async function with [`route_handler`].
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, params: ParamSet, ctx: RequestContext) -> Result<Option<Message>>;
}

type BoxedRouteFn =
    Box<dyn Fn(ParamSet, RequestContext) -> BoxFuture<'static, Result<Option<Message>>> + Send + Sync>;

struct FnRouteHandler {
    f: BoxedRouteFn,
}

#[async_trait]
impl RouteHandler for FnRouteHandler {
    async fn handle(&self, params: ParamSet, ctx: RequestContext) -> Result<Option<Message>> {
        (self.f)(params, ctx).await
    }
}

/// Wraps an async function as a [`RouteHandler`].
///
/// The adapter is constructed once at registration time.
pub fn route_handler<F, Fut>(f: F) -> Arc<dyn RouteHandler>
where
    F: Fn(ParamSet, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
{
    Arc::new(FnRouteHandler {
        f: Box::new(move |params, ctx| Box::pin(f(params, ctx))),
    })
}

/// Everything an event callback gets to work with.
#[derive(Clone)]
pub struct EventContext {
    /// The connection the event fired on.
    pub conn: Connection,
    /// The event payload. Inbound frames pass the parsed JSON object;
    /// dispatched envelopes pass their argument array.
    pub payload: Value,
    /// Dispatch access for unicast/broadcast/multicast from inside the
    /// callback.
    pub dispatch: Arc<MessageDispatch>,
}

/// A registered event callback.
pub type EventFn = Arc<dyn Fn(EventContext) -> BoxFuture<'static, Result<Option<Message>>> + Send + Sync>;

/// A named set of event callbacks, the unit of composition for
/// [`EventTable`]s.
///
/// Sets play the role of shared "rooms" or capability modules: several
/// mounts can compose the same set.
#[derive(Default)]
pub struct EventSet {
    events: HashMap<String, EventFn>,
}

impl EventSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for `event`.
    pub fn on<F, Fut>(mut self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        self.events
            .insert(event.into(), Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Event names in this set.
    pub fn names(&self) -> Vec<&str> {
        self.events.keys().map(String::as_str).collect()
    }
}

/// An immutable table mapping event names to callbacks.
///
/// Built once from composed [`EventSet`]s; never mutated after the mount is
/// serving connections.
pub struct EventTable {
    events: HashMap<String, EventFn>,
    unknown: Option<EventFn>,
}

impl EventTable {
    pub fn builder() -> EventTableBuilder {
        EventTableBuilder {
            events: HashMap::new(),
            unknown: None,
        }
    }

    /// Looks up the callback for `event`, falling back to the `unknown`
    /// callback when one is configured.
    pub fn get(&self, event: &str) -> Option<&EventFn> {
        self.events.get(event).or(self.unknown.as_ref())
    }

    /// Returns `true` if `event` has an explicit (non-fallback) callback.
    pub fn contains(&self, event: &str) -> bool {
        self.events.contains_key(event)
    }
}

/// Builder assembling an [`EventTable`] from sets and single callbacks.
///
/// Later registrations override earlier ones for the same event name.
pub struct EventTableBuilder {
    events: HashMap<String, EventFn>,
    unknown: Option<EventFn>,
}

impl EventTableBuilder {
    /// Registers a single callback.
    pub fn on<F, Fut>(mut self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        self.events
            .insert(event.into(), Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Merges every callback of `set` into the table.
    pub fn compose(mut self, set: EventSet) -> Self {
        self.events.extend(set.events);
        self
    }

    /// Sets the fallback callback for events with no explicit entry.
    pub fn unknown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        self.unknown = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn build(self) -> EventTable {
        EventTable {
            events: self.events,
            unknown: self.unknown,
        }
    }
}

/// Lifecycle hook invoked on connection open or close.
pub type LifecycleHook = Arc<dyn Fn(Connection, Arc<MessageDispatch>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A socket handler mount: the tags a connection registers under, its event
/// table, and its lifecycle hooks.
///
/// Constructed once at registration time and shared by every connection
/// accepted on the mount's route.
pub struct SocketMount {
    tags: Vec<String>,
    table: EventTable,
    on_open: Option<LifecycleHook>,
    on_close: Option<LifecycleHook>,
}

impl SocketMount {
    /// Creates a mount around an assembled event table.
    pub fn new(table: EventTable) -> Self {
        Self {
            tags: Vec::new(),
            table,
            on_open: None,
            on_close: None,
        }
    }

    /// Adds a class/topic tag; connections on this mount register under
    /// every tag listed here.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Sets the hook invoked after a connection registers.
    pub fn on_open<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Connection, Arc<MessageDispatch>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_open = Some(Arc::new(move |conn, dispatch| Box::pin(f(conn, dispatch))));
        self
    }

    /// Sets the hook invoked after a connection unregisters.
    pub fn on_close<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Connection, Arc<MessageDispatch>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_close = Some(Arc::new(move |conn, dispatch| Box::pin(f(conn, dispatch))));
        self
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn table(&self) -> &EventTable {
        &self.table
    }

    pub(crate) fn open_hook(&self) -> Option<&LifecycleHook> {
        self.on_open.as_ref()
    }

    pub(crate) fn close_hook(&self) -> Option<&LifecycleHook> {
        self.on_close.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_context(payload: Value) -> EventContext {
        let registry = Arc::new(ConnectionRegistry::new("test"));
        let dispatch = Arc::new(MessageDispatch::new(registry.clone()));
        let (frames, _frames_rx) = mpsc::unbounded_channel();
        let (envelopes, _envelopes_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            registry.allocate_id(),
            Vec::new(),
            "127.0.0.1:0".parse().unwrap(),
            frames,
            envelopes,
        );
        EventContext {
            conn,
            payload,
            dispatch,
        }
    }

    #[tokio::test]
    async fn test_route_handler_adapter() {
        let handler = route_handler(|params: ParamSet, _ctx| async move {
            Ok(Some(Message::text(params["id"].clone())))
        });
        let mut params = ParamSet::new();
        params.insert("id".to_string(), "7".to_string());
        let ctx = RequestContext {
            method: "GET".to_string(),
            path: "/users/7".to_string(),
            state: AppState::new(),
        };
        let reply = handler.handle(params, ctx).await.unwrap().unwrap();
        assert_eq!(reply.as_text(), Some("7"));
    }

    #[tokio::test]
    async fn test_event_table_lookup_and_call() {
        let table = EventTable::builder()
            .on("echo", |ctx: EventContext| async move {
                Ok(Some(Message::text(ctx.payload["text"].as_str().unwrap_or("").to_string())))
            })
            .build();

        let cb = table.get("echo").unwrap().clone();
        let reply = cb(test_context(json!({"text": "hi"}))).await.unwrap().unwrap();
        assert_eq!(reply.as_text(), Some("hi"));
        assert!(table.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_compose_and_override() {
        let base = EventSet::new().on("ping", |_ctx| async move { Ok(Some(Message::text("set"))) });
        let table = EventTable::builder()
            .compose(base)
            .on("ping", |_ctx| async move { Ok(Some(Message::text("override"))) })
            .build();

        let cb = table.get("ping").unwrap().clone();
        let reply = cb(test_context(json!({}))).await.unwrap().unwrap();
        assert_eq!(reply.as_text(), Some("override"));
    }

    #[tokio::test]
    async fn test_unknown_fallback() {
        let table = EventTable::builder()
            .unknown(|_ctx| async move { Ok(Some(Message::text("fallback"))) })
            .build();

        assert!(!table.contains("anything"));
        let cb = table.get("anything").unwrap().clone();
        let reply = cb(test_context(json!({}))).await.unwrap().unwrap();
        assert_eq!(reply.as_text(), Some("fallback"));
    }
}
