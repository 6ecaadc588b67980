//! The server context: route table, registry, dispatch, and accept loop.
//!
//! A [`Server`] is an explicit context object assembled at startup. It
//! owns the route table and the shared connection registry, and hands a
//! [`MessageDispatch`] to every handler through the event context. There
//! is no global registration surface: everything a handler can reach is
//! threaded through the server it was mounted on.
//!
//! HTTP and WebSocket traffic share one port. Each accepted TCP stream is
//! peeked for an upgrade header: upgrade requests are resolved to a
//! socket mount and handed to the connection lifecycle, plain requests
//! are resolved to a request handler and answered with a minimal HTTP
//! response.
//!
//! # Examples
//!
//! ```no_run
//! use plexus_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::new()
//!         .route("/users/:id", |params, _ctx| async move {
//!             Ok(Some(Message::text(format!("user {}", params["id"]))))
//!         })?;
//!
//!     server.run().await
//! }
//! ```

use crate::bridge::RedisBridge;
use crate::config::{BridgeConfig, ServerConfig};
use crate::connection::handle_socket;
use crate::dispatch::MessageDispatch;
use crate::error::{Error, Result};
use crate::handler::{route_handler, RequestContext, SocketMount};
use crate::message::Message;
use crate::pattern::ParamSet;
use crate::registry::ConnectionRegistry;
use crate::router::{Router, Target};
use crate::state::AppState;
use regex::Regex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::accept_async;
use tracing::{error, info, warn};

/// The server context object.
///
/// Built with the chained registration methods, then consumed by
/// [`Server::run`]. Route registration order is dispatch precedence
/// order.
pub struct Server {
    config: ServerConfig,
    router: Router,
    state: AppState,
    registry: Arc<ConnectionRegistry>,
    dispatch: Arc<MessageDispatch>,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Creates a server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a server from an explicit configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(generate_server_id()));
        let dispatch = Arc::new(MessageDispatch::new(registry.clone()));
        Self {
            config,
            router: Router::new(),
            state: AppState::new(),
            registry,
            dispatch,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Registers a request handler for a route pattern.
    ///
    /// Fails with [`Error::InvalidPattern`] when the pattern does not
    /// compile; a broken route is never installed.
    pub fn route<F, Fut>(mut self, path: &str, f: F) -> Result<Self>
    where
        F: Fn(ParamSet, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        self.router.add(path, Target::Request(route_handler(f)))?;
        Ok(self)
    }

    /// Registers a request handler under a raw regular expression,
    /// bypassing the route-string grammar.
    pub fn route_regex<F, Fut>(mut self, regex: Regex, f: F) -> Self
    where
        F: Fn(ParamSet, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        self.router
            .add_regex(regex, Target::Request(route_handler(f)));
        self
    }

    /// Registers a rewrite route. When it matches, the request path is
    /// transformed and resolution continues; a rewrite never answers a
    /// request by itself.
    pub fn rewrite(mut self, path: &str) -> Result<Self> {
        self.router.add(path, Target::Rewrite)?;
        Ok(self)
    }

    /// Mounts a WebSocket endpoint at a route pattern.
    pub fn socket(mut self, path: &str, mount: SocketMount) -> Result<Self> {
        self.router.add(path, Target::Socket(Arc::new(mount)))?;
        Ok(self)
    }

    /// Inserts a value into the shared application state.
    pub fn with_state<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.state.insert(Arc::new(value));
        self
    }

    /// Configures the Redis bridge, replacing any bridge section from the
    /// configuration this server was built with.
    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.config.bridge = Some(bridge);
        self
    }

    /// This process's unique identity, the `server` field of every
    /// envelope it originates.
    pub fn server_id(&self) -> &str {
        self.registry.server_id()
    }

    /// The dispatch facade, for sending from outside a handler.
    pub fn dispatch(&self) -> Arc<MessageDispatch> {
        self.dispatch.clone()
    }

    /// The connection registry.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// A handle for stopping the server from another task.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Runs the accept loop until shutdown.
    ///
    /// Connects the Redis bridge first when one is configured, so no
    /// connection is accepted before cross-process delivery is live.
    pub async fn run(self) -> Result<()> {
        self.config.validate()?;
        let addr: SocketAddr = self
            .config
            .addr
            .parse()
            .map_err(|e| Error::custom(format!("Invalid address '{}': {}", self.config.addr, e)))?;

        if let Some(bridge_config) = &self.config.bridge {
            let channel = bridge_config.channel_name(&self.config.app_name);
            let bridge =
                RedisBridge::connect(&bridge_config.url, channel, self.dispatch.clone()).await?;
            self.dispatch.set_bridge(bridge);
        }

        // Make dispatch reachable from request handlers through state.
        self.state.insert(self.dispatch.clone());

        let listener = TcpListener::bind(addr).await?;
        info!(
            "Server {} listening on {}",
            self.registry.server_id(),
            addr
        );

        let shutdown = self.shutdown.clone();
        let server = Arc::new(self);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Shutdown requested; closing listener");
                    server.registry.close();
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer_addr).await {
                            error!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let mut buffer = [0u8; 1024];
        let n = tokio::time::timeout(std::time::Duration::from_secs(5), stream.peek(&mut buffer))
            .await
            .map_err(|_| Error::custom("Connection timed out before sending a request"))??;

        let header = String::from_utf8_lossy(&buffer[..n]).into_owned();
        let (method, path) = parse_request_line(&header)
            .ok_or_else(|| Error::custom("Malformed HTTP request line"))?;
        let is_upgrade =
            header.contains("Upgrade: websocket") || header.contains("upgrade: websocket");

        match self.router.resolve(&path) {
            Ok((Target::Socket(mount), _params)) if is_upgrade => {
                let ws_stream = accept_async(stream).await?;
                handle_socket(
                    ws_stream,
                    peer_addr,
                    self.registry.clone(),
                    self.dispatch.clone(),
                    mount,
                )
                .await;
                Ok(())
            }
            Ok((Target::Socket(_), _)) => {
                warn!("Plain HTTP request to socket endpoint {}", path);
                respond(
                    stream,
                    http_response(400, "text/plain", b"WebSocket endpoint".to_vec()),
                )
                .await
            }
            Ok((Target::Request(handler), params)) => {
                let ctx = RequestContext {
                    method,
                    path: path.clone(),
                    state: self.state.clone(),
                };
                let response = match handler.handle(params, ctx).await {
                    Ok(Some(message)) => match message.as_text() {
                        Some(text) => http_response(
                            200,
                            "text/plain; charset=utf-8",
                            text.as_bytes().to_vec(),
                        ),
                        None => http_response(200, "application/octet-stream", message.data),
                    },
                    Ok(None) => http_response(204, "text/plain", Vec::new()),
                    Err(e) => {
                        error!("Handler failed for {}: {}", path, e);
                        http_response(500, "text/plain", b"Internal Server Error".to_vec())
                    }
                };
                respond(stream, response).await
            }
            // resolution never yields a rewrite target
            Ok((Target::Rewrite, _)) | Err(Error::NoRoute(_)) => {
                respond(
                    stream,
                    http_response(404, "text/plain", b"Not Found".to_vec()),
                )
                .await
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops a running server from another task.
///
/// Closes the registry to new registrations and wakes the accept loop.
/// Connections already established keep running until their peers hang
/// up.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<Notify>,
    registry: Arc<ConnectionRegistry>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.registry.close();
        self.shutdown.notify_waiters();
    }
}

fn generate_server_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}-{:x}", std::process::id(), nanos)
}

fn parse_request_line(header: &str) -> Option<(String, String)> {
    let line = header.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    // ignore any query string for routing purposes
    let path = target.split('?').next().unwrap_or(target).to_string();
    Some((method, path))
}

async fn respond(mut stream: TcpStream, response: Vec<u8>) -> Result<()> {
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

fn http_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let status_text = match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        status,
        status_text,
        content_type,
        body.len()
    );

    let mut result = response.into_bytes();
    result.extend(body);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_format() {
        let id = generate_server_id();
        let mut parts = id.splitn(2, '-');
        let pid = parts.next().unwrap();
        let stamp = parts.next().unwrap();
        assert!(u64::from_str_radix(pid, 16).is_ok());
        assert!(u128::from_str_radix(stamp, 16).is_ok());
    }

    #[test]
    fn test_parse_request_line() {
        let header = "GET /users/42?tab=posts HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (method, path) = parse_request_line(header).unwrap();
        assert_eq!(method, "GET");
        assert_eq!(path, "/users/42");

        assert!(parse_request_line("").is_none());
    }

    #[test]
    fn test_http_response_framing() {
        let response = http_response(200, "text/plain", b"hi".to_vec());
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn test_builder_routing() {
        let server = Server::new()
            .rewrite("/api/*")
            .unwrap()
            .route("/users/:id", |params, _ctx| async move {
                Ok(Some(Message::text(format!("user {}", params["id"]))))
            })
            .unwrap();

        let (target, params) = server.router.resolve("/api/users/7").unwrap();
        assert_eq!(params["id"], "7");
        let Target::Request(handler) = target else {
            panic!("expected a request target");
        };
        let ctx = RequestContext {
            method: "GET".to_string(),
            path: "/users/7".to_string(),
            state: server.state.clone(),
        };
        let reply = handler.handle(params, ctx).await.unwrap().unwrap();
        assert_eq!(reply.as_text(), Some("user 7"));
    }

    #[test]
    fn test_rejects_invalid_pattern() {
        assert!(Server::new()
            .route("/:bad:extra", |_p, _c| async move { Ok(None) })
            .is_err());
    }

    #[test]
    fn test_handle_shuts_registry() {
        let server = Server::new();
        let handle = server.handle();
        handle.shutdown();
        assert!(server.registry.is_closed());
    }
}
