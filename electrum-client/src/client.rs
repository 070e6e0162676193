//! Handshake, request/response correlation, and notification dispatch for a
//! single Electrum peer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use electrum_protocol::{RequestId, Statement, build_request, parse_statement};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::error::{ClientError, ConfigError, ConnectError, ServerError};

/// A registered subscription handler. Invoked with the `params` value of
/// each matching notification (or, for `Client::subscribe`, with the initial
/// response value too).
pub type SubscriptionCallback = Arc<dyn Fn(Value) + Send + Sync>;

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ServerError>>>>>;
type NotificationBus = Arc<Mutex<HashMap<String, Vec<SubscriptionCallback>>>>;

/// Production transport: a TLS stream over a TCP socket.
pub type TlsTransport = tokio_rustls::client::TlsStream<tokio::net::TcpStream>;

/// A connected Electrum peer. Generic over the transport so tests can drive
/// it over a plain `TcpStream`; production code uses the [`Client`] alias,
/// which dials TLS.
pub struct RawClient<T> {
    connection: Connection<T>,
    next_id: AtomicU64,
    pending: PendingTable,
    subscriptions: NotificationBus,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

/// The production alias: a Client that dials real TLS connections.
pub type Client = RawClient<TlsTransport>;

impl<T> RawClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        app: impl Into<String>,
        version: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        keep_alive: Duration,
        retry: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let connection = Connection::new(app, version, host, port, keep_alive, retry, timeout)?;
        Ok(RawClient {
            connection,
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            router_task: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &str {
        self.connection.host()
    }

    pub fn port(&self) -> u16 {
        self.connection.port()
    }

    /// A receiver that flips to `true` once the underlying connection tears
    /// itself down. Used by `Cluster` to track readiness without polling the
    /// Client's own connected-ness.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.connection.closed_watch()
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.state().await == crate::connection::ConnState::Connected
    }

    /// Dials via `dial`, performs the `server.version` handshake, and, on
    /// success, installs the steady-state router task. See
    /// SPEC_FULL.md §4.3.
    pub async fn connect_with<D, Fut>(&self, dial: D) -> Result<(), ClientError>
    where
        D: FnOnce() -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let (handshake_tx, handshake_rx) = oneshot::channel();
        self.connection.connect(dial, handshake_tx).await?;

        let app = self.connection.app().to_owned();
        let version = self.connection.version().to_owned();
        let hello = build_request(
            "server.version",
            &[Value::String(app), Value::String(version.clone())],
            &RequestId::VERSION_NEGOTIATION,
        );
        self.connection
            .send(&hello)
            .await
            .map_err(|e| ClientError::Connect(ConnectError::Transport(e)))?;

        let raw = handshake_rx.await.map_err(|_| {
            ClientError::Handshake("connection closed before handshake completed".to_owned())
        })?;

        let statement = parse_statement(&raw)
            .map_err(|e| ClientError::Handshake(format!("malformed handshake reply: {e}")))?;

        let Statement::Response { outcome, .. } = statement else {
            self.connection.disconnect(true).await;
            return Err(ClientError::Handshake(
                "expected a response to server.version, got a notification or batch".to_owned(),
            ));
        };

        let result = match outcome {
            Err(payload) => {
                self.connection.disconnect(true).await;
                return Err(ClientError::Handshake(payload.message));
            }
            Ok(value) => value,
        };

        let negotiated = result
            .as_array()
            .and_then(|arr| arr.get(1))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ClientError::Handshake(format!(
                    "server.version result was not [server_name, version]: {result}"
                ))
            })?
            .to_owned();

        if negotiated != version {
            self.connection.disconnect(true).await;
            return Err(ClientError::IncompatibleVersion {
                requested: version,
                negotiated,
            });
        }

        let (steady_tx, steady_rx) = mpsc::unbounded_channel();
        self.connection.install_steady_sink(steady_tx).await;
        *self.router_task.lock().await = Some(spawn_router(
            steady_rx,
            Arc::clone(&self.pending),
            Arc::clone(&self.subscriptions),
        ));

        Ok(())
    }

    /// Drains subscriptions, fails every pending request with
    /// `ServerError::ManualDisconnection`, then tears down the connection.
    pub async fn disconnect(&self, force: bool) -> bool {
        self.subscriptions.lock().await.clear();
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ServerError::ManualDisconnection));
        }
        drop(pending);
        if let Some(task) = self.router_task.lock().await.take() {
            task.abort();
        }
        self.connection.disconnect(force).await
    }

    /// Issues `method(params)` and awaits the reply. The outer `Result` is
    /// whether the request was even dispatched (it fails synchronously if
    /// not connected); the inner `Result` is the protocol-level outcome.
    /// Applications match on it to distinguish a server error from success
    /// without that error being a thrown Rust failure (SPEC_FULL.md §7).
    pub async fn request(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Result<Value, ServerError>, ClientError> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = build_request(method, &params, &RequestId::Numeric(id));
        if let Err(e) = self.connection.send(&frame).await {
            self.pending.lock().await.remove(&id);
            return Ok(Err(ServerError::Transport(e.to_string())));
        }

        match rx.await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(Err(ServerError::Transport(
                "connection closed before a reply arrived".to_owned(),
            ))),
        }
    }

    /// Registers `callback` for `method`'s notifications, without issuing
    /// any request. Used both by `subscribe` below and by `Cluster`'s
    /// quorum-aggregating interceptor.
    pub async fn on_notification(&self, method: &str, callback: SubscriptionCallback) {
        self.subscriptions
            .lock()
            .await
            .entry(method.to_owned())
            .or_default()
            .push(callback);
    }

    /// Subscribes `callback` to `method` and delivers the initial response
    /// value to it once, per Electrum's subscribe-via-response-reply
    /// convention (SPEC_FULL.md §4.3).
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: SubscriptionCallback,
    ) -> Result<Result<Value, ServerError>, ClientError> {
        self.on_notification(method, Arc::clone(&callback)).await;
        let outcome = self.request(method, params).await?;
        if let Ok(value) = &outcome {
            callback(value.clone());
        }
        Ok(outcome)
    }
}

impl Client {
    /// Dials a real TLS connection to `host:port` and performs the
    /// handshake. The TLS-specific counterpart to `connect_with`, which
    /// stays generic so tests can drive a `Client<TcpStream>` instead.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let host = self.host().to_owned();
        let port = self.port();
        self.connect_with(move || crate::connection::dial_tls(host, port))
            .await
    }
}

/// The steady-state statement router: the single task that owns the pending
/// table and notification bus for the remainder of the connection's life.
fn spawn_router(
    mut rx: mpsc::UnboundedReceiver<String>,
    pending: PendingTable,
    subscriptions: NotificationBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            debug!(target: "electrum::server", statement = %raw, "received statement");
            match parse_statement(&raw) {
                Ok(statement) => route_statement(statement, &pending, &subscriptions).await,
                Err(e) => warn!(target: "electrum::errors", error = %e, "dropping malformed statement"),
            }
        }
        // Connection closed: fail every outstanding request so callers never
        // hang on a dead socket.
        let mut pending = pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ServerError::Transport(
                "connection closed".to_owned(),
            )));
        }
    })
}

fn route_statement<'a>(
    statement: Statement,
    pending: &'a PendingTable,
    subscriptions: &'a NotificationBus,
) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        match statement {
            Statement::Batch(items) => {
                for item in items {
                    route_statement(item, pending, subscriptions).await;
                }
            }
            Statement::Response {
                id: RequestId::Keyword("keepAlive"),
                ..
            } => {
                debug!(target: "electrum::status", "keep-alive pong received");
            }
            Statement::Response {
                id: RequestId::Numeric(id),
                outcome,
            } => {
                let completer = pending.lock().await.remove(&id);
                match completer {
                    Some(tx) => {
                        let _ = tx.send(outcome.map_err(ServerError::Remote));
                    }
                    None => {
                        error!(
                            target: "electrum::errors",
                            id,
                            "internal-consistency fault: response with no pending completer"
                        );
                    }
                }
            }
            Statement::Response { id, .. } => {
                warn!(target: "electrum::errors", id = %id, "unexpected sentinel id in steady state");
            }
            Statement::Notification { method, params } => {
                let callbacks = subscriptions
                    .lock()
                    .await
                    .get(&method)
                    .cloned()
                    .unwrap_or_default();
                debug!(target: "electrum::events", method = %method, subscribers = callbacks.len(), "dispatching notification");
                for callback in callbacks {
                    callback(params.clone());
                }
            }
        }
    })
}
