//! One peer connection: owns the transport, frames inbound bytes into
//! statements, and runs the idle keep-alive timer.
//!
//! `Connection<T>` is generic over the transport type so the framing and
//! keep-alive logic, the part this crate actually needs to get right, can
//! be exercised in tests against a plain `TcpStream` talking to an in-process
//! mock server, while production code dials a real
//! `tokio_rustls::client::TlsStream<TcpStream>`. Establishing that transport
//! ("dialing") is a distinct step from framing it; see [`dial_tls`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use electrum_protocol::{RequestId, STATEMENT_DELIMITER, build_request, frame_chunk};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{ConfigError, ConnectError};

/// The Connection's tristate connectedness, per SPEC_FULL.md §3: the third
/// state suppresses a redundant teardown racing with an in-flight one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connected,
    TearingDown,
}

/// Where completed statements go. Swapped exactly once, at the end of the
/// handshake (§4.3): `Handshake` delivers the single version-negotiation
/// reply, `Steady` feeds the Client's router task for the rest of the
/// connection's life.
enum Sink {
    Handshake(Option<oneshot::Sender<String>>),
    Steady(mpsc::UnboundedSender<String>),
}

/// A live peer connection. Generic over the transport; see module docs.
pub struct Connection<T> {
    host: String,
    port: u16,
    app: String,
    version: String,
    keep_alive: Duration,
    #[allow(dead_code)] // stored for forward compatibility; never consulted, see SPEC_FULL.md §9
    retry: Duration,
    timeout: Duration,

    state: Arc<Mutex<ConnState>>,
    writer: Arc<Mutex<Option<WriteHalf<T>>>>,
    sink: Arc<Mutex<Sink>>,
    last_send_reset: Arc<watch::Sender<()>>,
    read_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    keepalive_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Flipped once the read loop observes EOF or an I/O error; lets owners
    /// (the Client's router) learn the connection died without polling.
    closed: Arc<watch::Sender<bool>>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Validates `version` and records configuration. No I/O happens here.
    pub fn new(
        app: impl Into<String>,
        version: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        keep_alive: Duration,
        retry: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let version = version.into();
        if !electrum_protocol::is_valid_version(&version) {
            return Err(ConfigError::InvalidVersion(version));
        }
        let (last_send_reset, _) = watch::channel(());
        let (closed, _) = watch::channel(false);
        Ok(Connection {
            host: host.into(),
            port,
            app: app.into(),
            version,
            keep_alive,
            retry,
            timeout,
            state: Arc::new(Mutex::new(ConnState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            sink: Arc::new(Mutex::new(Sink::Handshake(None))),
            last_send_reset: Arc::new(last_send_reset),
            read_task: Arc::new(Mutex::new(None)),
            keepalive_task: Arc::new(Mutex::new(None)),
            closed: Arc::new(closed),
        })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn state(&self) -> ConnState {
        *self.state.lock().await
    }

    /// A receiver that flips to `true` once the connection has torn itself
    /// down (peer close, transport error, or explicit disconnect).
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Dials the transport (via `dial`), installs `sink` as the initial
    /// statement destination, and starts the read loop and keep-alive timer.
    /// Idempotent: a no-op if already connected.
    pub async fn connect<D, Fut>(
        &self,
        dial: D,
        handshake_sink: oneshot::Sender<String>,
    ) -> Result<(), ConnectError>
    where
        D: FnOnce() -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        {
            let state = self.state.lock().await;
            if *state == ConnState::Connected {
                return Ok(());
            }
        }

        let transport = match tokio::time::timeout(self.timeout, dial()).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => return Err(ConnectError::Transport(e)),
            Err(_) => return Err(ConnectError::Timeout),
        };

        let (read_half, write_half) = tokio::io::split(transport);
        *self.writer.lock().await = Some(write_half);
        *self.sink.lock().await = Sink::Handshake(Some(handshake_sink));
        *self.state.lock().await = ConnState::Connected;
        self.closed.send_replace(false);

        *self.read_task.lock().await = Some(spawn_read_loop(
            read_half,
            Arc::clone(&self.sink),
            Arc::clone(&self.closed),
        ));

        if !self.keep_alive.is_zero() {
            *self.keepalive_task.lock().await = Some(spawn_keepalive(
                self.keep_alive,
                Arc::clone(&self.writer),
                Arc::clone(&self.last_send_reset),
                Arc::clone(&self.state),
            ));
        }

        Ok(())
    }

    /// Swaps the steady-state sink in after a successful handshake.
    pub async fn install_steady_sink(&self, sink: mpsc::UnboundedSender<String>) {
        *self.sink.lock().await = Sink::Steady(sink);
    }

    /// Writes `frame + "\n"` to the transport and rearms the keep-alive
    /// deadline.
    pub async fn send(&self, frame: &str) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::other("not connected"))?;
        writer.write_all(frame.as_bytes()).await?;
        writer
            .write_all(&[STATEMENT_DELIMITER as u8])
            .await?;
        let _ = self.last_send_reset.send(());
        debug!(target: "electrum::action", frame = %frame, "sent frame");
        Ok(())
    }

    /// Sends `server.ping` with the `"keepAlive"` sentinel id.
    pub async fn ping(&self) -> std::io::Result<()> {
        let frame = build_request("server.ping", &[] as &[Value], &RequestId::KEEP_ALIVE);
        self.send(&frame).await
    }

    /// Tears the connection down. Returns `true` if it actually did
    /// something (was connected, or `force` was set).
    pub async fn disconnect(&self, force: bool) -> bool {
        let mut state = self.state.lock().await;
        if *state != ConnState::Connected && !force {
            return false;
        }
        *state = ConnState::TearingDown;
        drop(state);

        if let Some(task) = self.keepalive_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        *self.writer.lock().await = None;
        self.closed.send_replace(true);

        *self.state.lock().await = ConnState::Disconnected;
        true
    }
}

fn spawn_read_loop<T>(
    mut read_half: ReadHalf<T>,
    sink: Arc<Mutex<Sink>>,
    closed: Arc<watch::Sender<bool>>,
) -> JoinHandle<()>
where
    T: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = String::new();
        let mut raw = [0u8; 8192];
        loop {
            let n = match read_half.read(&mut raw).await {
                Ok(0) => {
                    debug!(target: "electrum::status", "peer closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!(target: "electrum::errors", error = %e, "transport read error");
                    break;
                }
            };
            let chunk = match std::str::from_utf8(&raw[..n]) {
                Ok(s) => s,
                Err(_) => {
                    error!(target: "electrum::errors", "inbound chunk was not valid UTF-8");
                    continue;
                }
            };

            let mut statements = Vec::new();
            frame_chunk(&mut buffer, chunk, |s| statements.push(s));

            for statement in statements {
                deliver(&sink, statement).await;
            }
        }
        closed.send_replace(true);
    })
}

async fn deliver(sink: &Arc<Mutex<Sink>>, statement: String) {
    let mut guard = sink.lock().await;
    match &mut *guard {
        Sink::Handshake(slot) => {
            if let Some(tx) = slot.take() {
                let _ = tx.send(statement);
            } else {
                warn!(target: "electrum::errors", "statement arrived after handshake sink was consumed");
            }
        }
        Sink::Steady(tx) => {
            if tx.send(statement).is_err() {
                warn!(target: "electrum::errors", "steady-state sink has no receiver");
            }
        }
    }
}

fn spawn_keepalive<T>(
    idle_limit: Duration,
    writer: Arc<Mutex<Option<WriteHalf<T>>>>,
    reset: Arc<watch::Sender<()>>,
    state: Arc<Mutex<ConnState>>,
) -> JoinHandle<()>
where
    T: AsyncWrite + Unpin + Send + 'static,
{
    let mut rx = reset.subscribe();
    // `send` always fires through `Connection::send`, including the ping we
    // issue ourselves, so the deadline keeps getting pushed out for as long
    // as there's any traffic, matching the "ping every idle_limit while idle"
    // behavior SPEC_FULL.md §4.2 describes.
    tokio::spawn(async move {
        loop {
            let wait = tokio::time::sleep(idle_limit);
            tokio::pin!(wait);
            tokio::select! {
                _ = &mut wait => {
                    if *state.lock().await != ConnState::Connected {
                        break;
                    }
                    let frame = build_request("server.ping", &[] as &[Value], &RequestId::KEEP_ALIVE);
                    let mut guard = writer.lock().await;
                    if let Some(w) = guard.as_mut() {
                        let mut bytes = frame.into_bytes();
                        bytes.push(STATEMENT_DELIMITER as u8);
                        if w.write_all(&bytes).await.is_err() {
                            break;
                        }
                        debug!(target: "electrum::action", "sent keep-alive ping");
                        let _ = reset.send(());
                    } else {
                        break;
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Dials a real TLS connection: TCP connect, then TLS handshake with the
/// platform/webpki root store. Used by `Client` in production; tests dial a
/// plain `TcpStream` instead and construct `Connection<TcpStream>` directly.
pub async fn dial_tls(
    host: String,
    port: u16,
) -> std::io::Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> {
    use rustls_pki_types::ServerName;
    use std::sync::OnceLock;

    static ROOTS: OnceLock<Arc<rustls::RootCertStore>> = OnceLock::new();
    let roots = ROOTS.get_or_init(|| {
        let mut store = rustls::RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(store)
    });

    let config = rustls::ClientConfig::builder()
        .with_root_certificates((**roots).clone())
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let tcp = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
    tcp.set_nodelay(true)?;

    let server_name = ServerName::try_from(host)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
        .to_owned();
    connector.connect(server_name, tcp).await
}
