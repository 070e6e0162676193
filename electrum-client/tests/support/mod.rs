//! A mock Electrum server for integration tests: accepts plain TCP
//! connections (no TLS; `Client<T>`'s transport is generic precisely so
//! tests can do this) and hands each one to a per-test handler.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Installs a `tracing` subscriber once per process, so a failing test can be
/// re-run with `RUST_LOG=debug` to see the client's own event stream.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub struct MockElectrumServer {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl MockElectrumServer {
    /// Binds to a random local port and runs `handler` on every accepted
    /// connection, each in its own task.
    pub async fn start<H, Fut>(handler: H) -> Self
    where
        H: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local_addr");
        let handler = Arc::new(handler);

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move { handler(stream).await });
                    }
                    Err(_) => break,
                }
            }
        });

        MockElectrumServer { addr, _task: task }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Reads one newline-delimited statement from `reader`, without the
/// trailing delimiter. Returns `None` on EOF.
pub async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Option<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.expect("read_line");
    if n == 0 {
        return None;
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Some(line)
}

/// Writes `statement + "\n"` to `writer`.
pub async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut W, statement: &str) {
    writer.write_all(statement.as_bytes()).await.expect("write");
    writer.write_all(b"\n").await.expect("write newline");
}

/// Splits a `TcpStream` into a line-buffered reader half and a raw writer
/// half, the shape every handler below wants.
pub fn split(stream: TcpStream) -> (BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half), write_half)
}

/// Replies to the `server.version` handshake with `negotiated_version`,
/// reading and discarding the client's hello first. Most handlers start with
/// this before moving into their own steady-state behavior.
pub async fn handshake_ok(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    server_name: &str,
    negotiated_version: &str,
) {
    let _hello = read_line(reader).await.expect("client hello");
    let reply = serde_json::json!({
        "id": "versionNegotiation",
        "result": [server_name, negotiated_version],
    });
    write_line(writer, &reply.to_string()).await;
}
