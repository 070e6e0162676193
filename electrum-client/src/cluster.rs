//! Quorum fan-out across a managed pool of peers: every request and
//! subscribe goes to `distribution` selected peers, and the first value
//! `confidence` of them agree on (by canonical form) is the one callers see.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};

use crate::canonical::canonicalize;
use crate::client::{RawClient, SubscriptionCallback, TlsTransport};
use crate::connection::dial_tls;
use crate::error::{ClientError, ClusterError, ConfigError};

/// How peers are selected for a given fan-out. `Priority` always takes the
/// first remaining peer in registration order; `Random` draws uniformly from
/// whatever remains. Both skip (but still consume) `Down` peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Priority,
    Random,
}

/// Whether the cluster currently has at least `distribution` connected
/// peers. Transitions only on connect/disconnect edges, never by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Degraded,
}

type BoxDialFuture<T> = Pin<Box<dyn Future<Output = std::io::Result<T>> + Send>>;
type DialFn<T> = Arc<dyn Fn(String, u16) -> BoxDialFuture<T> + Send + Sync>;

struct Entry<T> {
    up: bool,
    client: Arc<RawClient<T>>,
}

/// The ordered `"host:port" -> entry` registry, plus a cached live count so
/// readiness never has to re-scan the membership.
struct Registry<T> {
    order: Vec<String>,
    entries: HashMap<String, Entry<T>>,
    live_count: u32,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Registry {
            order: Vec::new(),
            entries: HashMap::new(),
            live_count: 0,
        }
    }

    fn insert(&mut self, key: String, client: Arc<RawClient<T>>) {
        self.order.push(key.clone());
        self.entries.insert(key, Entry { up: false, client });
    }

    fn mark_up(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            if !entry.up {
                entry.up = true;
                self.live_count += 1;
            }
        }
    }

    fn mark_down(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.up {
                entry.up = false;
                self.live_count = self.live_count.saturating_sub(1);
            }
        }
    }

    /// Snapshot of `(up, client)` pairs in registration order, for selection.
    fn snapshot(&self) -> Vec<(bool, Arc<RawClient<T>>)> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| (entry.up, Arc::clone(&entry.client)))
            .collect()
    }

    fn all_clients(&self) -> Vec<Arc<RawClient<T>>> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| Arc::clone(&entry.client))
            .collect()
    }
}

/// A managed quorum of peers. Generic over the transport for the same
/// testability reason `RawClient` is: tests supply a dial closure that
/// connects to an in-process mock server over a plain `TcpStream`, while
/// production code uses the [`Cluster`] alias, which dials TLS.
pub struct RawCluster<T> {
    app: String,
    version: String,
    keep_alive: Duration,
    retry: Duration,
    timeout: Duration,
    distribution: u32,
    confidence: u32,
    order: Order,
    registry: Arc<RwLock<Registry<T>>>,
    status: Arc<Mutex<Readiness>>,
    dial: DialFn<T>,
}

/// The production alias: a Cluster of TLS-dialing Clients.
pub type Cluster = RawCluster<TlsTransport>;

impl<T> RawCluster<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// `distribution` is the number of peers each fan-out targets, `confidence`
    /// the minimum number of agreeing replies required to trust a result.
    /// Rejected synchronously if `confidence` is zero or exceeds `distribution`
    /// (clamped to at least 1, so a `distribution: 0` cluster with
    /// `confidence: 1` is still constructible and grows via `add_server`).
    /// `dial` is how each registered peer's transport is established; tests
    /// pass a closure that dials a plain `TcpStream`, production code uses
    /// `Cluster::new`, which wraps `dial_tls`.
    pub fn new<D, Fut>(
        app: impl Into<String>,
        version: impl Into<String>,
        confidence: u32,
        distribution: u32,
        order: Order,
        keep_alive: Duration,
        retry: Duration,
        timeout: Duration,
        dial: D,
    ) -> Result<Self, ConfigError>
    where
        D: Fn(String, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<T>> + Send + 'static,
    {
        if confidence == 0 || confidence > distribution.max(1) {
            return Err(ConfigError::InvalidQuorum {
                confidence,
                distribution,
            });
        }
        Ok(RawCluster {
            app: app.into(),
            version: version.into(),
            keep_alive,
            retry,
            timeout,
            distribution,
            confidence,
            order,
            registry: Arc::new(RwLock::new(Registry::new())),
            status: Arc::new(Mutex::new(Readiness::Degraded)),
            dial: Arc::new(move |host, port| Box::pin(dial(host, port))),
        })
    }

    pub fn distribution(&self) -> u32 {
        self.distribution
    }

    pub fn confidence(&self) -> u32 {
        self.confidence
    }

    /// Constructs a Client for `host:port`, registers it `Down`, dials it,
    /// and on success marks it `Up` (flipping the cluster `Ready` once
    /// `distribution` peers are live). A background watcher keeps the entry's
    /// state in sync with the Client's own `closed_watch`, so a later drop
    /// degrades the cluster without any polling. Returns once this initial
    /// connect attempt settles; `ready` is the separate, budgeted wait.
    pub async fn add_server(&self, host: impl Into<String>, port: u16) -> Result<(), ClientError> {
        let host = host.into();
        let key = format!("{host}:{port}");

        let client = Arc::new(RawClient::new(
            self.app.clone(),
            self.version.clone(),
            host.clone(),
            port,
            self.keep_alive,
            self.retry,
            self.timeout,
        )?);

        {
            let mut registry = self.registry.write().await;
            registry.insert(key.clone(), Arc::clone(&client));
        }
        self.spawn_liveness_watcher(key.clone(), Arc::clone(&client));

        let dial = Arc::clone(&self.dial);
        let dial_host = host;
        client
            .connect_with(move || dial(dial_host, port))
            .await?;

        self.mark_up(&key).await;
        Ok(())
    }

    async fn mark_up(&self, key: &str) {
        let live = {
            let mut registry = self.registry.write().await;
            registry.mark_up(key);
            registry.live_count
        };
        if live >= self.distribution.max(1) {
            *self.status.lock().await = Readiness::Ready;
        }
    }

    /// Watches one peer's `closed_watch` for the rest of the cluster's life
    /// and retires it from the live set the moment it drops, without polling.
    fn spawn_liveness_watcher(&self, key: String, client: Arc<RawClient<T>>) {
        let mut closed = client.closed_watch();
        let registry = Arc::clone(&self.registry);
        let status = Arc::clone(&self.status);
        let distribution = self.distribution;
        tokio::spawn(async move {
            loop {
                if closed.changed().await.is_err() {
                    break;
                }
                if *closed.borrow() {
                    let live = {
                        let mut registry = registry.write().await;
                        registry.mark_down(&key);
                        registry.live_count
                    };
                    if live < distribution.max(1) {
                        *status.lock().await = Readiness::Degraded;
                    }
                }
            }
        });
    }

    pub async fn readiness(&self) -> Readiness {
        *self.status.lock().await
    }

    /// Polls until the cluster reaches `Ready` or `budget` elapses. A
    /// one-time startup gate; steady-state readiness above is edge-triggered
    /// off each peer's `closed_watch`, not polled.
    pub async fn ready(&self, budget: Duration) -> Readiness {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if self.readiness().await == Readiness::Ready {
                return Readiness::Ready;
            }
            if tokio::time::Instant::now() >= deadline {
                return Readiness::Degraded;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Selects up to `distribution` peers without replacement: `Priority`
    /// always takes index 0 of what remains, `Random` draws uniformly from
    /// what remains. A peer found `Down` at selection time is skipped and
    /// does not count toward the chosen set, but is still consumed from the
    /// snapshot, so a majority-Down registry can exhaust the snapshot before
    /// reaching `distribution`.
    async fn select_peers(&self) -> Vec<Arc<RawClient<T>>> {
        let mut snapshot = self.registry.read().await.snapshot();
        let target = self.distribution.max(1) as usize;
        let mut chosen = Vec::new();
        let mut rng = rand::thread_rng();
        while chosen.len() < target && !snapshot.is_empty() {
            let idx = match self.order {
                Order::Priority => 0,
                Order::Random => rng.gen_range(0..snapshot.len()),
            };
            let (up, client) = snapshot.remove(idx);
            if up {
                chosen.push(client);
            }
        }
        chosen
    }

    /// Fans `method(params)` out to `distribution` selected peers and
    /// returns as soon as `confidence` of them agree on a canonical value,
    /// not when every peer has replied, so a slow minority never holds up a
    /// result that already has quorum.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, ClusterError> {
        if self.readiness().await != Readiness::Ready {
            return Err(ClusterError::NotReady);
        }
        let peers = self.select_peers().await;
        fanout_quorum(peers, method, params, self.confidence)
            .await
            .ok_or(ClusterError::InsufficientIntegrity {
                distribution: self.distribution,
                confidence: self.confidence,
            })
    }

    /// Installs a canonicalizing tally interceptor on every registered
    /// peer's `method` notifications: each arriving payload is canonicalized
    /// and tallied independently, and the first canonical value to reach
    /// `confidence` occurrences is forwarded to `callback`, at most once per
    /// distinct value. Then issues `request` to deliver an initial,
    /// quorum-backed value the same way.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: SubscriptionCallback,
    ) -> Result<Value, ClusterError> {
        let clients = self.registry.read().await.all_clients();
        let tally: Arc<Mutex<HashMap<String, (Value, u32)>>> = Arc::new(Mutex::new(HashMap::new()));
        let confidence = self.confidence;

        for client in &clients {
            let tally = Arc::clone(&tally);
            let callback = Arc::clone(&callback);
            let interceptor: SubscriptionCallback = Arc::new(move |value: Value| {
                let tally = Arc::clone(&tally);
                let callback = Arc::clone(&callback);
                tokio::spawn(async move {
                    let forwarded = {
                        let key = canonicalize(&value);
                        let mut guard = tally.lock().await;
                        let entry = guard.entry(key).or_insert_with(|| (value.clone(), 0));
                        entry.1 += 1;
                        if entry.1 == confidence {
                            Some(entry.0.clone())
                        } else {
                            None
                        }
                    };
                    if let Some(value) = forwarded {
                        callback(value);
                    }
                });
            });
            client.on_notification(method, interceptor).await;
        }

        let value = self.request(method, params).await?;
        callback(value.clone());
        Ok(value)
    }

    /// Sets cluster status to `Degraded` (terminal) and force-disconnects
    /// every registered peer concurrently, returning each settlement.
    pub async fn shutdown(&self) -> Vec<Result<(), ClientError>> {
        *self.status.lock().await = Readiness::Degraded;
        let clients = self.registry.read().await.all_clients();
        let mut futures = FuturesUnordered::new();
        for client in clients {
            futures.push(async move {
                client.disconnect(true).await;
                Ok(())
            });
        }
        let mut settlements = Vec::new();
        while let Some(result) = futures.next().await {
            settlements.push(result);
        }
        settlements
    }
}

impl Cluster {
    /// Convenience constructor that dials real TLS connections, the
    /// production counterpart to `RawCluster::new`, which stays generic over
    /// the dial closure so tests can drive a `RawCluster<TcpStream>` instead.
    pub fn new(
        app: impl Into<String>,
        version: impl Into<String>,
        confidence: u32,
        distribution: u32,
        order: Order,
        keep_alive: Duration,
        retry: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        RawCluster::new(
            app,
            version,
            confidence,
            distribution,
            order,
            keep_alive,
            retry,
            timeout,
            dial_tls,
        )
    }
}

/// Dispatches `method(params)` to every client in `clients` concurrently and
/// returns the first value that `confidence` of them agree on by canonical
/// form, or `None` if every peer has replied and none reached it.
async fn fanout_quorum<T>(
    clients: Vec<Arc<RawClient<T>>>,
    method: &str,
    params: Vec<Value>,
    confidence: u32,
) -> Option<Value>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut futures = FuturesUnordered::new();
    for client in clients {
        let method = method.to_owned();
        let params = params.clone();
        futures.push(async move { client.request(&method, params).await });
    }

    let mut tally: HashMap<String, (Value, u32)> = HashMap::new();
    while let Some(outcome) = futures.next().await {
        let Ok(Ok(value)) = outcome else { continue };
        let key = canonicalize(&value);
        let entry = tally.entry(key).or_insert_with(|| (value.clone(), 0));
        entry.1 += 1;
        if entry.1 >= confidence {
            return Some(entry.0.clone());
        }
    }
    None
}
