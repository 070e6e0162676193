//! electrum-client: a connection, client, and quorum-cluster library for the
//! Electrum wire protocol (newline-delimited JSON-RPC over TLS).
//!
//! `Client` owns one peer connection and negotiates the `server.version`
//! handshake before issuing requests; `Cluster` fans a request out to a
//! fixed set of peers and trusts a reply only once `confidence` of them
//! agree. See SPEC_FULL.md for the full design.

pub mod canonical;
pub mod client;
pub mod cluster;
pub mod connection;
pub mod error;

pub use client::{Client, RawClient, SubscriptionCallback, TlsTransport};
pub use cluster::{Cluster, Order, RawCluster, Readiness};
pub use connection::{ConnState, Connection};
pub use error::{ClientError, ClusterError, ConfigError, ConnectError, ServerError};
