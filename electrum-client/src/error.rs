//! Typed error hierarchy. Every fallible operation in this crate returns one
//! of these instead of a boxed `dyn Error`, so applications can match on the
//! failure kind.

use electrum_protocol::ServerErrorPayload;

/// Failures that can occur while constructing a `Connection`, `Client`, or
/// `Cluster`. These are synchronous; no I/O has happened yet.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid protocol version string: {0:?}")]
    InvalidVersion(String),
    #[error("confidence {confidence} cannot exceed distribution {distribution}")]
    InvalidQuorum { confidence: u32, distribution: u32 },
}

/// Failures dialing and establishing the transport.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("timed out connecting within the configured timeout")]
    Timeout,
}

/// Failures at the `Client` level: connecting, handshaking, or issuing a
/// request before a connection exists.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error(
        "incompatible protocol version: requested {requested}, server negotiated {negotiated}"
    )]
    IncompatibleVersion { requested: String, negotiated: String },
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The *value* returned by a successfully round-tripped `request` when the
/// peer reported failure, or when the request could not be completed because
/// the connection died underneath it. This is intentionally not merged into
/// `ClientError`: a server error is data the application inspects, not a
/// thrown failure (see SPEC_FULL.md §7).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServerError {
    #[error("server error: {0}")]
    Remote(ServerErrorPayload),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("manual disconnection")]
    ManualDisconnection,
}

/// Failures at the `Cluster` level.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster is not ready")]
    NotReady,
    #[error("only reached quorum of fewer than {confidence} of {distribution} peers")]
    InsufficientIntegrity { distribution: u32, confidence: u32 },
    #[error(transparent)]
    Client(#[from] ClientError),
}
