//! Netron error types.
//!
//! Errors about a single request travel back to the caller inside the reply
//! payload as a [`RemoteError`]; only protocol violations tear a connection down.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur in the netron crate.
#[derive(Debug, thiserror::Error)]
pub enum NetronError {
    /// A packet could not be decoded (truncated header, unknown action, bad payload).
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// The peer sent an action that is illegal for the current handshake phase.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No context is attached under the given name.
    #[error("Unknown context: {0}")]
    UnknownContext(String),

    /// A context, twin or subscription with this key already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The referenced definition or member does not exist.
    #[error("Not exists: {0}")]
    NotExists(String),

    /// A write was attempted on a readonly property.
    #[error("Property '{0}' is readonly")]
    ReadOnlyProperty(String),

    /// No reply arrived within the configured response window.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The peer went offline while the request was outstanding.
    #[error("Peer disconnected: {0}")]
    PeerDisconnected(String),

    /// The remote endpoint closed the connection before the handshake finished.
    #[error("Connection refused by {0}")]
    ConnectRefused(String),

    /// No online peer is known under this id.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// The remote side declined the request (e.g. context attach on a non-super hub).
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The caller passed an argument the operation cannot accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer did not announce itself as a super peer.
    #[error("Peer '{0}' is not a super peer")]
    NotSuperPeer(String),

    /// A context method returned an error.
    #[error("Application error: {0}")]
    Application(String),

    /// A tagged error reply whose kind has no local counterpart.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// A transport-level error (connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The hub has been shut down.
    #[error("Netron hub is shut down")]
    Shutdown,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetronError>;

/// Classification carried on the wire inside `[1, error]` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedPacket,
    ProtocolViolation,
    UnknownContext,
    AlreadyExists,
    NotExists,
    ReadOnlyProperty,
    Timeout,
    PeerDisconnected,
    NotImplemented,
    InvalidArgument,
    NotSuperPeer,
    Application,
    Internal,
}

/// Serialisable error sent back to the caller of a remote request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Convert a received error reply back into a local error.
    pub fn into_error(self) -> NetronError {
        match self.kind {
            ErrorKind::UnknownContext => NetronError::UnknownContext(self.message),
            ErrorKind::AlreadyExists => NetronError::AlreadyExists(self.message),
            ErrorKind::NotExists => NetronError::NotExists(self.message),
            ErrorKind::ReadOnlyProperty => NetronError::ReadOnlyProperty(self.message),
            ErrorKind::NotImplemented => NetronError::NotImplemented(self.message),
            ErrorKind::InvalidArgument => NetronError::InvalidArgument(self.message),
            ErrorKind::NotSuperPeer => NetronError::NotSuperPeer(self.message),
            ErrorKind::Application => NetronError::Application(self.message),
            _ => NetronError::Remote(self),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl NetronError {
    /// The wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedPacket(_) => ErrorKind::MalformedPacket,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::UnknownContext(_) => ErrorKind::UnknownContext,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotExists(_) => ErrorKind::NotExists,
            Self::ReadOnlyProperty(_) => ErrorKind::ReadOnlyProperty,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::PeerDisconnected(_) => ErrorKind::PeerDisconnected,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotSuperPeer(_) => ErrorKind::NotSuperPeer,
            Self::Application(_) => ErrorKind::Application,
            Self::Remote(e) => e.kind,
            _ => ErrorKind::Internal,
        }
    }

    /// Build the tagged error that is sent back inside a `[1, error]` reply.
    pub fn to_remote(&self) -> RemoteError {
        let message = match self {
            Self::UnknownContext(m)
            | Self::AlreadyExists(m)
            | Self::NotExists(m)
            | Self::ReadOnlyProperty(m)
            | Self::NotImplemented(m)
            | Self::InvalidArgument(m)
            | Self::NotSuperPeer(m)
            | Self::Application(m) => m.clone(),
            Self::Remote(e) => e.message.clone(),
            other => other.to_string(),
        };
        RemoteError::new(self.kind(), message)
    }

    /// Classify an error returned by application context code.
    ///
    /// Errors that already are a `NetronError` keep their kind; anything else is
    /// an `Application` error carrying the full error chain as its message.
    pub fn from_context(err: anyhow::Error) -> Self {
        match err.downcast::<NetronError>() {
            Ok(netron) => netron,
            Err(other) => Self::Application(format!("{other:#}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
