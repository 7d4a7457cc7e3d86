//! Netron: a peer-to-peer distributed object runtime.
//!
//! A [`Netron`] hub exposes local objects ("contexts") to connected peers and
//! lets them call methods and read or write properties as if the objects were
//! local. Everything travels over one multiplexed connection per peer.
//!
//! # Architecture
//!
//! - **Transport**: WebSocket (via `tokio-tungstenite`) or any [`Transport`]
//!   implementation; [`DuplexTransport`] connects two hubs in memory.
//! - **Protocol**: fixed-header [`Packet`]s with a JSON payload. Requests and
//!   replies are correlated by stream id.
//! - **Objects**: a context is described by a [`Definition`], served by a
//!   [`Stub`] and called through an [`Interface`]. Objects returned from calls
//!   are exposed by reference and released together with their parent.
//! - **Events**: a local event bus whose events peers can subscribe to.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use netron::{Context, Netron, NetronConfig, Reflection, Value};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Context for Echo {
//!     fn reflect(&self) -> Reflection {
//!         Reflection::new("Echo").method("echo")
//!     }
//!
//!     async fn call(&self, _method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
//!         Ok(Value::List(args))
//!     }
//! }
//!
//! # async fn example() -> netron::Result<()> {
//! let server = Netron::new(NetronConfig::default());
//! server.attach_context(Arc::new(Echo), Some("echo"))?;
//! let addr = server.bind(Some("127.0.0.1:0")).await?;
//!
//! let client = Netron::new(NetronConfig::default());
//! let peer = client.connect(&addr.to_string()).await?;
//! let peer_id = peer.id().expect("online peers have an id");
//! let echo = client.get_interface_by_name("echo", Some(&peer_id))?;
//! let out = echo.call("echo", vec![Value::from(serde_json::json!("hi"))]).await?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod definition;
mod dispatch;
pub mod error;
pub mod events;
pub mod identity;
pub mod interface;
pub mod logging;
pub mod netron;
pub mod packet;
pub mod peer;
pub mod registry;
pub mod stream;
pub mod stub;
pub mod transport;
pub mod value;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{ConnectConfig, NetronConfig};
pub use context::{Context, InterfaceContext, PropertyInfo, Reflection};
pub use definition::{DefId, Definition, Member, MemberKind};
pub use error::{ErrorKind, NetronError, RemoteError, Result};
pub use events::{EventHandler, ListenerId, RemoteEventHandler, handler, names, remote_handler};
pub use identity::PeerId;
pub use interface::Interface;
pub use netron::{ContextAuthorizer, Netron, SubscriptionId, SuperHubAuthorizer, TwinFactory};
pub use packet::{Action, Packet, PeerStatus};
pub use peer::Peer;
pub use stream::{IncomingStream, OutgoingStream, StreamState};
pub use stub::Stub;
pub use transport::{DuplexTransport, Transport, WsListener, WsTransport};
pub use value::Value;
