//! Transports: already-framed byte pipes between two hubs.
//!
//! The hub only needs whole packets in and out; framing is the transport's
//! job. Two implementations ship with the crate:
//!
//! - [`WsTransport`] carries each packet in one binary WebSocket frame
//!   (via `tokio-tungstenite`).
//! - [`DuplexTransport`] connects two hubs in memory, for tests and
//!   in-process setups.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::debug;

use crate::error::{NetronError, Result};

/// A bidirectional packet pipe.
///
/// `send` must write each packet atomically: concurrent senders never
/// interleave partial packets. `recv` is only ever called by one reader.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, packet: Vec<u8>) -> Result<()>;

    /// Next packet, or `None` once the connection is closed.
    async fn recv(&self) -> Option<Vec<u8>>;

    async fn close(&self);

    fn remote_addr(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type WsSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type WsStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, tungstenite::Error>> + Send>>;

/// A WebSocket connection carrying one packet per binary frame.
pub struct WsTransport {
    sink: Mutex<WsSink>,
    stream: Mutex<WsStream>,
    addr: Option<String>,
}

impl WsTransport {
    /// Wrap an established WebSocket (client or server side).
    pub fn from_socket<S>(socket: WebSocketStream<S>, addr: Option<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let sink: WsSink = Box::pin(sink);
        let stream: WsStream = Box::pin(stream);
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            addr,
        }
    }

    /// Dial `addr` (`host:port` or a `ws://` / `wss://` URL).
    pub async fn connect(addr: &str) -> Result<Self> {
        let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
            addr.to_string()
        } else {
            format!("ws://{addr}")
        };

        let (socket, _) = connect_async(&url)
            .await
            .map_err(|e| NetronError::Transport(format!("Connect to {addr} failed: {e}")))?;
        debug!("WebSocket connected to {url}");
        Ok(Self::from_socket(socket, Some(addr.to_string())))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, packet: Vec<u8>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(packet.into()))
            .await
            .map_err(|e| NetronError::Transport(format!("Send error: {e}")))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Some(data.to_vec()),
                Ok(Message::Close(_)) => {
                    debug!("Remote {:?} sent close", self.addr);
                    return None;
                }
                Ok(_) => {} // Ignore text/ping/pong
                Err(e) => {
                    debug!("Read error from {:?}: {e}", self.addr);
                    return None;
                }
            }
        }
        None
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    fn remote_addr(&self) -> Option<String> {
        self.addr.clone()
    }
}

/// Accepts incoming WebSocket connections.
pub struct WsListener {
    listener: TcpListener,
}

impl WsListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next connection and complete its WebSocket upgrade.
    pub async fn accept(&self) -> Result<WsTransport> {
        let (stream, peer_addr) = self.listener.accept().await?;
        let socket = accept_async(stream).await.map_err(|e| {
            NetronError::Transport(format!("WebSocket accept failed for {peer_addr}: {e}"))
        })?;
        Ok(WsTransport::from_socket(socket, Some(peer_addr.to_string())))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// One end of an in-memory connection created by [`DuplexTransport::pair`].
pub struct DuplexTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: Arc<watch::Sender<bool>>,
    name: String,
}

impl DuplexTransport {
    /// Two connected ends; closing either one closes both.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let a = Self {
            tx: b_tx,
            rx: Mutex::new(a_rx),
            closed: Arc::clone(&closed),
            name: "duplex-a".into(),
        };
        let b = Self {
            tx: a_tx,
            rx: Mutex::new(b_rx),
            closed,
            name: "duplex-b".into(),
        };
        (a, b)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, packet: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(NetronError::Transport(format!("{} is closed", self.name)));
        }
        self.tx
            .send(packet)
            .map_err(|_| NetronError::Transport(format!("{} is closed", self.name)))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            packet = rx.recv() => packet,
            _ = closed.wait_for(|c| *c) => None,
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_duplex_delivers_in_order() {
        let (a, b) = DuplexTransport::pair();
        a.send(vec![1]).await.unwrap();
        a.send(vec![2, 2]).await.unwrap();
        assert_eq!(b.recv().await, Some(vec![1]));
        assert_eq!(b.recv().await, Some(vec![2, 2]));

        b.send(vec![3]).await.unwrap();
        assert_eq!(a.recv().await, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_duplex_close_wakes_reader() {
        let (a, b) = DuplexTransport::pair();
        let b = Arc::new(b);
        let reader = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await;

        let got = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        assert!(b.is_closed());
        assert!(a.send(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_ws_loopback() {
        let listener = WsListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let packet = conn.recv().await.unwrap();
            conn.send(packet.into_iter().rev().collect()).await.unwrap();
            conn
        });

        let client = WsTransport::connect(&addr.to_string()).await.unwrap();
        client.send(vec![1, 2, 3]).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap();
        assert_eq!(reply, Some(vec![3, 2, 1]));

        let server_conn = server.await.unwrap();
        client.close().await;
        let end = tokio::time::timeout(Duration::from_secs(2), server_conn.recv())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_ws_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match WsTransport::connect(&addr.to_string()).await {
            Err(NetronError::Transport(msg)) => assert!(msg.contains("failed")),
            Err(other) => panic!("Expected Transport error, got {other:?}"),
            Ok(_) => panic!("Expected connect to fail"),
        }
    }
}
