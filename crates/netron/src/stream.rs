//! Streams: flow-controlled pipes of JSON chunks multiplexed over a peer connection.
//!
//! The writer opens a stream with STREAM_REQUEST and may only send data
//! once the reader answered STREAM_ACCEPT. The reader can pause and resume
//! the writer at any time; either side ends the stream with STREAM_END.
//! Independently of that, an incoming stream pauses its writer by itself once
//! [`HIGH_WATER`] chunks sit unread and resumes it at [`LOW_WATER`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::{Value as Json, json};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{NetronError, Result};
use crate::identity::PeerId;
use crate::packet::Action;
use crate::peer::Peer;

/// Unread chunks at which an incoming stream pauses its writer.
pub const HIGH_WATER: usize = 64;
/// Unread chunks at which an automatically paused stream resumes.
pub const LOW_WATER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the reader to accept.
    Requested,
    Flowing,
    Paused,
    Ended,
}

/// Read-side buffer accounting for one incoming stream.
#[derive(Default)]
struct Flow {
    buffered: AtomicUsize,
    auto_paused: AtomicBool,
    user_paused: AtomicBool,
}

impl Flow {
    /// Count a buffered chunk. `true` when the writer should now be paused.
    fn filled(&self) -> bool {
        let buffered = self.buffered.fetch_add(1, Ordering::AcqRel) + 1;
        buffered >= HIGH_WATER && !self.auto_paused.swap(true, Ordering::AcqRel)
    }

    /// Count a consumed chunk. `true` when an automatic pause should be lifted.
    fn drained(&self) -> bool {
        let buffered = self.buffered.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        buffered <= LOW_WATER
            && !self.user_paused.load(Ordering::Acquire)
            && self.auto_paused.swap(false, Ordering::AcqRel)
    }
}

struct Inbox {
    tx: mpsc::UnboundedSender<Json>,
    flow: Arc<Flow>,
}

/// Live streams of one peer. Outgoing and incoming ids come from different
/// sequences (ours and the peer's), so they are kept apart.
#[derive(Default)]
pub(crate) struct StreamTable {
    outgoing: Mutex<HashMap<u32, watch::Sender<StreamState>>>,
    incoming: Mutex<HashMap<u32, Inbox>>,
}

impl StreamTable {
    fn set_outgoing(&self, stream_id: u32, state: StreamState) -> bool {
        let mut outgoing = self.outgoing.lock();
        let Some(tx) = outgoing.get(&stream_id) else {
            return false;
        };
        tx.send_replace(state);
        if state == StreamState::Ended {
            outgoing.remove(&stream_id);
        }
        true
    }

    fn open_incoming(&self, stream_id: u32) -> Option<(mpsc::UnboundedReceiver<Json>, Arc<Flow>)> {
        let mut incoming = self.incoming.lock();
        if incoming.contains_key(&stream_id) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = Arc::new(Flow::default());
        incoming.insert(
            stream_id,
            Inbox {
                tx,
                flow: Arc::clone(&flow),
            },
        );
        Some((rx, flow))
    }

    pub(crate) fn len(&self) -> usize {
        self.outgoing.lock().len() + self.incoming.lock().len()
    }

    /// End every stream; used when the peer goes offline.
    pub(crate) fn close_all(&self) {
        for (_, tx) in self.outgoing.lock().drain() {
            tx.send_replace(StreamState::Ended);
        }
        self.incoming.lock().clear();
    }
}

/// Apply a STREAM_* packet received from `peer`.
///
/// Returns a new incoming stream when the packet was a STREAM_REQUEST.
pub(crate) async fn handle_packet(
    peer: &Peer,
    action: Action,
    stream_id: u32,
    payload: Json,
) -> Result<Option<IncomingStream>> {
    let table = &peer.inner.streams;
    match action {
        Action::StreamRequest => {
            let Some((rx, flow)) = table.open_incoming(stream_id) else {
                debug!("Duplicate stream request {stream_id} from {}", peer.id_or_key());
                return Ok(None);
            };
            peer.send_packet(stream_id, true, Action::StreamAccept, Json::Null)
                .await?;
            Ok(Some(IncomingStream {
                peer: peer.clone(),
                stream_id,
                rx,
                flow,
            }))
        }
        Action::StreamAccept | Action::StreamResume => {
            table.set_outgoing(stream_id, StreamState::Flowing);
            Ok(None)
        }
        Action::StreamPause => {
            table.set_outgoing(stream_id, StreamState::Paused);
            Ok(None)
        }
        Action::StreamData => {
            let inbox = table
                .incoming
                .lock()
                .get(&stream_id)
                .map(|inbox| (inbox.tx.clone(), Arc::clone(&inbox.flow)));
            match inbox {
                Some((tx, flow)) => {
                    if tx.send(payload).is_ok() && flow.filled() {
                        debug!("Stream {stream_id} from {} is full; pausing", peer.id_or_key());
                        peer.send_packet(stream_id, true, Action::StreamPause, Json::Null)
                            .await?;
                    }
                }
                None => debug!("Data for unknown stream {stream_id} dropped"),
            }
            Ok(None)
        }
        Action::StreamEnd => {
            if payload.get("reject").and_then(Json::as_bool) == Some(true) {
                table.set_outgoing(stream_id, StreamState::Ended);
            } else {
                table.incoming.lock().remove(&stream_id);
            }
            Ok(None)
        }
        other => Err(NetronError::ProtocolViolation(format!(
            "{other:?} is not a stream action"
        ))),
    }
}

impl Peer {
    /// Open a stream towards this peer.
    pub async fn open_stream(&self) -> Result<OutgoingStream> {
        if !self.is_online() {
            return Err(NetronError::PeerDisconnected(self.id_or_key()));
        }
        let stream_id = self.next_stream_id();
        let (tx, rx) = watch::channel(StreamState::Requested);
        self.inner.streams.outgoing.lock().insert(stream_id, tx);

        if let Err(e) = self
            .send_packet(stream_id, true, Action::StreamRequest, Json::Null)
            .await
        {
            self.inner.streams.outgoing.lock().remove(&stream_id);
            return Err(e);
        }
        Ok(OutgoingStream {
            peer: self.clone(),
            stream_id,
            state: rx,
        })
    }

    pub fn open_streams(&self) -> usize {
        self.inner.streams.len()
    }
}

/// Writing end of a stream.
pub struct OutgoingStream {
    peer: Peer,
    stream_id: u32,
    state: watch::Receiver<StreamState>,
}

impl OutgoingStream {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Wait until the reader lets data through.
    async fn ready(&mut self) -> Result<()> {
        let state = self
            .state
            .wait_for(|s| matches!(s, StreamState::Flowing | StreamState::Ended))
            .await
            .map(|s| *s);
        match state {
            Ok(StreamState::Flowing) => Ok(()),
            _ => Err(NetronError::Transport(format!(
                "stream {} is closed",
                self.stream_id
            ))),
        }
    }

    /// Send one chunk, waiting while the stream is not accepted or paused.
    pub async fn write(&mut self, chunk: Json) -> Result<()> {
        self.ready().await?;
        self.peer
            .send_packet(self.stream_id, true, Action::StreamData, chunk)
            .await
    }

    /// Finish the stream.
    pub async fn end(self) -> Result<()> {
        self.peer
            .inner
            .streams
            .set_outgoing(self.stream_id, StreamState::Ended);
        if self.peer.is_online() {
            self.peer
                .send_packet(self.stream_id, true, Action::StreamEnd, Json::Null)
                .await?;
        }
        Ok(())
    }
}

/// Reading end of a stream opened by a peer.
pub struct IncomingStream {
    peer: Peer,
    stream_id: u32,
    rx: mpsc::UnboundedReceiver<Json>,
    flow: Arc<Flow>,
}

impl IncomingStream {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer.id()
    }

    /// Next chunk, or `None` once the writer ended the stream.
    pub async fn recv(&mut self) -> Option<Json> {
        let chunk = self.rx.recv().await?;
        if self.flow.drained()
            && let Err(e) = self
                .peer
                .send_packet(self.stream_id, true, Action::StreamResume, Json::Null)
                .await
        {
            debug!("Resuming stream {} failed: {e}", self.stream_id);
        }
        Some(chunk)
    }

    /// Pause the writer until [`resume`](Self::resume).
    pub async fn pause(&self) -> Result<()> {
        self.flow.user_paused.store(true, Ordering::Release);
        self.peer
            .send_packet(self.stream_id, true, Action::StreamPause, Json::Null)
            .await
    }

    pub async fn resume(&self) -> Result<()> {
        self.flow.user_paused.store(false, Ordering::Release);
        self.flow.auto_paused.store(false, Ordering::Release);
        self.peer
            .send_packet(self.stream_id, true, Action::StreamResume, Json::Null)
            .await
    }

    /// Stop reading; the writer sees the stream as ended.
    pub async fn close(mut self) -> Result<()> {
        self.rx.close();
        self.peer.inner.streams.incoming.lock().remove(&self.stream_id);
        self.peer
            .send_packet(self.stream_id, true, Action::StreamEnd, json!({"reject": true}))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PeerStatus};
    use crate::transport::{DuplexTransport, Transport};
    use std::sync::Arc;
    use std::time::Duration;

    fn online_peer() -> (Peer, DuplexTransport) {
        let (a, b) = DuplexTransport::pair();
        let peer = Peer::new(1, Arc::new(a), None, Duration::from_secs(2));
        peer.set_status(PeerStatus::Handshaking);
        peer.set_status(PeerStatus::Online);
        (peer, b)
    }

    async fn next(remote: &DuplexTransport) -> Packet {
        Packet::decode(&remote.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_write_waits_for_accept_and_resume() {
        let (peer, remote) = online_peer();
        let mut out = peer.open_stream().await.unwrap();
        let request = next(&remote).await;
        assert_eq!(request.action, Action::StreamRequest);
        assert_eq!(out.state(), StreamState::Requested);

        let writer = tokio::spawn(async move {
            out.write(json!("chunk")).await.unwrap();
            out
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        handle_packet(&peer, Action::StreamAccept, request.stream_id, Json::Null)
            .await
            .unwrap();
        let mut out = writer.await.unwrap();
        let data = next(&remote).await;
        assert_eq!(data.action, Action::StreamData);
        assert_eq!(data.payload, json!("chunk"));

        handle_packet(&peer, Action::StreamPause, request.stream_id, Json::Null)
            .await
            .unwrap();
        assert_eq!(out.state(), StreamState::Paused);
        handle_packet(&peer, Action::StreamEnd, request.stream_id, json!({"reject": true}))
            .await
            .unwrap();
        assert!(out.write(json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_incoming_stream_lifecycle() {
        let (peer, remote) = online_peer();
        let mut incoming = handle_packet(&peer, Action::StreamRequest, 7, Json::Null)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next(&remote).await.action, Action::StreamAccept);

        handle_packet(&peer, Action::StreamData, 7, json!({"n": 1}))
            .await
            .unwrap();
        handle_packet(&peer, Action::StreamEnd, 7, Json::Null)
            .await
            .unwrap();
        assert_eq!(incoming.recv().await, Some(json!({"n": 1})));
        assert_eq!(incoming.recv().await, None);
        assert_eq!(peer.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_full_incoming_stream_pauses_writer() {
        let (peer, remote) = online_peer();
        let mut incoming = handle_packet(&peer, Action::StreamRequest, 9, Json::Null)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next(&remote).await.action, Action::StreamAccept);

        for n in 0..HIGH_WATER {
            handle_packet(&peer, Action::StreamData, 9, json!(n))
                .await
                .unwrap();
        }
        let pause = next(&remote).await;
        assert_eq!((pause.action, pause.stream_id), (Action::StreamPause, 9));

        // More data while paused does not pause again.
        handle_packet(&peer, Action::StreamData, 9, json!(HIGH_WATER))
            .await
            .unwrap();

        for n in 0..=HIGH_WATER - LOW_WATER {
            assert_eq!(incoming.recv().await, Some(json!(n)));
        }
        let resume = next(&remote).await;
        assert_eq!((resume.action, resume.stream_id), (Action::StreamResume, 9));
        for n in HIGH_WATER - LOW_WATER + 1..=HIGH_WATER {
            assert_eq!(incoming.recv().await, Some(json!(n)));
        }
    }

    #[tokio::test]
    async fn test_close_all_ends_writers() {
        let (peer, _remote) = online_peer();
        let mut out = peer.open_stream().await.unwrap();
        peer.inner.streams.close_all();
        assert_eq!(out.state(), StreamState::Ended);
        assert!(out.write(json!(1)).await.is_err());
    }
}
