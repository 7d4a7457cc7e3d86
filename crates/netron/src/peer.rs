//! Remote peers: connection state, request correlation and per-peer bookkeeping.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value as Json, json};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::definition::{DefId, Definition};
use crate::error::{NetronError, RemoteError, Result};
use crate::identity::PeerId;
use crate::packet::{Action, Packet, PeerStatus};
use crate::stream::StreamTable;
use crate::transport::Transport;

type Awaiter = oneshot::Sender<Result<Json>>;

/// Definitions learned from a peer.
///
/// Strong definitions are the peer's named contexts; weak ones arrived as
/// call results or arguments and live until their interface is released.
#[derive(Default)]
pub(crate) struct RemoteDefinitions {
    pub(crate) defs: HashMap<DefId, Arc<Definition>>,
    pub(crate) contexts: HashMap<String, DefId>,
}

impl RemoteDefinitions {
    pub(crate) fn insert_strong(&mut self, name: &str, def: Definition) -> Arc<Definition> {
        let def = Arc::new(def);
        self.contexts.insert(name.to_string(), def.id);
        self.defs.insert(def.id, Arc::clone(&def));
        def
    }

    pub(crate) fn insert_weak(&mut self, def: Definition) -> Arc<Definition> {
        if let Some(existing) = self.defs.get(&def.id) {
            return Arc::clone(existing);
        }
        let def = Arc::new(def);
        self.defs.insert(def.id, Arc::clone(&def));
        def
    }

    pub(crate) fn remove_context(&mut self, name: &str) -> Option<DefId> {
        let id = self.contexts.remove(name)?;
        self.defs.remove(&id);
        Some(id)
    }

    fn is_strong(&self, id: DefId) -> bool {
        self.contexts.values().any(|c| *c == id)
    }

    pub(crate) fn remove_weak(&mut self, id: DefId) {
        if !self.is_strong(id) {
            self.defs.remove(&id);
        }
    }
}

#[derive(Default)]
struct PeerInfo {
    id: Option<PeerId>,
    is_super: bool,
}

pub(crate) struct PeerInner {
    key: u64,
    transport: Arc<dyn Transport>,
    status: Mutex<PeerStatus>,
    info: RwLock<PeerInfo>,
    addr: Option<String>,
    next_stream_id: AtomicU32,
    next_packet_id: AtomicU32,
    handshake_stream: AtomicU32,
    awaiters: Mutex<HashMap<u32, Awaiter>>,
    response_timeout: Duration,
    pub(crate) definitions: Mutex<RemoteDefinitions>,
    /// Context names this peer attached on the local hub.
    pub(crate) attached_here: Mutex<HashSet<String>>,
    /// Local contexts attached on this peer, by remote name.
    pub(crate) attached_there: Mutex<HashMap<String, DefId>>,
    pub(crate) streams: StreamTable,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<DateTime<Utc>>,
}

/// Handle to one remote endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    pub(crate) inner: Arc<PeerInner>,
}

impl Peer {
    pub(crate) fn new(
        key: u64,
        transport: Arc<dyn Transport>,
        addr: Option<String>,
        response_timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        let addr = addr.or_else(|| transport.remote_addr());
        Self {
            inner: Arc::new(PeerInner {
                key,
                transport,
                status: Mutex::new(PeerStatus::Connecting),
                info: RwLock::new(PeerInfo::default()),
                addr,
                next_stream_id: AtomicU32::new(1),
                next_packet_id: AtomicU32::new(1),
                handshake_stream: AtomicU32::new(0),
                awaiters: Mutex::new(HashMap::new()),
                response_timeout,
                definitions: Mutex::new(RemoteDefinitions::default()),
                attached_here: Mutex::new(HashSet::new()),
                attached_there: Mutex::new(HashMap::new()),
                streams: StreamTable::default(),
                connected_at: now,
                last_seen: Mutex::new(now),
            }),
        }
    }

    /// Hub-local connection key, assigned before the peer id is known.
    pub fn key(&self) -> u64 {
        self.inner.key
    }

    /// Remote peer id; `None` until the handshake completes.
    pub fn id(&self) -> Option<PeerId> {
        self.inner.info.read().id.clone()
    }

    pub(crate) fn id_or_key(&self) -> String {
        self.id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| format!("#{}", self.inner.key))
    }

    pub fn is_super(&self) -> bool {
        self.inner.info.read().is_super
    }

    pub fn status(&self) -> PeerStatus {
        *self.inner.status.lock()
    }

    pub fn is_online(&self) -> bool {
        self.status() == PeerStatus::Online
    }

    pub fn addr(&self) -> Option<&str> {
        self.inner.addr.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.inner.last_seen.lock()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.awaiters.lock().len()
    }

    /// Names of the contexts the peer exposes, sorted.
    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.definitions.lock().contexts.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_context(&self, name: &str) -> bool {
        self.inner.definitions.lock().contexts.contains_key(name)
    }

    pub fn definition_by_name(&self, name: &str) -> Option<Arc<Definition>> {
        let defs = self.inner.definitions.lock();
        let id = defs.contexts.get(name)?;
        defs.defs.get(id).cloned()
    }

    pub fn definition_by_id(&self, id: DefId) -> Option<Arc<Definition>> {
        self.inner.definitions.lock().defs.get(&id).cloned()
    }

    pub fn ptr_eq(a: &Peer, b: &Peer) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    // -- state machine ------------------------------------------------------

    /// Move to `next`. Forward moves go one step at a time; any live state may
    /// drop to `Offline`. Returns `false` if the transition is not allowed.
    pub(crate) fn set_status(&self, next: PeerStatus) -> bool {
        let mut status = self.inner.status.lock();
        let allowed = match next {
            PeerStatus::Offline => *status != PeerStatus::Offline,
            _ => next as u8 == *status as u8 + 1,
        };
        if allowed {
            trace!("Peer {} {:?} -> {next:?}", self.inner.key, *status);
            *status = next;
        }
        allowed
    }

    pub(crate) fn set_identity(&self, id: PeerId, is_super: bool) {
        let mut info = self.inner.info.write();
        info.id = Some(id);
        info.is_super = is_super;
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_seen.lock() = Utc::now();
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn is_handshake_stream(&self, stream_id: u32) -> bool {
        stream_id != 0 && self.inner.handshake_stream.load(Ordering::Acquire) == stream_id
    }

    pub(crate) fn set_handshake_stream(&self, stream_id: u32) {
        self.inner.handshake_stream.store(stream_id, Ordering::Release);
    }

    // -- outgoing -----------------------------------------------------------

    pub(crate) fn next_stream_id(&self) -> u32 {
        self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn send_packet(
        &self,
        stream_id: u32,
        impulse: bool,
        action: Action,
        payload: Json,
    ) -> Result<()> {
        let packet = Packet::new(
            self.inner.next_packet_id.fetch_add(1, Ordering::Relaxed),
            stream_id,
            impulse,
            action,
            self.status(),
            payload,
        );
        trace!(
            "-> {} {:?} stream={} impulse={}",
            self.id_or_key(),
            action,
            stream_id,
            impulse
        );
        self.inner.transport.send(packet.encode()?).await
    }

    /// Reply to a request with a success value.
    pub(crate) async fn reply_ok(&self, stream_id: u32, action: Action, value: Json) -> Result<()> {
        self.send_packet(stream_id, false, action, json!([0, value])).await
    }

    /// Reply to a request with a tagged error.
    pub(crate) async fn reply_err(
        &self,
        stream_id: u32,
        action: Action,
        err: &NetronError,
    ) -> Result<()> {
        let remote = serde_json::to_value(err.to_remote())?;
        self.send_packet(stream_id, false, action, json!([1, remote])).await
    }

    /// Register an awaiter under a fresh stream id.
    pub(crate) fn register_awaiter(&self) -> Result<(u32, oneshot::Receiver<Result<Json>>)> {
        if self.status() == PeerStatus::Offline {
            return Err(NetronError::PeerDisconnected(self.id_or_key()));
        }
        let stream_id = self.next_stream_id();
        let (tx, rx) = oneshot::channel();
        self.inner.awaiters.lock().insert(stream_id, tx);
        Ok((stream_id, rx))
    }

    /// Wait for the reply registered under `stream_id`, bounded by the response timeout.
    pub(crate) async fn await_reply(
        &self,
        stream_id: u32,
        rx: oneshot::Receiver<Result<Json>>,
    ) -> Result<Json> {
        match tokio::time::timeout(self.inner.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetronError::PeerDisconnected(self.id_or_key())),
            Err(_) => {
                self.inner.awaiters.lock().remove(&stream_id);
                debug!("Request {stream_id} to {} timed out", self.id_or_key());
                Err(NetronError::Timeout(self.inner.response_timeout))
            }
        }
    }

    /// Send a request and wait for its correlated reply.
    pub(crate) async fn request(&self, action: Action, payload: Json) -> Result<Json> {
        let (stream_id, rx) = self.register_awaiter()?;
        if let Err(e) = self.send_packet(stream_id, true, action, payload).await {
            self.inner.awaiters.lock().remove(&stream_id);
            return Err(e);
        }
        self.await_reply(stream_id, rx).await
    }

    /// Hand a reply to its awaiter. Unknown ids are ignored.
    pub(crate) fn resolve_awaiter(&self, stream_id: u32, result: Result<Json>) -> bool {
        let awaiter = self.inner.awaiters.lock().remove(&stream_id);
        match awaiter {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with `PeerDisconnected`.
    pub(crate) fn fail_all_awaiters(&self) -> usize {
        let drained: Vec<Awaiter> = self.inner.awaiters.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        let who = self.id_or_key();
        for tx in drained {
            let _ = tx.send(Err(NetronError::PeerDisconnected(who.clone())));
        }
        count
    }
}

/// Split a reply payload into its success value or tagged error.
pub(crate) fn parse_reply(payload: Json) -> Result<Json> {
    if let Json::Array(mut items) = payload {
        if items.len() == 2 {
            let value = items.pop().unwrap_or(Json::Null);
            return match items[0].as_u64() {
                Some(0) => Ok(value),
                Some(1) => {
                    let remote: RemoteError = serde_json::from_value(value).map_err(|e| {
                        NetronError::MalformedPacket(format!("bad error reply: {e}"))
                    })?;
                    Err(remote.into_error())
                }
                _ => Err(NetronError::MalformedPacket("bad reply tag".into())),
            };
        }
        return Err(NetronError::MalformedPacket(format!(
            "reply has {} elements",
            items.len()
        )));
    }
    match payload {
        Json::Null => Ok(Json::Null),
        other => Err(NetronError::MalformedPacket(format!("bad reply: {other}"))),
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("key", &self.inner.key)
            .field("id", &self.id())
            .field("status", &self.status())
            .field("addr", &self.inner.addr)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::DuplexTransport;

    fn peer(timeout: Duration) -> (Peer, DuplexTransport) {
        let (a, b) = DuplexTransport::pair();
        (Peer::new(1, Arc::new(a), None, timeout), b)
    }

    #[test]
    fn test_status_moves_forward_one_step() {
        let (p, _remote) = peer(Duration::from_secs(1));
        assert!(!p.set_status(PeerStatus::Online));
        assert!(p.set_status(PeerStatus::Handshaking));
        assert!(!p.set_status(PeerStatus::Connecting));
        assert!(p.set_status(PeerStatus::Online));
        assert!(p.set_status(PeerStatus::Offline));
        assert!(!p.set_status(PeerStatus::Offline));
        assert!(!p.set_status(PeerStatus::Online));
    }

    #[tokio::test]
    async fn test_request_resolved_by_reply() {
        let (p, remote) = peer(Duration::from_secs(2));
        p.set_status(PeerStatus::Handshaking);
        p.set_status(PeerStatus::Online);

        let caller = {
            let p = p.clone();
            tokio::spawn(async move { p.request(Action::Get, json!([1, "x", null])).await })
        };

        let sent = Packet::decode(&remote.recv().await.unwrap()).unwrap();
        assert!(sent.impulse);
        assert_eq!(sent.status, PeerStatus::Online);
        assert_eq!(p.pending_requests(), 1);

        assert!(p.resolve_awaiter(sent.stream_id, parse_reply(json!([0, 42]))));
        assert_eq!(caller.await.unwrap().unwrap(), json!(42));
        assert!(!p.resolve_awaiter(sent.stream_id, Ok(Json::Null)));
        assert_eq!(p.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout_removes_awaiter() {
        let (p, _remote) = peer(Duration::from_millis(30));
        let err = p.request(Action::Ping, Json::Null).await.unwrap_err();
        assert!(matches!(err, NetronError::Timeout(_)));
        assert_eq!(p.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_awaiters() {
        let (p, _remote) = peer(Duration::from_secs(5));
        let caller = {
            let p = p.clone();
            tokio::spawn(async move { p.request(Action::Get, Json::Null).await })
        };
        while p.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(p.fail_all_awaiters(), 1);
        assert!(matches!(
            caller.await.unwrap(),
            Err(NetronError::PeerDisconnected(_))
        ));

        p.set_status(PeerStatus::Offline);
        assert!(matches!(
            p.request(Action::Get, Json::Null).await,
            Err(NetronError::PeerDisconnected(_))
        ));
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply(json!([0, "ok"])).unwrap(), json!("ok"));
        assert_eq!(parse_reply(Json::Null).unwrap(), Json::Null);

        let err = parse_reply(json!([1, {"kind": "not_exists", "message": "gone"}])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExists);
        assert!(matches!(
            parse_reply(json!([7, 1])),
            Err(NetronError::MalformedPacket(_))
        ));
        assert!(parse_reply(json!({"x": 1})).is_err());
    }

    #[test]
    fn test_remote_definitions_strong_and_weak() {
        use crate::context::Reflection;
        let mut defs = RemoteDefinitions::default();
        let strong = Definition::from_reflection(DefId(1), None, None, &Reflection::new("A"));
        let weak = Definition::from_reflection(DefId(2), None, Some(DefId(1)), &Reflection::new("B"));
        defs.insert_strong("a", strong);
        defs.insert_weak(weak);

        defs.remove_weak(DefId(1));
        defs.remove_weak(DefId(2));
        assert!(defs.defs.contains_key(&DefId(1)));
        assert!(!defs.defs.contains_key(&DefId(2)));
        assert_eq!(defs.remove_context("a"), Some(DefId(1)));
        assert!(defs.defs.is_empty());
    }
}
