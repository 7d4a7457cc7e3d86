//! The Netron hub: owns peers, stubs, interfaces and event subscriptions.
//!
//! All shared tables live in one [`HubState`] behind a single lock that is
//! never held across an await point. Each peer runs its own read loop and
//! funnels packets through [`dispatch`](crate::dispatch); requests that run
//! application code are spawned so one slow context never stalls a connection.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{Value as Json, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::NetronConfig;
use crate::context::{Context, InterfaceContext};
use crate::definition::{DefId, Definition};
use crate::dispatch;
use crate::error::{NetronError, Result};
use crate::events::{
    EventBus, EventHandler, ListenerId, PendingQueues, RemoteEventHandler, names,
};
use crate::identity::PeerId;
use crate::interface::Interface;
use crate::packet::{Action, Packet, PeerStatus};
use crate::peer::Peer;
use crate::registry::{Registry, Released};
use crate::stream::IncomingStream;
use crate::stub::Stub;
use crate::transport::{Transport, WsListener, WsTransport};
use crate::value::{Marker, Value};

/// Builds a client-side twin for an interface.
pub type TwinFactory = Arc<dyn Fn(Interface) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

type InterfaceKey = (Option<PeerId>, DefId);

/// Identifies a handler registered with [`Netron::on_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Decides whether a peer may attach or detach contexts on this hub.
pub trait ContextAuthorizer: Send + Sync {
    fn authorize_attach(&self, hub: &Netron, peer: &Peer, ctx_id: &str, definition: &Definition) -> bool;

    fn authorize_detach(&self, hub: &Netron, peer: &Peer, ctx_id: &str) -> bool;
}

/// Accepts remote attachment only on hubs configured as super peers.
pub struct SuperHubAuthorizer;

impl ContextAuthorizer for SuperHubAuthorizer {
    fn authorize_attach(&self, hub: &Netron, _peer: &Peer, _ctx_id: &str, _def: &Definition) -> bool {
        hub.config().is_super
    }

    fn authorize_detach(&self, hub: &Netron, _peer: &Peer, _ctx_id: &str) -> bool {
        hub.config().is_super
    }
}

#[derive(Default)]
pub(crate) struct HubState {
    pub(crate) registry: Registry,
    /// Online peers.
    pub(crate) peers: HashMap<PeerId, Peer>,
    /// Every peer that is not offline, by connection key.
    live: HashMap<u64, Peer>,
    /// Dialed address -> connection key.
    addrs: HashMap<String, u64>,
    interfaces: HashMap<InterfaceKey, Interface>,
    twins: HashMap<InterfaceKey, Arc<dyn Any + Send + Sync>>,
    twin_factories: HashMap<String, TwinFactory>,
    /// Forwarding contexts for interfaces handed to a third peer.
    proxies: HashMap<InterfaceKey, Arc<dyn Context>>,
    /// Local listeners relaying events to the peer that asked for them.
    pub(crate) forwarders: HashMap<(PeerId, String), ListenerId>,
    /// Handlers for events emitted by peers.
    pub(crate) remote_events: HashMap<PeerId, HashMap<String, Vec<(SubscriptionId, RemoteEventHandler)>>>,
    /// `(peer, event)` pairs an EVENT_ON was sent for.
    subscribed: HashSet<(PeerId, String)>,
}

pub(crate) struct NetronInner {
    id: PeerId,
    config: NetronConfig,
    next_def_id: AtomicU64,
    next_peer_key: AtomicU64,
    next_subscription: AtomicU64,
    pub(crate) state: Mutex<HubState>,
    pub(crate) bus: EventBus,
    emitted_events: PendingQueues<String>,
    context_events: PendingQueues<String>,
    peer_events: PendingQueues<u64>,
    authorizer: RwLock<Arc<dyn ContextAuthorizer>>,
    incoming_tx: mpsc::UnboundedSender<IncomingStream>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingStream>>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// A Netron hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Netron {
    inner: Arc<NetronInner>,
}

impl Netron {
    pub fn new(config: NetronConfig) -> Self {
        Self::with_id(PeerId::generate(), config)
    }

    pub fn with_id(id: PeerId, config: NetronConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        info!("Netron hub {id} created (super: {})", config.is_super);
        Self {
            inner: Arc::new(NetronInner {
                id,
                config,
                next_def_id: AtomicU64::new(1),
                next_peer_key: AtomicU64::new(1),
                next_subscription: AtomicU64::new(1),
                state: Mutex::new(HubState::default()),
                bus: EventBus::new(),
                emitted_events: PendingQueues::new(),
                context_events: PendingQueues::new(),
                peer_events: PendingQueues::new(),
                authorizer: RwLock::new(Arc::new(SuperHubAuthorizer)),
                incoming_tx,
                incoming_rx: Mutex::new(Some(incoming_rx)),
                shutdown_tx,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<NetronInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    pub fn config(&self) -> &NetronConfig {
        &self.inner.config
    }

    pub(crate) fn inner_state(&self) -> &Mutex<HubState> {
        &self.inner.state
    }

    fn next_def_id(&self) -> DefId {
        DefId(self.inner.next_def_id.fetch_add(1, Ordering::Relaxed))
    }

    // -----------------------------------------------------------------------
    // Contexts
    // -----------------------------------------------------------------------

    /// Expose `ctx` under `id` (or its reflected name).
    ///
    /// Fails with `AlreadyExists` if the name is taken. The same instance may be
    /// attached under several names; each gets its own definition.
    pub fn attach_context(&self, ctx: Arc<dyn Context>, id: Option<&str>) -> Result<DefId> {
        self.attach_owned(None, ctx, id)
    }

    pub(crate) fn attach_owned(
        &self,
        owner: Option<PeerId>,
        ctx: Arc<dyn Context>,
        id: Option<&str>,
    ) -> Result<DefId> {
        let reflection = ctx.reflect();
        let name = id.map(str::to_string).unwrap_or_else(|| reflection.name.clone());
        let def = Definition::from_reflection(self.next_def_id(), owner, None, &reflection);
        let def_id = def.id;
        let stub = Stub::new(def, ctx);
        let definition = Arc::clone(&stub.definition);

        self.inner.state.lock().registry.attach(&name, stub)?;
        info!("Context '{name}' attached as definition {def_id}");

        self.queue_context_event(
            &name,
            names::CONTEXT_ATTACH,
            json!({
                "id": name,
                "defId": def_id,
                "owner": definition.owner,
                "definition": &*definition,
            }),
        );
        Ok(def_id)
    }

    /// Remove a named context. With `release_originated` every object it
    /// produced by reference is released as well.
    pub fn detach_context(&self, id: &str, release_originated: bool) -> Result<()> {
        let released = {
            let mut state = self.inner.state.lock();
            let released = state.registry.detach(id, release_originated)?;
            forget_local(&mut state, &released);
            released
        };
        info!("Context '{id}' detached ({} definitions released)", released.len());
        self.announce_detached(&released);
        Ok(())
    }

    fn announce_detached(&self, released: &[Released]) {
        for r in released {
            if let Some(name) = &r.name {
                self.queue_context_event(
                    name,
                    names::CONTEXT_DETACH,
                    json!({
                        "id": name,
                        "defId": r.stub.id(),
                        "owner": r.stub.definition.owner,
                    }),
                );
            }
        }
    }

    pub fn context_names(&self) -> Vec<String> {
        self.inner.state.lock().registry.context_names()
    }

    pub fn has_context(&self, id: &str) -> bool {
        self.inner.state.lock().registry.context_id(id).is_some()
    }

    /// Definition exposing `ctx` to `peer`, created on first use.
    pub fn ref_context(
        &self,
        peer: Option<&PeerId>,
        ctx: Arc<dyn Context>,
        parent: Option<DefId>,
    ) -> Arc<Definition> {
        let reflection = ctx.reflect();
        let mut state = self.inner.state.lock();
        if let Some(id) = state.registry.find_referenced(peer, &ctx)
            && let Some(stub) = state.registry.get(id)
        {
            return Arc::clone(&stub.definition);
        }
        let def = Definition::from_reflection(self.next_def_id(), None, parent, &reflection);
        let stub = Stub::new(def, ctx);
        let definition = Arc::clone(&stub.definition);
        state.registry.insert_referenced(peer, stub);
        debug!(
            "Context '{}' referenced as definition {} (parent {:?})",
            definition.name, definition.id, parent
        );
        definition
    }

    /// Release the definition created for `ctx` by [`ref_context`](Self::ref_context),
    /// together with everything it produced.
    pub fn release_context(&self, peer: Option<&PeerId>, ctx: &Arc<dyn Context>) -> bool {
        let mut state = self.inner.state.lock();
        let Some(id) = state.registry.find_referenced(peer, ctx) else {
            return false;
        };
        let released = state.registry.release_tree(id);
        forget_local(&mut state, &released);
        true
    }

    pub fn get_stub_by_id(&self, id: DefId) -> Result<Stub> {
        self.inner
            .state
            .lock()
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| NetronError::NotExists(format!("Context with definition id '{id}' not exists")))
    }

    /// Definition of a named context, local (`peer` = `None`) or of a peer.
    pub fn get_definition_by_name(&self, ctx_id: &str, peer: Option<&PeerId>) -> Result<Arc<Definition>> {
        match peer {
            None => self
                .inner
                .state
                .lock()
                .registry
                .context(ctx_id)
                .map(|s| Arc::clone(&s.definition))
                .ok_or_else(|| NetronError::UnknownContext(ctx_id.to_string())),
            Some(peer_id) => self
                .get_peer(peer_id)?
                .definition_by_name(ctx_id)
                .ok_or_else(|| NetronError::UnknownContext(ctx_id.to_string())),
        }
    }

    pub fn get_interface_by_name(&self, ctx_id: &str, peer: Option<&PeerId>) -> Result<Interface> {
        let def = self.get_definition_by_name(ctx_id, peer)?;
        Ok(self.interface_for(peer.cloned(), def))
    }

    pub fn get_interface_by_id(&self, def_id: DefId, peer: Option<&PeerId>) -> Result<Interface> {
        let def = match peer {
            None => self.get_stub_by_id(def_id)?.definition,
            Some(peer_id) => self.get_peer(peer_id)?.definition_by_id(def_id).ok_or_else(|| {
                NetronError::NotExists(format!("Definition '{def_id}' of peer '{peer_id}' not exists"))
            })?,
        };
        Ok(self.interface_for(peer.cloned(), def))
    }

    /// The cached interface for `(peer, def)`, created on first use.
    pub(crate) fn interface_for(&self, peer: Option<PeerId>, def: Arc<Definition>) -> Interface {
        let mut state = self.inner.state.lock();
        let key = (peer.clone(), def.id);
        if let Some(iface) = state.interfaces.get(&key) {
            return iface.clone();
        }
        let iface = Interface::new(def, peer, Arc::downgrade(&self.inner));
        state.interfaces.insert(key, iface.clone());
        iface
    }

    /// Drop a cached interface and its twin. Releasing twice is a no-op.
    pub fn release_interface(&self, iface: &Interface) -> bool {
        let key = iface.cache_key();
        {
            let mut state = self.inner.state.lock();
            let cached = state
                .interfaces
                .get(&key)
                .is_some_and(|c| Interface::ptr_eq(c, iface));
            if !cached {
                return false;
            }
            state.interfaces.remove(&key);
            state.twins.remove(&key);
            state.proxies.remove(&key);
        }
        if let Some(peer_id) = iface.peer_id()
            && let Ok(peer) = self.get_peer(peer_id)
        {
            peer.inner.definitions.lock().remove_weak(iface.def_id());
        }
        debug!("Interface {:?} released", key);
        true
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Read a property or invoke a method of the context `def_id`.
    ///
    /// `peer` = `None` addresses a local context. For a method, `default`
    /// carries the arguments; for a property it is returned when the value is
    /// undefined.
    pub async fn get(&self, peer: Option<&PeerId>, def_id: DefId, name: &str, default: Value) -> Result<Value> {
        match peer {
            None => {
                let stub = self.get_stub_by_id(def_id)?;
                let value = stub.get(name, default).await?;
                Ok(self.wrap_local(value, def_id))
            }
            Some(peer_id) => {
                let peer = self.get_peer(peer_id)?;
                let arg = self.encode_outgoing(&peer, default, None)?;
                let reply = peer.request(Action::Get, json!([def_id, name, arg])).await?;
                self.decode_incoming(&peer, reply)
            }
        }
    }

    /// Write a property, or invoke a method discarding its result.
    pub async fn set(&self, peer: Option<&PeerId>, def_id: DefId, name: &str, value: Value) -> Result<()> {
        match peer {
            None => self.get_stub_by_id(def_id)?.set(name, value).await,
            Some(peer_id) => {
                let peer = self.get_peer(peer_id)?;
                let arg = self.encode_outgoing(&peer, value, None)?;
                peer.request(Action::Set, json!([def_id, name, arg])).await?;
                Ok(())
            }
        }
    }

    pub async fn call(&self, peer: Option<&PeerId>, def_id: DefId, method: &str, args: Vec<Value>) -> Result<Value> {
        self.get(peer, def_id, method, Value::List(args)).await
    }

    pub async fn call_void(&self, peer: Option<&PeerId>, def_id: DefId, method: &str, args: Vec<Value>) -> Result<()> {
        self.set(peer, def_id, method, Value::List(args)).await
    }

    /// Measure the round trip to a peer.
    pub async fn ping(&self, peer: &PeerId) -> Result<Duration> {
        let peer = self.get_peer(peer)?;
        let started = Instant::now();
        peer.request(Action::Ping, Json::Null).await?;
        Ok(started.elapsed())
    }

    /// Contexts returned by a local call become local interfaces.
    fn wrap_local(&self, value: Value, parent: DefId) -> Value {
        match value {
            Value::Context(ctx) => {
                let def = self.ref_context(None, ctx, Some(parent));
                Value::Interface(self.interface_for(None, def))
            }
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.wrap_local(v, parent))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Turn a value into its wire form for `peer`, exposing live objects by reference.
    pub(crate) fn encode_outgoing(&self, peer: &Peer, value: Value, parent: Option<DefId>) -> Result<Json> {
        let peer_id = peer.id();
        match value {
            Value::Data(json) => Ok(json),
            Value::List(items) => items
                .into_iter()
                .map(|v| self.encode_outgoing(peer, v, parent))
                .collect::<Result<Vec<_>>>()
                .map(Json::Array),
            Value::Context(ctx) => {
                let def = self.ref_context(peer_id.as_ref(), ctx, parent);
                Marker::Definition((*def).clone()).to_json()
            }
            Value::Interface(iface) => {
                if iface.peer_id().is_some() && iface.peer_id() == peer_id.as_ref() {
                    return Marker::Reference(iface.def_id()).to_json();
                }
                let ctx = if iface.is_local() {
                    self.get_stub_by_id(iface.def_id())?.instance
                } else {
                    self.proxy_for(iface)
                };
                let def = self.ref_context(peer_id.as_ref(), ctx, parent);
                Marker::Definition((*def).clone()).to_json()
            }
        }
    }

    fn proxy_for(&self, iface: Interface) -> Arc<dyn Context> {
        let key = iface.cache_key();
        let mut state = self.inner.state.lock();
        let proxy = state
            .proxies
            .entry(key)
            .or_insert_with(|| Arc::new(InterfaceContext::new(iface)));
        Arc::clone(proxy)
    }

    /// Turn a received payload value back into interfaces and local instances.
    pub(crate) fn decode_incoming(&self, peer: &Peer, json: Json) -> Result<Value> {
        if let Some(marker) = Marker::parse(&json) {
            return match marker? {
                Marker::Definition(def) => {
                    let def = peer.inner.definitions.lock().insert_weak(def);
                    Ok(Value::Interface(self.interface_for(peer.id(), def)))
                }
                Marker::Reference(id) => Ok(Value::Context(self.get_stub_by_id(id)?.instance)),
            };
        }
        match json {
            Json::Array(items) if items.iter().any(Marker::contains_marker) => items
                .into_iter()
                .map(|item| self.decode_incoming(peer, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            other => Ok(Value::Data(other)),
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Accept WebSocket peers on `addr` (default: `config.listen_addr`) until
    /// [`shutdown`](Self::shutdown). Returns the bound address.
    pub async fn bind(&self, addr: Option<&str>) -> Result<SocketAddr> {
        let listener = match addr {
            Some(addr) => WsListener::bind(addr).await?,
            None => WsListener::bind(self.inner.config.listen_addr).await?,
        };
        let local = listener.local_addr()?;
        info!("Netron {} listening on {local}", self.id());

        let hub = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(transport) => {
                            let Some(inner) = hub.upgrade() else { break };
                            Netron::from_inner(inner).accept_transport(Arc::new(transport));
                        }
                        Err(e) => warn!("Accept on {local} failed: {e}"),
                    },
                    _ = shutdown.recv() => {
                        info!("Listener on {local} shutting down");
                        break;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Connect to a hub listening on `addr`, retrying with backoff.
    ///
    /// Returns the existing peer when `addr` is already connected.
    pub async fn connect(&self, addr: &str) -> Result<Peer> {
        {
            let state = self.inner.state.lock();
            if let Some(key) = state.addrs.get(addr)
                && let Some(peer) = state.live.get(key)
                && peer.is_online()
            {
                return Ok(peer.clone());
            }
        }

        let policy = &self.inner.config.connect;
        let mut attempt = 0;
        let transport = loop {
            match WsTransport::connect(addr).await {
                Ok(transport) => break transport,
                Err(e) if attempt < policy.retries => {
                    attempt += 1;
                    let delay = policy.backoff(attempt);
                    debug!("Connect to {addr} failed ({e}); retry {attempt} in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(NetronError::ConnectRefused(format!("{addr}: {e}"))),
            }
        };

        let peer = self
            .dial(Arc::new(transport), Some(addr.to_string()))
            .await?;
        self.inner
            .state
            .lock()
            .addrs
            .insert(addr.to_string(), peer.key());
        Ok(peer)
    }

    /// Handshake over an already-connected transport as the dialing side.
    pub async fn connect_transport(&self, transport: Arc<dyn Transport>) -> Result<Peer> {
        self.dial(transport, None).await
    }

    async fn dial(&self, transport: Arc<dyn Transport>, addr: Option<String>) -> Result<Peer> {
        let peer = self.register_peer(transport, addr);
        peer.set_status(PeerStatus::Handshaking);
        self.spawn_reader(peer.clone());
        self.queue_peer_event(&peer, names::PEER_CONNECT);

        let who = peer.addr().unwrap_or("peer").to_string();
        let (stream_id, rx) = peer.register_awaiter()?;
        peer.set_handshake_stream(stream_id);
        if let Err(e) = peer
            .send_packet(stream_id, true, Action::Get, self.handshake_payload())
            .await
        {
            self.peer_offline(&peer).await;
            return Err(NetronError::ConnectRefused(format!("{who}: {e}")));
        }

        match peer.await_reply(stream_id, rx).await {
            Ok(_) if peer.is_online() => {
                self.track_contexts(&peer).await;
                Ok(peer)
            }
            Ok(_) => {
                self.peer_offline(&peer).await;
                Err(NetronError::ConnectRefused(format!("{who}: handshake incomplete")))
            }
            Err(NetronError::Timeout(after)) => {
                self.peer_offline(&peer).await;
                Err(NetronError::Timeout(after))
            }
            Err(e) => {
                self.peer_offline(&peer).await;
                Err(NetronError::ConnectRefused(format!("{who}: {e}")))
            }
        }
    }

    /// Serve an incoming connection; the remote side sends the handshake.
    pub fn accept_transport(&self, transport: Arc<dyn Transport>) -> Peer {
        let peer = self.register_peer(transport, None);
        peer.set_status(PeerStatus::Handshaking);
        self.spawn_reader(peer.clone());
        self.queue_peer_event(&peer, names::PEER_CONNECT);
        peer
    }

    fn register_peer(&self, transport: Arc<dyn Transport>, addr: Option<String>) -> Peer {
        let key = self.inner.next_peer_key.fetch_add(1, Ordering::Relaxed);
        let peer = Peer::new(key, transport, addr, self.inner.config.response_timeout);
        self.inner.state.lock().live.insert(key, peer.clone());
        debug!("Peer #{key} created ({:?})", peer.addr());
        self.queue_peer_event(&peer, names::PEER_CREATE);
        peer
    }

    fn spawn_reader(&self, peer: Peer) {
        let hub = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(bytes) = peer.transport().recv().await {
                let Some(inner) = hub.upgrade() else { break };
                let netron = Netron::from_inner(inner);
                peer.touch();
                match Packet::decode(&bytes) {
                    Ok(packet) => dispatch::process(&netron, &peer, packet).await,
                    Err(e) => warn!("Dropping packet from {}: {e}", peer.id_or_key()),
                }
                if peer.status() == PeerStatus::Offline {
                    break;
                }
            }
            match hub.upgrade() {
                Some(inner) => Netron::from_inner(inner).peer_offline(&peer).await,
                None => {
                    peer.set_status(PeerStatus::Offline);
                    peer.fail_all_awaiters();
                }
            }
        });
    }

    pub(crate) fn handshake_payload(&self) -> Json {
        let contexts: Vec<Json> = self
            .inner
            .state
            .lock()
            .registry
            .contexts()
            .into_iter()
            .map(|(id, stub)| json!({"id": id, "definition": &*stub.definition}))
            .collect();
        json!({
            "peerId": self.id(),
            "isSuper": self.inner.config.is_super,
            "contexts": contexts,
        })
    }

    /// Record the identity and contexts a peer announced in its handshake.
    pub(crate) fn accept_handshake(&self, peer: &Peer, payload: Json) -> Result<()> {
        let hs: dispatch::Handshake = serde_json::from_value(payload)
            .map_err(|e| NetronError::ProtocolViolation(format!("bad handshake: {e}")))?;
        if hs.peer_id == self.inner.id {
            return Err(NetronError::ProtocolViolation("connected to itself".into()));
        }

        let mut state = self.inner.state.lock();
        if state.peers.contains_key(&hs.peer_id) {
            return Err(NetronError::AlreadyExists(format!(
                "Peer '{}' already connected",
                hs.peer_id
            )));
        }
        peer.set_identity(hs.peer_id.clone(), hs.is_super);
        {
            let mut defs = peer.inner.definitions.lock();
            for ctx in hs.contexts {
                defs.insert_strong(&ctx.id, ctx.definition);
            }
        }
        state.peers.insert(hs.peer_id, peer.clone());
        Ok(())
    }

    /// Finish the handshake: go online and announce it.
    pub(crate) fn mark_online(&self, peer: &Peer) -> Result<()> {
        if !peer.set_status(PeerStatus::Online) {
            return Err(NetronError::ProtocolViolation(format!(
                "cannot go online from {:?}",
                peer.status()
            )));
        }
        info!(
            "Peer {} online ({}, super: {})",
            peer.id_or_key(),
            peer.addr().unwrap_or("-"),
            peer.is_super()
        );
        self.queue_peer_event(peer, names::PEER_ONLINE);
        Ok(())
    }

    /// Subscribe to the peer's context attach/detach events, if enabled.
    pub(crate) async fn track_contexts(&self, peer: &Peer) {
        if !self.inner.config.track_remote_contexts {
            return;
        }
        for event in [names::CONTEXT_ATTACH, names::CONTEXT_DETACH] {
            if let Err(e) = self.subscribe(peer, event).await {
                debug!("Context tracking of {} failed: {e}", peer.id_or_key());
                break;
            }
        }
    }

    /// Disconnect a peer.
    pub async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        let peer = self.get_peer(peer)?;
        self.peer_offline(&peer).await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let peers: Vec<Peer> = self.inner.state.lock().live.values().cloned().collect();
        for peer in peers {
            self.peer_offline(&peer).await;
        }
    }

    /// Stop listeners, disconnect every peer and release all contexts.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        self.disconnect_all().await;
        let mut state = self.inner.state.lock();
        state.registry = Registry::new();
        state.interfaces.clear();
        state.twins.clear();
        state.proxies.clear();
        info!("Netron hub {} shut down", self.inner.id);
    }

    /// Take a peer offline and release everything tied to it. Idempotent.
    pub(crate) async fn peer_offline(&self, peer: &Peer) {
        if !peer.set_status(PeerStatus::Offline) {
            return;
        }
        peer.transport().close().await;
        let failed = peer.fail_all_awaiters();
        peer.inner.streams.close_all();

        let (forwarders, released) = {
            let mut state = self.inner.state.lock();
            state.live.remove(&peer.key());
            state.addrs.retain(|_, key| *key != peer.key());

            let mut forwarders = Vec::new();
            let mut released = Vec::new();
            if let Some(id) = peer.id() {
                if state.peers.get(&id).is_some_and(|p| Peer::ptr_eq(p, peer)) {
                    state.peers.remove(&id);
                }
                state.forwarders.retain(|(owner, _), listener| {
                    if *owner == id {
                        forwarders.push(*listener);
                        false
                    } else {
                        true
                    }
                });
                state.remote_events.remove(&id);
                state.subscribed.retain(|(owner, _)| *owner != id);

                released = state.registry.release_peer(&id);
                forget_local(&mut state, &released);

                let remote = Some(id);
                state.interfaces.retain(|(p, _), _| *p != remote);
                state.twins.retain(|(p, _), _| *p != remote);
                state.proxies.retain(|(p, _), _| *p != remote);
            }
            (forwarders, released)
        };

        for listener in forwarders {
            self.inner.bus.off(listener);
        }
        self.announce_detached(&released);
        info!(
            "Peer {} offline ({failed} pending requests failed, {} definitions released)",
            peer.id_or_key(),
            released.len()
        );
        self.queue_peer_event(peer, names::PEER_OFFLINE);
    }

    pub fn get_peer(&self, id: &PeerId) -> Result<Peer> {
        self.inner
            .state
            .lock()
            .peers
            .get(id)
            .cloned()
            .ok_or_else(|| NetronError::UnknownPeer(id.to_string()))
    }

    /// Online peers, sorted by id.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.inner.state.lock().peers.values().cloned().collect();
        peers.sort_by_key(|p| p.id());
        peers
    }

    pub(crate) fn deliver_stream(&self, stream: IncomingStream) {
        if self.inner.incoming_tx.send(stream).is_err() {
            debug!("Incoming stream dropped: receiver closed");
        }
    }

    /// Streams opened by peers. Can be taken once.
    pub fn incoming_streams(&self) -> Option<mpsc::UnboundedReceiver<IncomingStream>> {
        self.inner.incoming_rx.lock().take()
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn on(&self, event: &str, handler: EventHandler) -> ListenerId {
        self.inner.bus.on(event, handler)
    }

    pub fn off(&self, listener: ListenerId) -> bool {
        self.inner.bus.off(listener)
    }

    /// Emit a local event; peers subscribed to it receive it too.
    ///
    /// Emissions of one event name are delivered in order. If an earlier
    /// emission of `event` is still running this only queues `args` and
    /// returns; otherwise it delivers everything queued before returning.
    pub async fn emit(&self, event: &str, args: Vec<Json>) {
        let queue = &self.inner.emitted_events;
        if queue.enqueue(event.to_string(), event, args) {
            queue.drain(event.to_string(), &self.inner.bus).await;
        }
    }

    /// Handle `event` when emitted by `peer` (or by every online peer).
    pub async fn on_remote(
        &self,
        peer: Option<&PeerId>,
        event: &str,
        handler: RemoteEventHandler,
    ) -> Result<SubscriptionId> {
        let targets = match peer {
            Some(id) => vec![self.get_peer(id)?],
            None => self.peers(),
        };
        let sub = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));

        for target in targets {
            let Some(target_id) = target.id() else { continue };
            self.inner
                .state
                .lock()
                .remote_events
                .entry(target_id)
                .or_default()
                .entry(event.to_string())
                .or_default()
                .push((sub, Arc::clone(&handler)));
            if let Err(e) = self.subscribe(&target, event).await {
                warn!("Subscribing to '{event}' on {} failed: {e}", target.id_or_key());
                self.off_remote(sub).await;
                return Err(e);
            }
        }
        Ok(sub)
    }

    /// Remove a remote subscription; EVENT_OFF goes out for the last handler of an event.
    ///
    /// Local state is updated first; a peer that fails to acknowledge EVENT_OFF
    /// is logged and skipped.
    pub async fn off_remote(&self, sub: SubscriptionId) {
        let mut unsubscribe = Vec::new();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            for (peer_id, events) in state.remote_events.iter_mut() {
                events.retain(|event, handlers| {
                    handlers.retain(|(id, _)| *id != sub);
                    if handlers.is_empty() {
                        if !self.is_tracked(event) {
                            state.subscribed.remove(&(peer_id.clone(), event.clone()));
                            unsubscribe.push((peer_id.clone(), event.clone()));
                        }
                        false
                    } else {
                        true
                    }
                });
            }
            state.remote_events.retain(|_, events| !events.is_empty());
        }

        for (peer_id, event) in unsubscribe {
            let Ok(peer) = self.get_peer(&peer_id) else { continue };
            if let Err(e) = peer.request(Action::EventOff, json!(event)).await {
                debug!("EVENT_OFF '{event}' to {peer_id} failed: {e}");
            }
        }
    }

    /// Ask `peer` to relay `event`, once per `(peer, event)`.
    async fn subscribe(&self, peer: &Peer, event: &str) -> Result<()> {
        let Some(peer_id) = peer.id() else {
            return Ok(());
        };
        let key = (peer_id, event.to_string());
        if !self.inner.state.lock().subscribed.insert(key.clone()) {
            return Ok(());
        }
        if let Err(e) = peer.request(Action::EventOn, json!(event)).await {
            self.inner.state.lock().subscribed.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn is_tracked(&self, event: &str) -> bool {
        self.inner.config.track_remote_contexts
            && (event == names::CONTEXT_ATTACH || event == names::CONTEXT_DETACH)
    }

    /// Handlers registered for `event` emitted by `peer`.
    pub(crate) fn remote_handlers(&self, peer: &PeerId, event: &str) -> Vec<RemoteEventHandler> {
        self.inner
            .state
            .lock()
            .remote_events
            .get(peer)
            .and_then(|events| events.get(event))
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Keep a peer's context table current from its attach/detach events.
    pub(crate) fn track_remote_context(&self, peer: &Peer, event: &str, args: &[Json]) {
        let Some(info) = args.first() else { return };
        let Some(ctx_id) = info.get("id").and_then(Json::as_str) else {
            return;
        };
        if event == names::CONTEXT_ATTACH {
            match serde_json::from_value::<Definition>(info["definition"].clone()) {
                Ok(def) => {
                    peer.inner.definitions.lock().insert_strong(ctx_id, def);
                    debug!("Peer {} attached context '{ctx_id}'", peer.id_or_key());
                }
                Err(e) => warn!("Bad context attach from {}: {e}", peer.id_or_key()),
            }
            return;
        }
        let removed = peer.inner.definitions.lock().remove_context(ctx_id);
        if let Some(def_id) = removed {
            let key = (peer.id(), def_id);
            let mut state = self.inner.state.lock();
            state.interfaces.remove(&key);
            state.twins.remove(&key);
            debug!("Peer {} detached context '{ctx_id}'", peer.id_or_key());
        }
    }

    // -----------------------------------------------------------------------
    // Super peers
    // -----------------------------------------------------------------------

    pub fn set_context_authorizer(&self, authorizer: Arc<dyn ContextAuthorizer>) {
        *self.inner.authorizer.write() = authorizer;
    }

    pub(crate) fn authorizer(&self) -> Arc<dyn ContextAuthorizer> {
        Arc::clone(&self.inner.authorizer.read())
    }

    /// Expose a local context on a super peer under `ctx_id`.
    pub async fn attach_context_remote(
        &self,
        peer_id: &PeerId,
        ctx: Arc<dyn Context>,
        ctx_id: &str,
    ) -> Result<DefId> {
        let peer = self.get_peer(peer_id)?;
        if !peer.is_super() {
            return Err(NetronError::NotSuperPeer(peer_id.to_string()));
        }
        if peer.inner.attached_there.lock().contains_key(ctx_id) {
            return Err(NetronError::AlreadyExists(format!(
                "Context '{ctx_id}' already attached on '{peer_id}'"
            )));
        }

        let def = self.expose_to(peer_id, ctx);
        let payload = json!({"id": ctx_id, "definition": &*def});
        match peer.request(Action::ContextAttach, payload).await {
            Ok(_) => {
                peer.inner
                    .attached_there
                    .lock()
                    .insert(ctx_id.to_string(), def.id);
                info!("Context '{ctx_id}' attached on super peer {peer_id}");
                Ok(def.id)
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                let released = state.registry.release_tree(def.id);
                forget_local(&mut state, &released);
                Err(e)
            }
        }
    }

    /// A fresh definition for `ctx`, handed to `peer` and released with it.
    /// Unlike [`ref_context`](Self::ref_context) this never reuses an existing one.
    fn expose_to(&self, peer: &PeerId, ctx: Arc<dyn Context>) -> Arc<Definition> {
        let reflection = ctx.reflect();
        let def = Definition::from_reflection(self.next_def_id(), None, None, &reflection);
        let stub = Stub::new(def, ctx);
        let definition = Arc::clone(&stub.definition);
        self.inner
            .state
            .lock()
            .registry
            .insert_referenced(Some(peer), stub);
        definition
    }

    /// Withdraw a context previously attached on a super peer.
    pub async fn detach_context_remote(&self, peer_id: &PeerId, ctx_id: &str) -> Result<()> {
        let peer = self.get_peer(peer_id)?;
        if !peer.is_super() {
            return Err(NetronError::NotSuperPeer(peer_id.to_string()));
        }
        let def_id = peer
            .inner
            .attached_there
            .lock()
            .get(ctx_id)
            .copied()
            .ok_or_else(|| NetronError::UnknownContext(ctx_id.to_string()))?;

        peer.request(Action::ContextDetach, json!({"id": ctx_id}))
            .await?;
        peer.inner.attached_there.lock().remove(ctx_id);
        let mut state = self.inner.state.lock();
        let released = state.registry.release_tree(def_id);
        forget_local(&mut state, &released);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Twins
    // -----------------------------------------------------------------------

    /// Register the client-side implementation used for contexts named `name`.
    pub fn set_interface_twin(&self, name: &str, factory: TwinFactory) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.twin_factories.contains_key(name) {
            return Err(NetronError::AlreadyExists(format!(
                "Twin for '{name}' already registered"
            )));
        }
        state.twin_factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// The twin of `iface`, built on first use. `None` if no twin is registered
    /// for its context, twins are disabled, or the twin is not a `T`.
    pub fn interface_twin<T: Any + Send + Sync>(&self, iface: &Interface) -> Option<Arc<T>> {
        if !self.inner.config.accept_twins {
            return None;
        }
        let key = iface.cache_key();
        let existing = self.inner.state.lock().twins.get(&key).cloned();
        let twin = match existing {
            Some(twin) => twin,
            None => {
                let factory = self
                    .inner
                    .state
                    .lock()
                    .twin_factories
                    .get(iface.name())
                    .cloned()?;
                let built = factory(iface.clone());
                let mut state = self.inner.state.lock();
                Arc::clone(state.twins.entry(key).or_insert(built))
            }
        };
        twin.downcast::<T>().ok()
    }

    // -----------------------------------------------------------------------
    // Pending event queues
    // -----------------------------------------------------------------------

    fn queue_context_event(&self, ctx_id: &str, event: &str, payload: Json) {
        self.queue_event(
            |inner| &inner.context_events,
            ctx_id.to_string(),
            event,
            vec![payload],
        );
    }

    fn queue_peer_event(&self, peer: &Peer, event: &str) {
        let payload = json!({
            "key": peer.key(),
            "peerId": peer.id(),
            "isSuper": peer.is_super(),
            "addr": peer.addr(),
        });
        self.queue_event(|inner| &inner.peer_events, peer.key(), event, vec![payload]);
    }

    fn queue_event<K>(
        &self,
        select: fn(&NetronInner) -> &PendingQueues<K>,
        key: K,
        event: &str,
        args: Vec<Json>,
    ) where
        K: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let queues = select(&self.inner);
        if !queues.enqueue(key.clone(), event, args) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let drain_key = key.clone();
        let started = spawn_detached(async move {
            select(&inner).drain(drain_key, &inner.bus).await;
        });
        if !started {
            debug!("No runtime to deliver '{event}'");
            queues.clear(&key);
        }
    }
}

impl std::fmt::Debug for Netron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netron")
            .field("id", &self.inner.id)
            .field("is_super", &self.inner.config.is_super)
            .finish()
    }
}

/// Forget local interfaces of released definitions.
fn forget_local(state: &mut HubState, released: &[Released]) {
    for r in released {
        let key = (None, r.stub.id());
        state.interfaces.remove(&key);
        state.twins.remove(&key);
    }
}

/// Spawn on the current Tokio runtime. Returns `false` outside a runtime.
fn spawn_detached<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
