//! Packet processing for one peer connection.
//!
//! Called by the peer's read loop for every decoded packet. Replies go to
//! their awaiters; requests are routed by action. GET, SET and EVENT_EMIT run
//! application code and are spawned so the read loop keeps draining.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json, json};
use tracing::{debug, trace, warn};

use crate::context::InterfaceContext;
use crate::definition::{DefId, Definition};
use crate::error::{NetronError, Result};
use crate::events::{handler, names};
use crate::identity::PeerId;
use crate::netron::Netron;
use crate::packet::{Action, Packet, PeerStatus};
use crate::peer::{Peer, parse_reply};
use crate::stream;

/// Payload of the handshake request and of its reply.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Handshake {
    pub(crate) peer_id: PeerId,
    #[serde(default)]
    pub(crate) is_super: bool,
    #[serde(default)]
    pub(crate) contexts: Vec<AnnouncedContext>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AnnouncedContext {
    pub(crate) id: String,
    pub(crate) definition: Definition,
}

pub(crate) async fn process(hub: &Netron, peer: &Peer, packet: Packet) {
    trace!(
        "<- {} {:?} stream={} impulse={} status={:?}",
        peer.id_or_key(),
        packet.action,
        packet.stream_id,
        packet.impulse,
        packet.status
    );

    let local = peer.status();
    if local == PeerStatus::Offline {
        return;
    }
    if !packet.impulse {
        handle_reply(hub, peer, packet);
        return;
    }

    match packet.status {
        PeerStatus::Handshaking if local == PeerStatus::Handshaking && packet.action == Action::Get => {
            handle_handshake(hub, peer, packet).await;
        }
        PeerStatus::Online if local == PeerStatus::Online => {
            handle_request(hub, peer, packet).await;
        }
        status => {
            let reason = format!(
                "{:?} request with status {status:?} while {local:?}",
                packet.action
            );
            violation(hub, peer, reason).await;
        }
    }
}

async fn violation(hub: &Netron, peer: &Peer, reason: String) {
    warn!("Protocol violation by {}: {reason}", peer.id_or_key());
    hub.peer_offline(peer).await;
}

fn handle_reply(hub: &Netron, peer: &Peer, packet: Packet) {
    let stream_id = packet.stream_id;
    if peer.status() == PeerStatus::Handshaking && peer.is_handshake_stream(stream_id) {
        let result = parse_reply(packet.payload)
            .and_then(|payload| hub.accept_handshake(peer, payload))
            .and_then(|()| hub.mark_online(peer));
        peer.resolve_awaiter(stream_id, result.map(|()| Json::Null));
        return;
    }
    if !peer.resolve_awaiter(stream_id, parse_reply(packet.payload)) {
        debug!(
            "Reply on stream {stream_id} from {} has no awaiter; dropped",
            peer.id_or_key()
        );
    }
}

/// Handshake request from the dialing side.
async fn handle_handshake(hub: &Netron, peer: &Peer, packet: Packet) {
    let stream_id = packet.stream_id;
    if let Err(e) = hub.accept_handshake(peer, packet.payload) {
        warn!("Handshake from {} rejected: {e}", peer.id_or_key());
        let _ = peer.reply_err(stream_id, Action::Get, &e).await;
        hub.peer_offline(peer).await;
        return;
    }
    // Reply before going online so the dialer sees the reply first.
    if let Err(e) = peer
        .reply_ok(stream_id, Action::Get, hub.handshake_payload())
        .await
    {
        debug!("Handshake reply to {} failed: {e}", peer.id_or_key());
        hub.peer_offline(peer).await;
        return;
    }
    if let Err(e) = hub.mark_online(peer) {
        violation(hub, peer, e.to_string()).await;
        return;
    }
    let (hub, peer) = (hub.clone(), peer.clone());
    tokio::spawn(async move { hub.track_contexts(&peer).await });
}

async fn handle_request(hub: &Netron, peer: &Peer, packet: Packet) {
    let Packet {
        stream_id,
        action,
        payload,
        ..
    } = packet;

    let sent = match action {
        Action::Get | Action::Set => {
            let (hub, peer) = (hub.clone(), peer.clone());
            tokio::spawn(async move {
                let result = handle_call(&hub, &peer, action, payload).await;
                let sent = match result {
                    Ok(value) => peer.reply_ok(stream_id, action, value).await,
                    Err(e) => {
                        debug!("{action:?} from {} failed: {e}", peer.id_or_key());
                        peer.reply_err(stream_id, action, &e).await
                    }
                };
                if let Err(e) = sent {
                    debug!("Reply to {} failed: {e}", peer.id_or_key());
                }
            });
            Ok(())
        }
        Action::Ping => {
            peer.send_packet(stream_id, false, Action::Ping, Json::Null)
                .await
        }
        Action::ContextAttach => match handle_context_attach(hub, peer, payload) {
            Ok(def_id) => peer.reply_ok(stream_id, action, json!(def_id)).await,
            Err(e) => peer.reply_err(stream_id, action, &e).await,
        },
        Action::ContextDetach => match handle_context_detach(hub, peer, payload) {
            Ok(()) => peer.reply_ok(stream_id, action, Json::Null).await,
            Err(e) => peer.reply_err(stream_id, action, &e).await,
        },
        Action::EventOn | Action::EventOff => match payload.as_str() {
            Some(event) => {
                if action == Action::EventOn {
                    add_forwarder(hub, peer, event);
                } else {
                    remove_forwarder(hub, peer, event);
                }
                peer.reply_ok(stream_id, action, Json::Null).await
            }
            None => {
                let err = NetronError::MalformedPacket("event name must be a string".into());
                peer.reply_err(stream_id, action, &err).await
            }
        },
        Action::EventEmit => {
            let (hub, peer) = (hub.clone(), peer.clone());
            tokio::spawn(async move {
                handle_remote_event(&hub, &peer, payload).await;
                if let Err(e) = peer.reply_ok(stream_id, action, Json::Null).await {
                    debug!("Event ack to {} failed: {e}", peer.id_or_key());
                }
            });
            Ok(())
        }
        _ if action.is_stream() => match stream::handle_packet(peer, action, stream_id, payload).await {
            Ok(Some(incoming)) => {
                hub.deliver_stream(incoming);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        },
        _ => Err(NetronError::ProtocolViolation(format!(
            "unexpected {action:?} request"
        ))),
    };

    if let Err(e) = sent {
        debug!("Handling {action:?} from {} failed: {e}", peer.id_or_key());
    }
}

/// GET / SET: `[defId, name, value]`.
async fn handle_call(hub: &Netron, peer: &Peer, action: Action, payload: Json) -> Result<Json> {
    let (def_id, name, arg): (DefId, String, Json) = serde_json::from_value(payload)
        .map_err(|e| NetronError::MalformedPacket(format!("bad {action:?} payload: {e}")))?;
    let stub = hub.get_stub_by_id(def_id)?;
    let value = hub.decode_incoming(peer, arg)?;
    match action {
        Action::Set => {
            stub.set(&name, value).await?;
            Ok(Json::Null)
        }
        _ => {
            let out = stub.get(&name, value).await?;
            hub.encode_outgoing(peer, out, Some(def_id))
        }
    }
}

#[derive(Deserialize)]
struct AttachRequest {
    id: String,
    definition: Definition,
}

#[derive(Deserialize)]
struct DetachRequest {
    id: String,
}

/// A peer exposes one of its contexts through this hub.
fn handle_context_attach(hub: &Netron, peer: &Peer, payload: Json) -> Result<DefId> {
    let request: AttachRequest = serde_json::from_value(payload)
        .map_err(|e| NetronError::MalformedPacket(format!("bad attach request: {e}")))?;
    let peer_id = peer
        .id()
        .ok_or_else(|| NetronError::ProtocolViolation("attach before handshake".into()))?;
    if !hub
        .authorizer()
        .authorize_attach(hub, peer, &request.id, &request.definition)
    {
        return Err(NetronError::NotImplemented(
            "Context attach is not supported by this peer".into(),
        ));
    }

    let def = peer.inner.definitions.lock().insert_weak(request.definition);
    let iface = hub.interface_for(Some(peer_id.clone()), def);
    let def_id = hub.attach_owned(
        Some(peer_id),
        Arc::new(InterfaceContext::new(iface)),
        Some(&request.id),
    )?;
    peer.inner.attached_here.lock().insert(request.id);
    Ok(def_id)
}

fn handle_context_detach(hub: &Netron, peer: &Peer, payload: Json) -> Result<()> {
    let request: DetachRequest = serde_json::from_value(payload)
        .map_err(|e| NetronError::MalformedPacket(format!("bad detach request: {e}")))?;
    if !hub.authorizer().authorize_detach(hub, peer, &request.id) {
        return Err(NetronError::NotImplemented(
            "Context detach is not supported by this peer".into(),
        ));
    }
    if !peer.inner.attached_here.lock().contains(&request.id) {
        return Err(NetronError::UnknownContext(request.id));
    }
    hub.detach_context(&request.id, true)?;
    peer.inner.attached_here.lock().remove(&request.id);
    Ok(())
}

/// Relay local `event` to `peer`. One forwarder per `(peer, event)`.
fn add_forwarder(hub: &Netron, peer: &Peer, event: &str) {
    let Some(peer_id) = peer.id() else { return };
    let key = (peer_id.clone(), event.to_string());
    if hub.inner_state().lock().forwarders.contains_key(&key) {
        return;
    }

    let target = peer.clone();
    let name = event.to_string();
    let listener = hub.on(
        event,
        handler(move |args: Vec<Json>| {
            let target = target.clone();
            let name = name.clone();
            let peer_id = peer_id.clone();
            async move {
                // Context events about the peer's own contexts would echo back.
                if is_context_event(&name) && owned_by(&args, &peer_id) {
                    return;
                }
                if !target.is_online() {
                    return;
                }
                if let Err(e) = target
                    .request(Action::EventEmit, json!([name, args]))
                    .await
                {
                    debug!("Forwarding '{name}' to {peer_id} failed: {e}");
                }
            }
        }),
    );

    let mut state = hub.inner_state().lock();
    if state.forwarders.contains_key(&key) {
        drop(state);
        hub.off(listener);
    } else {
        state.forwarders.insert(key, listener);
    }
}

fn remove_forwarder(hub: &Netron, peer: &Peer, event: &str) {
    let Some(peer_id) = peer.id() else { return };
    let removed = hub
        .inner_state()
        .lock()
        .forwarders
        .remove(&(peer_id, event.to_string()));
    if let Some(listener) = removed {
        hub.off(listener);
    }
}

fn is_context_event(event: &str) -> bool {
    event == names::CONTEXT_ATTACH || event == names::CONTEXT_DETACH
}

fn owned_by(args: &[Json], peer: &PeerId) -> bool {
    args.first()
        .and_then(|info| info.get("owner"))
        .and_then(Json::as_str)
        .is_some_and(|owner| owner == peer.as_str())
}

/// EVENT_EMIT: `[event, args]`.
async fn handle_remote_event(hub: &Netron, peer: &Peer, payload: Json) {
    let Some(peer_id) = peer.id() else { return };
    let (event, args): (String, Vec<Json>) = match serde_json::from_value(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Bad event from {peer_id}: {e}");
            return;
        }
    };

    if hub.is_tracked(&event) {
        hub.track_remote_context(peer, &event, &args);
    }

    let handlers = hub.remote_handlers(&peer_id, &event);
    let runs = handlers.into_iter().map(|h| {
        let fut = h(peer_id.clone(), args.clone());
        AssertUnwindSafe(fut).catch_unwind()
    });
    for outcome in join_all(runs).await {
        if outcome.is_err() {
            warn!("Handler for remote event '{event}' from {peer_id} panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
