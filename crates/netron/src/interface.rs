//! Interfaces: client-side proxies for contexts.
//!
//! An interface is a definition plus the peer that exposes it (`None` for a
//! context of the local hub). Member access goes through the generic
//! `call` / `get` / `set` entry points, which the hub turns into GET and SET
//! requests. The hub caches interfaces per `(peer, definition id)`, so two
//! lookups of the same object yield the same interface.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::definition::{DefId, Definition};
use crate::error::{NetronError, Result};
use crate::identity::PeerId;
use crate::netron::{Netron, NetronInner};
use crate::value::Value;

struct InterfaceInner {
    definition: Arc<Definition>,
    peer: Option<PeerId>,
    hub: Weak<NetronInner>,
}

#[derive(Clone)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

impl Interface {
    pub(crate) fn new(definition: Arc<Definition>, peer: Option<PeerId>, hub: Weak<NetronInner>) -> Self {
        Self {
            inner: Arc::new(InterfaceInner {
                definition,
                peer,
                hub,
            }),
        }
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.inner.definition
    }

    pub fn def_id(&self) -> DefId {
        self.inner.definition.id
    }

    pub fn name(&self) -> &str {
        &self.inner.definition.name
    }

    /// The exposing peer, or `None` for a local context.
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.inner.peer.as_ref()
    }

    pub fn is_local(&self) -> bool {
        self.inner.peer.is_none()
    }

    pub fn ptr_eq(a: &Interface, b: &Interface) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn cache_key(&self) -> (Option<PeerId>, DefId) {
        (self.inner.peer.clone(), self.def_id())
    }

    fn hub(&self) -> Result<Netron> {
        self.inner
            .hub
            .upgrade()
            .map(Netron::from_inner)
            .ok_or(NetronError::Shutdown)
    }

    fn require_method(&self, method: &str) -> Result<()> {
        if self.inner.definition.has_method(method) {
            Ok(())
        } else {
            Err(NetronError::NotExists(format!(
                "Method '{method}' not exists in '{}'",
                self.name()
            )))
        }
    }

    fn require_property(&self, property: &str) -> Result<()> {
        if self.inner.definition.has_property(property) {
            Ok(())
        } else {
            Err(NetronError::NotExists(format!(
                "Property '{property}' not exists in '{}'",
                self.name()
            )))
        }
    }

    /// Invoke a method and wait for its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.require_method(method)?;
        self.hub()?
            .get(self.peer_id(), self.def_id(), method, Value::List(args))
            .await
    }

    /// Invoke a method and discard its result.
    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.require_method(method)?;
        self.hub()?
            .set(self.peer_id(), self.def_id(), method, Value::List(args))
            .await
    }

    /// Read a property; `default` is returned when the remote value is undefined.
    pub async fn get(&self, property: &str, default: Option<Value>) -> Result<Value> {
        self.require_property(property)?;
        self.hub()?
            .get(
                self.peer_id(),
                self.def_id(),
                property,
                default.unwrap_or_else(Value::null),
            )
            .await
    }

    pub async fn set(&self, property: &str, value: Value) -> Result<()> {
        self.require_property(property)?;
        if self.inner.definition.member(property).is_some_and(|m| m.readonly) {
            return Err(NetronError::ReadOnlyProperty(property.to_string()));
        }
        self.hub()?
            .set(self.peer_id(), self.def_id(), property, value)
            .await
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.inner.definition.name)
            .field("def_id", &self.inner.definition.id)
            .field("peer", &self.inner.peer)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
