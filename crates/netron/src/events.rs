//! Local event bus and per-key pending queues.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::identity::PeerId;

/// Event names emitted by the hub itself.
pub mod names {
    pub const CONTEXT_ATTACH: &str = "context attach";
    pub const CONTEXT_DETACH: &str = "context detach";
    pub const PEER_CREATE: &str = "peer create";
    pub const PEER_CONNECT: &str = "peer connect";
    pub const PEER_ONLINE: &str = "peer online";
    pub const PEER_OFFLINE: &str = "peer offline";
}

/// Handler for a local event.
pub type EventHandler =
    Arc<dyn Fn(Vec<Json>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Handler for an event emitted by a remote peer.
pub type RemoteEventHandler =
    Arc<dyn Fn(PeerId, Vec<Json>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Build an [`EventHandler`] from an async closure.
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Vec<Json>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Build a [`RemoteEventHandler`] from an async closure.
pub fn remote_handler<F, Fut>(f: F) -> RemoteEventHandler
where
    F: Fn(PeerId, Vec<Json>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |peer, args| Box::pin(f(peer, args)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Named events with any number of async handlers each.
pub struct EventBus {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(ListenerId, EventHandler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        debug!("Listener {} registered for '{event}'", id.0);
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.lock();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(lid, _)| *lid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, Vec::len)
    }

    /// Run every handler of `event` concurrently and wait for all of them.
    ///
    /// A panicking handler is logged and does not affect the others.
    pub async fn emit(&self, event: &str, args: Vec<Json>) {
        let handlers: Vec<EventHandler> = match self.handlers.lock().get(event) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        let runs = handlers.into_iter().map(|h| {
            let fut = h(args.clone());
            AssertUnwindSafe(fut).catch_unwind()
        });
        for outcome in join_all(runs).await {
            if outcome.is_err() {
                warn!("Handler for event '{event}' panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO queues of pending emissions, one per key.
///
/// The caller that turns an empty queue non-empty owns the drain; everyone
/// else only appends. That keeps at most one emission in flight per key.
pub(crate) struct PendingQueues<K> {
    queues: Mutex<HashMap<K, VecDeque<(String, Vec<Json>)>>>,
}

impl<K: Eq + Hash + Clone> PendingQueues<K> {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Append an emission. Returns `true` if the caller must start draining.
    pub(crate) fn enqueue(&self, key: K, event: &str, args: Vec<Json>) -> bool {
        let mut queues = self.queues.lock();
        let queue = queues.entry(key).or_default();
        queue.push_back((event.to_string(), args));
        queue.len() == 1
    }

    pub(crate) fn front(&self, key: &K) -> Option<(String, Vec<Json>)> {
        self.queues.lock().get(key).and_then(|q| q.front().cloned())
    }

    /// Pop the emission that was just delivered. Returns `true` if more remain.
    pub(crate) fn advance(&self, key: &K) -> bool {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(key) else {
            return false;
        };
        queue.pop_front();
        if queue.is_empty() {
            queues.remove(key);
            false
        } else {
            true
        }
    }

    /// Drop everything queued for `key`.
    pub(crate) fn clear(&self, key: &K) {
        self.queues.lock().remove(key);
    }

    /// Deliver everything queued for `key`, in order.
    pub(crate) async fn drain(&self, key: K, bus: &EventBus) {
        while let Some((event, args)) = self.front(&key) {
            bus.emit(&event, args).await;
            if !self.advance(&key) {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_emit_runs_all_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.on(
                "tick",
                handler(move |args| {
                    let hits = Arc::clone(&hits);
                    async move {
                        assert_eq!(args, vec![Json::from(1)]);
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            );
        }

        bus.emit("tick", vec![Json::from(1)]).await;
        bus.emit("other", vec![]).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_off_removes_only_that_listener() {
        let bus = EventBus::new();
        let a = bus.on("e", handler(|_| async {}));
        let _b = bus.on("e", handler(|_| async {}));
        assert_eq!(bus.listener_count("e"), 2);
        assert!(bus.off(a));
        assert!(!bus.off(a));
        assert_eq!(bus.listener_count("e"), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let bus = EventBus::new();
        let hit = Arc::new(AtomicUsize::new(0));
        bus.on(
            "e",
            handler(|_| async {
                if true {
                    panic!("boom");
                }
            }),
        );
        {
            let hit = Arc::clone(&hit);
            bus.on(
                "e",
                handler(move |_| {
                    let hit = Arc::clone(&hit);
                    async move {
                        hit.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            );
        }
        bus.emit("e", vec![]).await;
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_queue_preserves_order() {
        let bus = Arc::new(EventBus::new());
        let queues = Arc::new(PendingQueues::<String>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.on(
                "e",
                handler(move |args| {
                    let seen = Arc::clone(&seen);
                    async move {
                        let n = args[0].as_u64().unwrap_or_default();
                        if n == 1 {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        seen.lock().push(n);
                    }
                }),
            );
        }

        let key = "ctx".to_string();
        assert!(queues.enqueue(key.clone(), "e", vec![Json::from(1)]));
        let drainer = {
            let (bus, queues, key) = (Arc::clone(&bus), Arc::clone(&queues), key.clone());
            tokio::spawn(async move { queues.drain(key, &bus).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!queues.enqueue(key.clone(), "e", vec![Json::from(2)]));

        drainer.await.unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert!(queues.front(&key).is_none());
    }
}
