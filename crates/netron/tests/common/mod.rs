#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netron::{
    Context, DuplexTransport, Netron, NetronConfig, NetronError, PeerId, Reflection, Value,
};
use parking_lot::Mutex;
use serde_json::json;

/// Echoes its arguments back.
pub struct Echo;

#[async_trait]
impl Context for Echo {
    fn reflect(&self) -> Reflection {
        Reflection::new("Echo").method("method")
    }

    async fn call(&self, _method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        Ok(Value::List(args))
    }
}

/// A writable counter with a readonly version.
#[derive(Default)]
pub struct Counter {
    value: Mutex<i64>,
}

#[async_trait]
impl Context for Counter {
    fn reflect(&self) -> Reflection {
        Reflection::new("Counter")
            .method("increment")
            .property("counter")
            .readonly_property("version")
    }

    async fn call(&self, _method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        let mut value = self.value.lock();
        *value += 1;
        Ok(Value::from(json!(*value)))
    }

    async fn get(&self, property: &str) -> anyhow::Result<Option<Value>> {
        match property {
            "counter" => Ok(Some(Value::from(json!(*self.value.lock())))),
            "version" => Ok(Some(Value::from(json!("1.0")))),
            _ => Err(NetronError::NotExists(property.to_string()).into()),
        }
    }

    async fn set(&self, _property: &str, value: Value) -> anyhow::Result<()> {
        *self.value.lock() = value.deserialize()?;
        Ok(())
    }
}

/// Never answers in time.
pub struct Slow;

#[async_trait]
impl Context for Slow {
    fn reflect(&self) -> Reflection {
        Reflection::new("Slow").method("wait")
    }

    async fn call(&self, _method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::null())
    }
}

/// Hands out new counters by reference.
pub struct Factory;

#[async_trait]
impl Context for Factory {
    fn reflect(&self) -> Reflection {
        Reflection::new("Factory").method("spawn")
    }

    async fn call(&self, _method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        Ok(Value::context(Counter::default()))
    }
}

/// Looks at what it was given.
pub struct Inspector;

#[async_trait]
impl Context for Inspector {
    fn reflect(&self) -> Reflection {
        Reflection::new("Inspector").method("kind").method("apply")
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let mut args = args.into_iter();
        let first = args.next().unwrap_or_else(Value::null);
        match method {
            "kind" => {
                let kind = match first {
                    Value::Context(_) => "context",
                    Value::Interface(_) => "interface",
                    Value::List(_) => "list",
                    Value::Data(_) => "data",
                };
                Ok(Value::from(json!(kind)))
            }
            _ => {
                let callback = first.into_interface()?;
                let arg = args.next().unwrap_or_else(Value::null);
                Ok(callback.call("method", vec![arg]).await?)
            }
        }
    }
}

pub fn config() -> NetronConfig {
    NetronConfig::default()
}

/// Connect `client` to `server` in memory. Returns the server's id as seen by the client.
pub async fn link(server: &Netron, client: &Netron) -> PeerId {
    let (a, b) = DuplexTransport::pair();
    server.accept_transport(Arc::new(a));
    let peer = client
        .connect_transport(Arc::new(b))
        .await
        .expect("handshake");
    let id = peer.id().expect("online peer has an id");
    let client_id = client.id().clone();
    eventually(|| server.get_peer(&client_id).is_ok()).await;
    id
}

/// Poll `cond` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
