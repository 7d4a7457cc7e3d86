//! Stubs: server-side bindings from a definition back to its live instance.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::context::Context;
use crate::definition::{DefId, Definition, MemberKind};
use crate::error::{ErrorKind, NetronError, RemoteError, Result};
use crate::value::Value;

#[derive(Clone)]
pub struct Stub {
    pub definition: Arc<Definition>,
    pub instance: Arc<dyn Context>,
}

impl Stub {
    pub fn new(definition: Definition, instance: Arc<dyn Context>) -> Self {
        Self {
            definition: Arc::new(definition),
            instance,
        }
    }

    pub fn id(&self) -> DefId {
        self.definition.id
    }

    /// Read a property or invoke a method.
    ///
    /// For a property `default` is returned when the instance reports no value;
    /// for a method `default` carries the argument list.
    pub async fn get(&self, name: &str, default: Value) -> Result<Value> {
        match self.member_kind(name)? {
            MemberKind::Method => {
                let call = self.instance.call(name, default.into_args());
                Ok(guard(name, call).await?.normalize())
            }
            MemberKind::Property => {
                let read = self.instance.get(name);
                Ok(guard(name, read).await?.unwrap_or(default))
            }
        }
    }

    /// Write a property, or invoke a method and discard its result.
    pub async fn set(&self, name: &str, value: Value) -> Result<()> {
        match self.member_kind(name)? {
            MemberKind::Method => {
                let call = self.instance.call(name, value.into_args());
                guard(name, call).await.map(|_| ())
            }
            MemberKind::Property => {
                let readonly = self
                    .definition
                    .member(name)
                    .is_some_and(|m| m.readonly);
                if readonly {
                    return Err(NetronError::ReadOnlyProperty(name.to_string()));
                }
                guard(name, self.instance.set(name, value)).await
            }
        }
    }

    fn member_kind(&self, name: &str) -> Result<MemberKind> {
        self.definition.member(name).map(|m| m.kind).ok_or_else(|| {
            NetronError::NotExists(format!(
                "Member '{name}' not exists in '{}'",
                self.definition.name
            ))
        })
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("id", &self.definition.id)
            .field("name", &self.definition.name)
            .finish()
    }
}

/// Await context code, classifying its errors and containing panics.
async fn guard<T>(
    member: &str,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result.map_err(NetronError::from_context),
        Err(_) => {
            tracing::error!("Context member '{member}' panicked");
            Err(NetronError::Remote(RemoteError::new(
                ErrorKind::Internal,
                format!("'{member}' panicked"),
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Reflection;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Counter {
        counter: Mutex<i64>,
        label: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Context for Counter {
        fn reflect(&self) -> Reflection {
            Reflection::new("Counter")
                .method("echo")
                .method("explode")
                .method("fail")
                .property("counter")
                .property("label")
                .readonly_property("version")
        }

        async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
            match method {
                "echo" => Ok(Value::List(args)),
                "explode" => panic!("explode called"),
                _ => anyhow::bail!("refusing {method}"),
            }
        }

        async fn get(&self, property: &str) -> anyhow::Result<Option<Value>> {
            Ok(match property {
                "counter" => Some(json!(*self.counter.lock()).into()),
                "label" => self.label.lock().clone().map(|l| json!(l).into()),
                _ => Some(json!("1.0").into()),
            })
        }

        async fn set(&self, property: &str, value: Value) -> anyhow::Result<()> {
            let json = value.into_json()?;
            match property {
                "counter" => *self.counter.lock() = json.as_i64().unwrap_or_default(),
                _ => *self.label.lock() = json.as_str().map(str::to_string),
            }
            Ok(())
        }
    }

    fn stub() -> Stub {
        let ctx = Arc::new(Counter {
            counter: Mutex::new(0),
            label: Mutex::new(None),
        });
        let def = Definition::from_reflection(DefId(1), None, None, &ctx.reflect());
        Stub::new(def, ctx)
    }

    #[tokio::test]
    async fn test_method_echoes_args_in_order() {
        let stub = stub();
        let out = stub.get("echo", json!([1, 2, 3]).into()).await.unwrap();
        assert_eq!(out, Value::Data(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_property_default_when_undefined() {
        let stub = stub();
        let out = stub.get("label", json!("none").into()).await.unwrap();
        assert_eq!(out, Value::Data(json!("none")));

        stub.set("label", json!("set").into()).await.unwrap();
        let out = stub.get("label", json!("none").into()).await.unwrap();
        assert_eq!(out, Value::Data(json!("set")));
    }

    #[tokio::test]
    async fn test_counter_set_then_get() {
        let stub = stub();
        stub.set("counter", json!(5).into()).await.unwrap();
        let out = stub.get("counter", Value::null()).await.unwrap();
        assert_eq!(out, Value::Data(json!(5)));
    }

    #[tokio::test]
    async fn test_readonly_and_unknown_members() {
        let stub = stub();
        assert!(matches!(
            stub.set("version", json!("2.0").into()).await,
            Err(NetronError::ReadOnlyProperty(_))
        ));
        assert!(matches!(
            stub.get("missing", Value::null()).await,
            Err(NetronError::NotExists(_))
        ));
    }

    #[tokio::test]
    async fn test_errors_and_panics_are_classified() {
        let stub = stub();
        match stub.get("fail", Value::null()).await {
            Err(NetronError::Application(msg)) => assert!(msg.contains("refusing fail")),
            other => panic!("Expected Application, got {other:?}"),
        }
        match stub.set("explode", Value::null()).await {
            Err(err) => assert_eq!(err.kind(), ErrorKind::Internal),
            Ok(()) => panic!("Expected panic to surface as an error"),
        }
    }
}
