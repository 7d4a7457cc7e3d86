//! Contexts: application objects exposed for remote access.
//!
//! A context describes its callable surface through [`Context::reflect`] and
//! receives member access through the generic `call` / `get` / `set` entry
//! points. The hub never inspects a context beyond that.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NetronError;
use crate::interface::Interface;
use crate::value::Value;

/// Manifest entry for a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub readonly: bool,
}

/// Method/property manifest of a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reflection {
    pub name: String,
    pub description: String,
    pub methods: Vec<String>,
    pub properties: Vec<PropertyInfo>,
}

impl Reflection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(name.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(PropertyInfo {
            name: name.into(),
            readonly: false,
        });
        self
    }

    pub fn readonly_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(PropertyInfo {
            name: name.into(),
            readonly: true,
        });
        self
    }
}

/// An object that can be attached to a hub and called by peers.
///
/// Errors returned from these methods are sent back to the caller as tagged
/// error replies. Returning a [`NetronError`] (wrapped in `anyhow`) keeps its
/// kind; any other error is reported as an application error.
#[async_trait]
pub trait Context: Send + Sync + 'static {
    fn reflect(&self) -> Reflection;

    /// Invoke a method listed in the manifest.
    async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value>;

    /// Read a property. `Ok(None)` means "undefined": the caller's default is used.
    async fn get(&self, property: &str) -> anyhow::Result<Option<Value>> {
        Err(NetronError::NotExists(format!("Property '{property}' not exists")).into())
    }

    async fn set(&self, property: &str, _value: Value) -> anyhow::Result<()> {
        Err(NetronError::NotExists(format!("Property '{property}' not exists")).into())
    }
}

/// Identity of a context instance, used to de-duplicate references.
pub(crate) fn instance_key(ctx: &Arc<dyn Context>) -> usize {
    Arc::as_ptr(ctx) as *const () as usize
}

/// Context that forwards every access to an [`Interface`].
///
/// Used when an object living on one peer has to be exposed to another one:
/// super-peer context attachment and interfaces passed to a third peer.
pub struct InterfaceContext {
    iface: Interface,
}

impl InterfaceContext {
    pub fn new(iface: Interface) -> Self {
        Self { iface }
    }

    pub fn interface(&self) -> &Interface {
        &self.iface
    }
}

#[async_trait]
impl Context for InterfaceContext {
    fn reflect(&self) -> Reflection {
        let def = self.iface.definition();
        Reflection {
            name: def.name.clone(),
            description: def.description.clone(),
            methods: def.methods().map(str::to_string).collect(),
            properties: def
                .properties()
                .map(|m| PropertyInfo {
                    name: m.name.clone(),
                    readonly: m.readonly,
                })
                .collect(),
        }
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        Ok(self.iface.call(method, args).await?)
    }

    async fn get(&self, property: &str) -> anyhow::Result<Option<Value>> {
        Ok(Some(self.iface.get(property, None).await?))
    }

    async fn set(&self, property: &str, value: Value) -> anyhow::Result<()> {
        Ok(self.iface.set(property, value).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    #[async_trait]
    impl Context for Plain {
        fn reflect(&self) -> Reflection {
            Reflection::new("Plain").method("noop")
        }

        async fn call(&self, _method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
            Ok(Value::null())
        }
    }

    #[test]
    fn test_reflection_builder() {
        let r = Reflection::new("Store")
            .description("kv")
            .method("put")
            .method("get")
            .property("size")
            .readonly_property("version");
        assert_eq!(r.methods, vec!["put", "get"]);
        assert_eq!(r.properties.len(), 2);
        assert!(!r.properties[0].readonly);
        assert!(r.properties[1].readonly);
        assert_eq!(r.description, "kv");
    }

    #[test]
    fn test_instance_key_follows_allocation() {
        let a: Arc<dyn Context> = Arc::new(Plain);
        let b: Arc<dyn Context> = Arc::new(Plain);
        assert_eq!(instance_key(&a), instance_key(&a.clone()));
        assert_ne!(instance_key(&a), instance_key(&b));
    }

    #[tokio::test]
    async fn test_default_property_access_is_not_exists() {
        let ctx = Plain;
        let err = ctx.get("missing").await.unwrap_err();
        let err = NetronError::from_context(err);
        assert!(matches!(err, NetronError::NotExists(_)));
    }
}
