//! Values exchanged with contexts.
//!
//! Plain data travels as JSON. Live objects (local contexts, interfaces of
//! remote ones) travel by reference: the hub replaces them with a definition
//! or reference marker on the wire and turns markers back into interfaces or
//! local instances on receipt.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as Json, json};

use crate::context::Context;
use crate::definition::{DefId, Definition};
use crate::error::{NetronError, Result};
use crate::interface::Interface;

const MARKER_KEY: &str = "$netron";
const MARKER_DEFINITION: &str = "definition";
const MARKER_REFERENCE: &str = "reference";

#[derive(Clone)]
pub enum Value {
    Data(Json),
    Context(Arc<dyn Context>),
    Interface(Interface),
    /// A sequence holding at least one live object.
    List(Vec<Value>),
}

impl Value {
    pub fn null() -> Self {
        Self::Data(Json::Null)
    }

    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Data(serde_json::to_value(value)?))
    }

    pub fn context(ctx: impl Context) -> Self {
        Self::Context(Arc::new(ctx))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Data(Json::Null))
    }

    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Self::Data(json) => Some(json),
            _ => None,
        }
    }

    pub fn as_interface(&self) -> Option<&Interface> {
        match self {
            Self::Interface(iface) => Some(iface),
            _ => None,
        }
    }

    pub fn into_interface(self) -> Result<Interface> {
        match self {
            Self::Interface(iface) => Ok(iface),
            other => Err(NetronError::InvalidArgument(format!(
                "expected an interface, got {other:?}"
            ))),
        }
    }

    /// Convert to plain JSON; fails if the value holds a live object.
    pub fn into_json(self) -> Result<Json> {
        match self {
            Self::Data(json) => Ok(json),
            Self::List(items) => items
                .into_iter()
                .map(Value::into_json)
                .collect::<Result<Vec<_>>>()
                .map(Json::Array),
            other => Err(NetronError::InvalidArgument(format!(
                "expected plain data, got {other:?}"
            ))),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.into_json()?)?)
    }

    /// Collapse a `List` made only of plain data into a JSON array.
    pub fn normalize(self) -> Self {
        match self {
            Self::List(items) => {
                let items: Vec<Value> = items.into_iter().map(Value::normalize).collect();
                if items.iter().all(|v| matches!(v, Self::Data(_))) {
                    Self::Data(Json::Array(
                        items
                            .into_iter()
                            .filter_map(|v| match v {
                                Self::Data(json) => Some(json),
                                _ => None,
                            })
                            .collect(),
                    ))
                } else {
                    Self::List(items)
                }
            }
            other => other,
        }
    }

    /// Interpret this value as an argument list.
    ///
    /// A `List` or JSON array spreads into its elements, null means no
    /// arguments, anything else is a single argument.
    pub fn into_args(self) -> Vec<Value> {
        match self {
            Self::List(items) => items,
            Self::Data(Json::Array(items)) => items.into_iter().map(Value::Data).collect(),
            Self::Data(Json::Null) => Vec::new(),
            other => vec![other],
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(json) => write!(f, "Data({json})"),
            Self::Context(ctx) => write!(f, "Context({})", ctx.reflect().name),
            Self::Interface(iface) => write!(
                f,
                "Interface({}#{} @ {})",
                iface.definition().name,
                iface.def_id(),
                iface
                    .peer_id()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "local".into())
            ),
            Self::List(items) => f.debug_list().entries(items).finish(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Data(a), Self::Data(b)) => a == b,
            (Self::Context(a), Self::Context(b)) => Arc::ptr_eq(a, b),
            (Self::Interface(a), Self::Interface(b)) => Interface::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        Self::Data(json)
    }
}

impl From<Arc<dyn Context>> for Value {
    fn from(ctx: Arc<dyn Context>) -> Self {
        Self::Context(ctx)
    }
}

impl From<Interface> for Value {
    fn from(iface: Interface) -> Self {
        Self::Interface(iface)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items).normalize()
    }
}

// ---------------------------------------------------------------------------
// Wire markers
// ---------------------------------------------------------------------------

/// A live object as it appears inside a payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Marker {
    /// An object exposed by the sender.
    Definition(Definition),
    /// An object the receiver itself exposed earlier.
    Reference(DefId),
}

impl Marker {
    pub(crate) fn to_json(&self) -> Result<Json> {
        Ok(match self {
            Self::Definition(def) => json!({
                MARKER_KEY: MARKER_DEFINITION,
                "definition": serde_json::to_value(def)?,
            }),
            Self::Reference(id) => json!({
                MARKER_KEY: MARKER_REFERENCE,
                "defId": id,
            }),
        })
    }

    /// `None` when `json` is not a marker object.
    pub(crate) fn parse(json: &Json) -> Option<Result<Self>> {
        let kind = json.as_object()?.get(MARKER_KEY)?.as_str()?;
        Some(match kind {
            MARKER_DEFINITION => serde_json::from_value(json["definition"].clone())
                .map(Self::Definition)
                .map_err(|e| NetronError::MalformedPacket(format!("bad definition: {e}"))),
            MARKER_REFERENCE => serde_json::from_value(json["defId"].clone())
                .map(Self::Reference)
                .map_err(|e| NetronError::MalformedPacket(format!("bad reference: {e}"))),
            other => Err(NetronError::MalformedPacket(format!(
                "unknown value marker '{other}'"
            ))),
        })
    }

    pub(crate) fn contains_marker(json: &Json) -> bool {
        match json {
            Json::Array(items) => items.iter().any(Self::contains_marker),
            other => Self::parse(other).is_some(),
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

    #[test]
    fn test_args_spreading() {
        assert_eq!(Value::Data(json!([1, 2, 3])).into_args().len(), 3);
        assert!(Value::null().into_args().is_empty());
        assert_eq!(
            Value::Data(json!("one")).into_args(),
            vec![Value::Data(json!("one"))]
        );
    }

    #[test]
    fn test_normalize_collapses_plain_lists() {
        let v = Value::List(vec![Value::Data(json!(1)), Value::Data(json!("x"))]).normalize();
        assert_eq!(v, Value::Data(json!([1, "x"])));
        assert_eq!(Value::from(Vec::<Value>::new()), Value::Data(json!([])));
    }

    #[test]
    fn test_into_json_and_deserialize() {
        let v = Value::List(vec![Value::Data(json!(2)), Value::Data(json!(3))]);
        assert_eq!(v.into_json().unwrap(), json!([2, 3]));
        let n: u32 = Value::Data(json!(5)).deserialize().unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn test_marker_roundtrip() {
        let def = Definition::from_reflection(
            DefId(9),
            None,
            None,
            &Reflection::new("Echo").method("echo"),
        );
        let json = Marker::Definition(def.clone()).to_json().unwrap();
        assert_eq!(json["$netron"], "definition");
        assert_eq!(Marker::parse(&json).unwrap().unwrap(), Marker::Definition(def));

        let json = Marker::Reference(DefId(3)).to_json().unwrap();
        assert_eq!(Marker::parse(&json).unwrap().unwrap(), Marker::Reference(DefId(3)));
        assert!(Marker::contains_marker(&json!([1, json])));
    }

    #[test]
    fn test_plain_objects_are_not_markers() {
        assert!(Marker::parse(&json!({"defId": 3})).is_none());
        assert!(Marker::parse(&json!(3)).is_none());
        assert!(matches!(
            Marker::parse(&json!({"$netron": "bogus"})),
            Some(Err(NetronError::MalformedPacket(_)))
        ));
    }
}
