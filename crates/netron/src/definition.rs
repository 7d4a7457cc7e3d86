//! Definitions: serialisable descriptors of a context's callable surface.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::Reflection;
use crate::identity::PeerId;

/// Hub-unique definition id; never reused during the hub's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefId(pub u64);

impl fmt::Display for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Method,
    Property,
}

/// One entry of a definition's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub kind: MemberKind,
    #[serde(default)]
    pub readonly: bool,
}

/// Descriptor of a remotely-exposed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    pub id: DefId,
    /// Peer the object was exposed on behalf of; `None` for local objects.
    #[serde(default)]
    pub owner: Option<PeerId>,
    /// Set when the object was produced as the result of a call on another context.
    #[serde(default)]
    pub parent_id: Option<DefId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub members: Vec<Member>,
}

impl Definition {
    pub fn from_reflection(
        id: DefId,
        owner: Option<PeerId>,
        parent_id: Option<DefId>,
        reflection: &Reflection,
    ) -> Self {
        let mut members = Vec::with_capacity(reflection.methods.len() + reflection.properties.len());
        members.extend(reflection.methods.iter().map(|name| Member {
            name: name.clone(),
            kind: MemberKind::Method,
            readonly: false,
        }));
        members.extend(reflection.properties.iter().map(|p| Member {
            name: p.name.clone(),
            kind: MemberKind::Property,
            readonly: p.readonly,
        }));

        Self {
            id,
            owner,
            parent_id,
            name: reflection.name.clone(),
            description: reflection.description.clone(),
            members,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.member(name).is_some_and(|m| m.kind == MemberKind::Method)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.member(name).is_some_and(|m| m.kind == MemberKind::Property)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.members
            .iter()
            .filter(|m| m.kind == MemberKind::Method)
            .map(|m| m.name.as_str())
    }

    pub fn properties(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.kind == MemberKind::Property)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
