//! Stub registry: definition table, named contexts and the ownership tree.
//!
//! Objects returned by reference from a call become children of the
//! definition they were produced by. Releasing a definition can release its
//! whole subtree; the walk is iterative and keeps a visited set because
//! returned object graphs may point back at an ancestor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::context::{Context, instance_key};
use crate::definition::DefId;
use crate::error::{NetronError, Result};
use crate::identity::PeerId;
use crate::stub::Stub;

/// A stub removed from the registry, with the context name it was attached under.
#[derive(Debug, Clone)]
pub struct Released {
    pub stub: Stub,
    pub name: Option<String>,
}

#[derive(Default)]
pub struct Registry {
    stubs: HashMap<DefId, Stub>,
    contexts: HashMap<String, DefId>,
    names: HashMap<DefId, String>,
    /// Stubs created on demand for objects handed to a peer (`None`: local callers).
    referenced: HashMap<Option<PeerId>, Vec<DefId>>,
    children: HashMap<DefId, Vec<DefId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: DefId) -> Option<&Stub> {
        self.stubs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn context_id(&self, name: &str) -> Option<DefId> {
        self.contexts.get(name).copied()
    }

    pub fn context(&self, name: &str) -> Option<&Stub> {
        self.context_id(name).and_then(|id| self.stubs.get(&id))
    }

    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contexts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Named contexts with their stubs, sorted by name.
    pub fn contexts(&self) -> Vec<(String, Stub)> {
        let mut out: Vec<(String, Stub)> = self
            .contexts
            .iter()
            .filter_map(|(name, id)| self.stubs.get(id).map(|s| (name.clone(), s.clone())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Index a stub, linking it under its parent definition.
    pub fn insert(&mut self, stub: Stub) {
        let id = stub.id();
        if let Some(parent) = stub.definition.parent_id {
            self.children.entry(parent).or_default().push(id);
        }
        self.stubs.insert(id, stub);
    }

    /// Insert a stub and expose it under `name`.
    pub fn attach(&mut self, name: &str, stub: Stub) -> Result<()> {
        if self.contexts.contains_key(name) {
            return Err(NetronError::AlreadyExists(format!(
                "Context '{name}' already attached"
            )));
        }
        let id = stub.id();
        self.insert(stub);
        self.contexts.insert(name.to_string(), id);
        self.names.insert(id, name.to_string());
        Ok(())
    }

    /// Remove the context attached under `name`, optionally with everything it produced.
    pub fn detach(&mut self, name: &str, release_originated: bool) -> Result<Vec<Released>> {
        let id = self
            .context_id(name)
            .ok_or_else(|| NetronError::UnknownContext(name.to_string()))?;
        Ok(if release_originated {
            self.release_tree(id)
        } else {
            self.remove(id).into_iter().collect()
        })
    }

    /// Stub previously created for `instance` on behalf of `peer`.
    pub fn find_referenced(&self, peer: Option<&PeerId>, instance: &Arc<dyn Context>) -> Option<DefId> {
        let key = instance_key(instance);
        self.referenced
            .get(&peer.cloned())?
            .iter()
            .copied()
            .find(|id| {
                self.stubs
                    .get(id)
                    .is_some_and(|s| instance_key(&s.instance) == key)
            })
    }

    pub fn insert_referenced(&mut self, peer: Option<&PeerId>, stub: Stub) {
        self.referenced.entry(peer.cloned()).or_default().push(stub.id());
        self.insert(stub);
    }

    /// Remove a single stub without touching its descendants.
    pub fn remove(&mut self, id: DefId) -> Option<Released> {
        let stub = self.stubs.remove(&id)?;
        if let Some(parent) = stub.definition.parent_id
            && let Some(siblings) = self.children.get_mut(&parent)
        {
            siblings.retain(|c| *c != id);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }
        self.referenced.retain(|_, ids| {
            ids.retain(|r| *r != id);
            !ids.is_empty()
        });
        let name = self.names.remove(&id);
        if let Some(name) = &name {
            self.contexts.remove(name);
        }
        Some(Released { stub, name })
    }

    /// Every definition reachable from `root` through the ownership tree, root excluded.
    pub fn descendants(&self, root: DefId) -> Vec<DefId> {
        let mut visited = HashSet::from([root]);
        let mut stack = vec![root];
        let mut out = Vec::new();
        while let Some(id) = stack.pop() {
            for child in self.children.get(&id).into_iter().flatten() {
                if visited.insert(*child) {
                    out.push(*child);
                    stack.push(*child);
                }
            }
        }
        out
    }

    /// Remove `root` and its whole subtree.
    pub fn release_tree(&mut self, root: DefId) -> Vec<Released> {
        let mut ids = vec![root];
        ids.extend(self.descendants(root));
        let released: Vec<Released> = ids.into_iter().filter_map(|id| self.remove(id)).collect();
        self.children.remove(&root);
        released
    }

    /// Release everything exposed on behalf of `peer` or handed out to it.
    pub fn release_peer(&mut self, peer: &PeerId) -> Vec<Released> {
        let mut roots: Vec<DefId> = self
            .stubs
            .values()
            .filter(|s| s.definition.owner.as_ref() == Some(peer))
            .map(Stub::id)
            .collect();
        roots.extend(
            self.referenced
                .get(&Some(peer.clone()))
                .into_iter()
                .flatten()
                .copied(),
        );

        let mut released = Vec::new();
        for root in roots {
            if self.stubs.contains_key(&root) {
                released.extend(self.release_tree(root));
            }
        }
        self.referenced.remove(&Some(peer.clone()));
        released
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
