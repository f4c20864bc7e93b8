/// Hierarchical keys
///
/// A key names one entity: a kind plus a numeric id or a string name, an
/// optional parent key, and the partition (project + namespace) it lives in.
/// Keys without an id or name are incomplete; the backend completes them when
/// the entity is first written or when ids are allocated.

use crate::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Reserved property name addressing the key itself in filters and orders.
pub const KEY_PROPERTY: &str = "__key__";

/// Identifier part of a key element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyId {
    /// No identifier yet
    Incomplete,
    /// Numeric identifier (never zero)
    Id(i64),
    /// String identifier (never empty)
    Name(String),
}

impl KeyId {
    fn rank(&self) -> u8 {
        match self {
            KeyId::Incomplete => 0,
            KeyId::Id(_) => 1,
            KeyId::Name(_) => 2,
        }
    }
}

impl Ord for KeyId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyId::Id(a), KeyId::Id(b)) => a.cmp(b),
            (KeyId::Name(a), KeyId::Name(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for KeyId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Entity key
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    kind: String,
    id: KeyId,
    parent: Option<Arc<Key>>,
    namespace: String,
    project: String,
}

impl Key {
    fn build(kind: impl Into<String>, id: KeyId, parent: Option<&Key>) -> Self {
        let (namespace, project) = match parent {
            Some(p) => (p.namespace.clone(), p.project.clone()),
            None => (String::new(), String::new()),
        };
        Self {
            kind: kind.into(),
            id,
            parent: parent.map(|p| Arc::new(p.clone())),
            namespace,
            project,
        }
    }

    /// Key with a numeric id. An id of zero yields an incomplete key.
    ///
    /// The key inherits the parent's namespace and project.
    pub fn id_key(kind: impl Into<String>, id: i64, parent: Option<&Key>) -> Self {
        let id = if id == 0 { KeyId::Incomplete } else { KeyId::Id(id) };
        Self::build(kind, id, parent)
    }

    /// Key with a string name. An empty name yields an incomplete key.
    pub fn name_key(kind: impl Into<String>, name: impl Into<String>, parent: Option<&Key>) -> Self {
        let name = name.into();
        let id = if name.is_empty() {
            KeyId::Incomplete
        } else {
            KeyId::Name(name)
        };
        Self::build(kind, id, parent)
    }

    /// Key whose id will be assigned by the backend.
    pub fn incomplete(kind: impl Into<String>, parent: Option<&Key>) -> Self {
        Self::build(kind, KeyId::Incomplete, parent)
    }

    /// Returns a copy of this key, and its ancestors, in the given namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.parent = self
            .parent
            .map(|p| Arc::new((*p).clone().with_namespace(namespace.clone())));
        self.namespace = namespace;
        self
    }

    /// Returns a copy of this key, and its ancestors, in the given project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        let project = project.into();
        self.parent = self
            .parent
            .map(|p| Arc::new((*p).clone().with_project(project.clone())));
        self.project = project;
        self
    }

    /// Returns a copy of this key completed with `id`, keeping kind, parent
    /// and partition.
    pub fn with_id(&self, id: i64) -> Self {
        let mut key = self.clone();
        key.id = if id == 0 { KeyId::Incomplete } else { KeyId::Id(id) };
        key
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> Option<i64> {
        match self.id {
            KeyId::Id(id) => Some(id),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match &self.id {
            KeyId::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn id_or_name(&self) -> &KeyId {
        &self.id
    }

    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_deref()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self.id, KeyId::Incomplete)
    }

    pub fn is_incomplete(&self) -> bool {
        !self.is_complete()
    }

    /// The top-most ancestor (the key itself for root keys).
    pub fn root(&self) -> &Key {
        let mut k = self;
        while let Some(p) = k.parent() {
            k = p;
        }
        k
    }

    /// True if `ancestor` is this key or one of its ancestors.
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut k = Some(self);
        while let Some(cur) = k {
            if cur == ancestor {
                return true;
            }
            k = cur.parent();
        }
        false
    }

    /// Path from the root down to this key.
    pub fn ancestors(&self) -> Vec<&Key> {
        let mut chain = Vec::new();
        let mut k = Some(self);
        while let Some(cur) = k {
            chain.push(cur);
            k = cur.parent();
        }
        chain.reverse();
        chain
    }

    /// Checks the key is usable for addressing or creating an entity.
    ///
    /// Every element needs a kind, every ancestor must be complete, and all
    /// elements must share namespace and project.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(Error::InvalidKey("key kind is empty".to_string()));
        }
        if let Some(parent) = self.parent() {
            if parent.is_incomplete() {
                return Err(Error::InvalidKey(format!(
                    "parent key {} is incomplete",
                    parent
                )));
            }
            if parent.namespace != self.namespace {
                return Err(Error::InvalidKey(format!(
                    "namespace {:?} differs from parent namespace {:?}",
                    self.namespace, parent.namespace
                )));
            }
            if parent.project != self.project {
                return Err(Error::InvalidKey(format!(
                    "project {:?} differs from parent project {:?}",
                    self.project, parent.project
                )));
            }
            parent.validate()?;
        }
        Ok(())
    }

    /// Like `validate`, additionally requiring the key to be complete.
    pub fn validate_complete(&self) -> Result<()> {
        self.validate()?;
        if self.is_incomplete() {
            return Err(Error::InvalidKey(format!("key {} is incomplete", self)));
        }
        Ok(())
    }

    /// Wire path representation.
    pub fn to_path(&self) -> KeyPath {
        KeyPath {
            partition: PartitionId {
                project: self.project.clone(),
                namespace: self.namespace.clone(),
            },
            path: self
                .ancestors()
                .into_iter()
                .map(|k| PathElement {
                    kind: k.kind.clone(),
                    id: k.id.clone(),
                })
                .collect(),
        }
    }

    /// Rebuilds a key from its wire path. Fails only for an empty path.
    pub fn from_path(path: &KeyPath) -> Result<Key> {
        let mut key: Option<Key> = None;
        for elem in &path.path {
            let next = Key {
                kind: elem.kind.clone(),
                id: elem.id.clone(),
                parent: key.map(Arc::new),
                namespace: path.partition.namespace.clone(),
                project: path.partition.project.clone(),
            };
            key = Some(next);
        }
        key.ok_or_else(|| Error::InvalidKey("key path is empty".to_string()))
    }

    /// Opaque, URL-safe string form of the key.
    pub fn encode(&self) -> String {
        // Serializing plain strings and integers into a Vec cannot fail.
        let bytes = bincode::serialize(&self.to_path()).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Parses the output of [`Key::encode`].
    pub fn decode(encoded: &str) -> Result<Key> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidKey(format!("bad encoded key: {}", e)))?;
        let path: KeyPath = bincode::deserialize(&bytes)
            .map_err(|e| Error::InvalidKey(format!("bad encoded key: {}", e)))?;
        Key::from_path(&path)
    }
}

impl Ord for Key {
    /// Canonical order: partition, then element by element from the root,
    /// each element by kind then id/name (ids before names). Ancestors sort
    /// before their descendants.
    fn cmp(&self, other: &Self) -> Ordering {
        self.project
            .cmp(&other.project)
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| {
                let a = self.ancestors();
                let b = other.ancestors();
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.kind.cmp(&y.kind).then_with(|| x.id.cmp(&y.id));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            })
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for k in self.ancestors() {
            match &k.id {
                KeyId::Incomplete => write!(f, "/{},0", k.kind)?,
                KeyId::Id(id) => write!(f, "/{},{}", k.kind, id)?,
                KeyId::Name(name) => write!(f, "/{},{:?}", k.kind, name)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "Key({})", self)
        } else {
            write!(f, "Key({}:{})", self.namespace, self)
        }
    }
}

// ============================================================================
// Wire path representation
// ============================================================================

/// Partition a key lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PartitionId {
    pub project: String,
    pub namespace: String,
}

/// One (kind, id-or-name) step of a key path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathElement {
    pub kind: String,
    pub id: KeyId,
}

/// Key as sent over the wire: partition plus root-first path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPath {
    pub partition: PartitionId,
    pub path: Vec<PathElement>,
}
