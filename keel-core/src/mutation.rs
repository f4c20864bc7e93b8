use crate::codec::{self, Record};
use crate::types::Entity;
use crate::{Error, Key, Result};

/// A single write
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create; fails if the entity already exists
    Insert { key: Key, entity: Entity },
    /// Replace; fails if the entity does not exist
    Update { key: Key, entity: Entity },
    /// Create or replace
    Upsert { key: Key, entity: Entity },
    Delete { key: Key },
}

impl Mutation {
    pub fn insert<R: Record + ?Sized>(key: &Key, record: &R) -> Result<Mutation> {
        Ok(Mutation::Insert {
            key: key.clone(),
            entity: codec::encode(Some(key), record)?,
        })
    }

    pub fn update<R: Record + ?Sized>(key: &Key, record: &R) -> Result<Mutation> {
        Ok(Mutation::Update {
            key: key.clone(),
            entity: codec::encode(Some(key), record)?,
        })
    }

    pub fn upsert<R: Record + ?Sized>(key: &Key, record: &R) -> Result<Mutation> {
        Ok(Mutation::Upsert {
            key: key.clone(),
            entity: codec::encode(Some(key), record)?,
        })
    }

    pub fn delete(key: &Key) -> Mutation {
        Mutation::Delete { key: key.clone() }
    }

    pub fn key(&self) -> &Key {
        match self {
            Mutation::Insert { key, .. }
            | Mutation::Update { key, .. }
            | Mutation::Upsert { key, .. }
            | Mutation::Delete { key } => key,
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Mutation::Insert { entity, .. }
            | Mutation::Update { entity, .. }
            | Mutation::Upsert { entity, .. } => Some(entity),
            Mutation::Delete { .. } => None,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Mutation::Insert { .. } => "insert",
            Mutation::Update { .. } => "update",
            Mutation::Upsert { .. } => "upsert",
            Mutation::Delete { .. } => "delete",
        }
    }

    /// Inserts and upserts may carry an incomplete key (the backend
    /// allocates one); updates and deletes need a complete key.
    pub fn validate(&self) -> Result<()> {
        match self {
            Mutation::Insert { key, .. } | Mutation::Upsert { key, .. } => key.validate(),
            Mutation::Update { key, .. } | Mutation::Delete { key } => {
                key.validate_complete().map_err(|e| match e {
                    Error::InvalidKey(msg) => {
                        Error::InvalidKey(format!("{} requires a complete key: {}", self.op_name(), msg))
                    }
                    other => other,
                })
            }
        }
    }

    /// Point the mutation at an allocated key, keeping the stored entity's
    /// key in step.
    pub fn set_key(&mut self, new_key: Key) {
        match self {
            Mutation::Insert { key, entity }
            | Mutation::Update { key, entity }
            | Mutation::Upsert { key, entity } => {
                entity.key = Some(new_key.clone());
                *key = new_key;
            }
            Mutation::Delete { key } => *key = new_key,
        }
    }
}
