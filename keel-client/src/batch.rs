/// Batch operations
///
/// Every batch call is index-aligned: item `i` of the input maps to slot `i`
/// of the output or of the returned `MultiError`. Lookups and deletes send
/// each distinct key once, however often it repeats in the input.

use crate::client::Client;
use keel_core::codec::{self, Record};
use keel_core::{
    CommitRequest, Context, Entity, Error, Key, LookupRequest, MultiError, Mutation, ReadOptions,
    Result, TransactionId,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Distinct keys of `keys`, plus the position of each input key among them.
pub(crate) fn dedup_keys(keys: &[Key]) -> (Vec<Key>, Vec<usize>) {
    let mut unique = Vec::with_capacity(keys.len());
    let mut index: HashMap<&Key, usize> = HashMap::with_capacity(keys.len());
    let positions = keys
        .iter()
        .map(|k| {
            *index.entry(k).or_insert_with(|| {
                unique.push(k.clone());
                unique.len() - 1
            })
        })
        .collect();
    (unique, positions)
}

/// Check each key is complete, collecting failures positionally.
pub(crate) fn check_complete(keys: &[Key]) -> Result<()> {
    let mut errs = MultiError::new(keys.len());
    for (i, key) in keys.iter().enumerate() {
        if let Err(e) = key.validate_complete() {
            errs.set(i, e);
        }
    }
    errs.into_result()
}

/// Decode looked-up entities into `dst`, one slot per key.
pub(crate) fn decode_into<R: Record>(found: Vec<Option<Entity>>, dst: &mut [R]) -> Result<()> {
    let mut errs = MultiError::new(dst.len());
    for (i, (entity, slot)) in found.into_iter().zip(dst.iter_mut()).enumerate() {
        match entity {
            Some(entity) => {
                if let Err(e) = codec::decode(&entity, slot) {
                    errs.set(i, e);
                }
            }
            None => errs.set(i, Error::NoSuchEntity),
        }
    }
    errs.into_result()
}

pub(crate) fn check_lengths(keys: usize, records: usize) -> Result<()> {
    if keys != records {
        return Err(Error::InvalidEntityType(format!(
            "{} keys but {} records",
            keys, records
        )));
    }
    Ok(())
}

impl Client {
    /// Fetch `keys`, returning an entity or `None` per input key.
    ///
    /// Splits the request into chunks of `max_lookup_keys` and asks again for
    /// deferred keys until every key is resolved.
    pub(crate) fn lookup(
        &self,
        ctx: &Context,
        keys: &[Key],
        read: ReadOptions,
    ) -> Result<Vec<Option<Entity>>> {
        let (unique, positions) = dedup_keys(keys);
        let mut found: HashMap<Key, Entity> = HashMap::with_capacity(unique.len());

        for chunk in unique.chunks(self.config().max_lookup_keys) {
            let mut pending = chunk.to_vec();
            let mut round = 0;
            while !pending.is_empty() {
                ctx.check()?;
                round += 1;
                let sent = pending.len();
                let resp = self.transport().lookup(
                    ctx,
                    LookupRequest {
                        keys: pending,
                        read: read.clone(),
                    },
                )?;
                if round > 1 || !resp.deferred.is_empty() {
                    debug!(
                        round,
                        found = resp.found.len(),
                        deferred = resp.deferred.len(),
                        "lookup chunk"
                    );
                }
                if resp.found.is_empty() && resp.missing.is_empty() && resp.deferred.len() >= sent {
                    warn!(round, deferred = sent, "lookup made no progress");
                    return Err(Error::Transport(format!(
                        "lookup deferred all {} keys without resolving any",
                        sent
                    )));
                }
                for entity in resp.found {
                    if let Some(key) = entity.key.clone() {
                        found.insert(key, entity);
                    }
                }
                pending = resp.deferred;
            }
        }

        Ok(positions
            .into_iter()
            .map(|i| found.get(&unique[i]).cloned())
            .collect())
    }

    /// Send `mutations` in one non-transactional or transactional commit,
    /// returning the final key of each.
    pub(crate) fn commit_mutations(
        &self,
        ctx: &Context,
        transaction: Option<TransactionId>,
        mutations: Vec<Mutation>,
    ) -> Result<Vec<Key>> {
        ctx.check()?;
        let expected = mutations.len();
        let resp = self.transport().commit(
            ctx,
            CommitRequest {
                transaction,
                mutations,
            },
        )?;
        if resp.mutation_results.len() != expected {
            return Err(Error::Transport(format!(
                "commit returned {} results for {} mutations",
                resp.mutation_results.len(),
                expected
            )));
        }
        debug!(
            mutations = expected,
            index_updates = resp.index_updates,
            "commit"
        );
        Ok(resp.mutation_results.into_iter().map(|r| r.key).collect())
    }

    /// Load each key into the matching slot of `dst`
    ///
    /// Missing entities fill their slot with `Error::NoSuchEntity`; decode
    /// problems fill theirs with the decode error. Other slots are loaded.
    pub fn get_multi<R: Record>(&self, ctx: &Context, keys: &[Key], dst: &mut [R]) -> Result<()> {
        check_lengths(keys.len(), dst.len())?;
        if keys.is_empty() {
            return Ok(());
        }
        check_complete(keys)?;
        let keys: Vec<Key> = keys.iter().map(|k| self.resolve_key(k)).collect();
        let found = self.lookup(ctx, &keys, self.read_options(false))?;
        decode_into(found, dst)
    }

    /// Store each record under the matching key, returning complete keys
    pub fn put_multi<R: Record>(&self, ctx: &Context, keys: &[Key], src: &[R]) -> Result<Vec<Key>> {
        check_lengths(keys.len(), src.len())?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut errs = MultiError::new(keys.len());
        let mut mutations = Vec::with_capacity(keys.len());
        for (i, (key, record)) in keys.iter().zip(src).enumerate() {
            let key = self.resolve_key(key);
            match key.validate().and_then(|_| Mutation::upsert(&key, record)) {
                Ok(m) => mutations.push(m),
                Err(e) => errs.set(i, e),
            }
        }
        errs.into_result()?;
        self.commit_mutations(ctx, None, mutations)
    }

    /// Delete the entities stored under `keys`
    pub fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        check_complete(keys)?;
        let resolved: Vec<Key> = keys.iter().map(|k| self.resolve_key(k)).collect();
        let (unique, _) = dedup_keys(&resolved);
        let mutations = unique.iter().map(Mutation::delete).collect();
        self.commit_mutations(ctx, None, mutations).map(|_| ())
    }

    /// Apply mutations atomically, returning each mutation's final key
    pub fn mutate(&self, ctx: &Context, mutations: Vec<Mutation>) -> Result<Vec<Key>> {
        if mutations.is_empty() {
            return Ok(Vec::new());
        }
        let mut errs = MultiError::new(mutations.len());
        let mut resolved = Vec::with_capacity(mutations.len());
        for (i, mut m) in mutations.into_iter().enumerate() {
            let key = self.resolve_key(m.key());
            m.set_key(key);
            if let Err(e) = m.validate() {
                errs.set(i, e);
            }
            resolved.push(m);
        }
        errs.into_result()?;
        self.commit_mutations(ctx, None, resolved)
    }

    /// Complete incomplete keys without storing anything
    pub fn allocate_ids(&self, ctx: &Context, keys: &[Key]) -> Result<Vec<Key>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut resolved = Vec::with_capacity(keys.len());
        for key in keys {
            key.validate()?;
            if key.is_complete() {
                return Err(Error::InvalidKey(format!(
                    "cannot allocate an id for complete key {}",
                    key
                )));
            }
            resolved.push(self.resolve_key(key));
        }
        ctx.check()?;
        let allocated = self.transport().allocate_ids(ctx, resolved)?;
        if allocated.len() != keys.len() {
            return Err(Error::Transport(format!(
                "allocated {} ids for {} keys",
                allocated.len(),
                keys.len()
            )));
        }
        Ok(allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ClientConfig;
    use keel_memory::MemoryDatastore;

    fn client_with(store: MemoryDatastore, max_lookup_keys: usize) -> Client {
        Client::new(
            store,
            ClientConfig::new()
                .with_project_id("test")
                .with_max_lookup_keys(max_lookup_keys),
        )
        .unwrap()
    }

    #[test]
    fn test_dedup_keys() {
        let a = Key::id_key("K", 1, None);
        let b = Key::id_key("K", 2, None);
        let (unique, positions) = dedup_keys(&[a.clone(), b.clone(), a.clone()]);
        assert_eq!(unique, vec![a, b]);
        assert_eq!(positions, vec![0, 1, 0]);
    }

    #[test]
    fn test_get_multi_positional_errors() {
        let client = client_with(MemoryDatastore::new(), 1000);
        let ctx = Context::background();
        let present = Key::name_key("X", "present", None);
        let absent = Key::name_key("X", "absent", None);
        client.put(&ctx, &present, &Entity::new().set("I", 1)).unwrap();

        let keys = vec![present.clone(), absent.clone(), present.clone(), absent];
        let mut dst = vec![Entity::new(); 4];
        let err = client.get_multi(&ctx, &keys, &mut dst).unwrap_err();
        let multi = err.as_multi().unwrap();
        assert!(multi.get(0).is_none());
        assert!(multi.get(1).unwrap().is_no_such_entity());
        assert!(multi.get(2).is_none());
        assert!(multi.get(3).unwrap().is_no_such_entity());
        assert_eq!(dst[2].get("I").and_then(|v| v.as_int()), Some(1));
    }

    #[test]
    fn test_lookup_chunks_and_deferred_keys() {
        let store = MemoryDatastore::new().with_lookup_batch(3);
        let client = client_with(store, 4);
        let ctx = Context::background();
        let keys: Vec<Key> = (1..=10).map(|i| Key::id_key("C", i, None)).collect();
        let records: Vec<Entity> = (1..=10).map(|i| Entity::new().set("N", i)).collect();
        client.put_multi(&ctx, &keys, &records).unwrap();

        let mut dst = vec![Entity::new(); 10];
        client.get_multi(&ctx, &keys, &mut dst).unwrap();
        for (i, e) in dst.iter().enumerate() {
            assert_eq!(e.get("N").and_then(|v| v.as_int()), Some(i as i64 + 1));
        }
    }

    #[test]
    fn test_length_mismatch() {
        let client = client_with(MemoryDatastore::new(), 1000);
        let ctx = Context::background();
        let keys = vec![Key::id_key("C", 1, None)];
        let err = client.get_multi(&ctx, &keys, &mut Vec::<Entity>::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidEntityType(_)));
        let err = client.put_multi::<Entity>(&ctx, &keys, &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidEntityType(_)));
    }

    #[test]
    fn test_invalid_keys_fail_before_rpc() {
        let client = client_with(MemoryDatastore::new(), 1000);
        let ctx = Context::background();
        let keys = vec![Key::id_key("C", 1, None), Key::incomplete("C", None)];
        let mut dst = vec![Entity::new(); 2];
        let err = client.get_multi(&ctx, &keys, &mut dst).unwrap_err();
        let multi = err.as_multi().unwrap();
        assert!(multi.get(0).is_none());
        assert!(matches!(multi.get(1), Some(Error::InvalidKey(_))));

        assert!(client.delete_multi(&ctx, &keys).is_err());
    }

    #[test]
    fn test_delete_multi_with_duplicates() {
        let client = client_with(MemoryDatastore::new(), 1000);
        let ctx = Context::background();
        let key = client
            .put(&ctx, &Key::incomplete("NilKey", None), &Entity::new())
            .unwrap();
        client.delete_multi(&ctx, &[key.clone(), key.clone()]).unwrap();
        let mut e = Entity::new();
        assert!(client.get(&ctx, &key, &mut e).unwrap_err().is_no_such_entity());
    }

    #[test]
    fn test_allocate_ids() {
        let client = client_with(MemoryDatastore::new(), 1000);
        let ctx = Context::background();
        let keys = client
            .allocate_ids(&ctx, &vec![Key::incomplete("Alloc", None); 5])
            .unwrap();
        assert_eq!(keys.len(), 5);
        assert!(keys.iter().all(|k| k.is_complete() && k.kind() == "Alloc"));
        assert!(client
            .allocate_ids(&ctx, &[Key::id_key("Alloc", 1, None)])
            .is_err());
    }
}
