/// Transactions
///
/// A [`Transaction`] reads from the snapshot taken when it began and buffers
/// writes until [`Transaction::commit`]. Writes return a [`PendingKey`] that
/// the resulting [`Commit`] resolves to the stored key.

use crate::batch::{check_complete, check_lengths, decode_into};
use crate::client::Client;
use crate::iterator::QueryIter;
use keel_core::codec::Record;
use keel_core::{
    Context, Error, Key, MultiError, Mutation, Query, ReadOptions, Result, TransactionId,
    TransactionMode,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

/// Placeholder for the key of an entity written in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKey {
    txn: TransactionId,
    slot: usize,
}

/// Outcome of a committed transaction
#[derive(Debug, Clone)]
pub struct Commit {
    txn: TransactionId,
    keys: Vec<Key>,
}

impl Commit {
    /// Final key of a write made in this transaction; `None` for a pending
    /// key from another transaction.
    pub fn key(&self, pending: &PendingKey) -> Option<Key> {
        if pending.txn != self.txn {
            return None;
        }
        self.keys.get(pending.slot).cloned()
    }

    /// Keys of every buffered write, in buffer order
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }
}

/// An open transaction
pub struct Transaction {
    client: Client,
    ctx: Context,
    id: TransactionId,
    mode: TransactionMode,
    mutations: Vec<Mutation>,
    state: TxnState,
}

impl Transaction {
    pub(crate) fn new(client: Client, ctx: Context, id: TransactionId, mode: TransactionMode) -> Self {
        Self {
            client,
            ctx,
            id,
            mode,
            mutations: Vec::new(),
            state: TxnState::Active,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == TransactionMode::ReadOnly
    }

    fn check_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::TransactionFinished)
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_active()?;
        if self.is_read_only() {
            return Err(Error::ReadOnlyTransaction);
        }
        Ok(())
    }

    /// Buffer a mutation. A second write to the same complete key replaces
    /// the first and shares its slot.
    fn buffer(&mut self, mutation: Mutation) -> PendingKey {
        let existing = if mutation.key().is_complete() {
            self.mutations.iter().position(|m| m.key() == mutation.key())
        } else {
            None
        };
        let slot = match existing {
            Some(slot) => {
                self.mutations[slot] = mutation;
                slot
            }
            None => {
                self.mutations.push(mutation);
                self.mutations.len() - 1
            }
        };
        PendingKey {
            txn: self.id.clone(),
            slot,
        }
    }

    /// Read `key` from the transaction's snapshot. Buffered writes are not
    /// visible.
    pub fn get<R: Record>(&self, key: &Key, dst: &mut R) -> Result<()> {
        self.get_multi(std::slice::from_ref(key), std::slice::from_mut(dst))
            .map_err(|e| match e {
                Error::Multi(m) => m
                    .into_inner()
                    .into_iter()
                    .flatten()
                    .next()
                    .unwrap_or(Error::NoSuchEntity),
                other => other,
            })
    }

    pub fn get_multi<R: Record>(&self, keys: &[Key], dst: &mut [R]) -> Result<()> {
        self.check_active()?;
        check_lengths(keys.len(), dst.len())?;
        if keys.is_empty() {
            return Ok(());
        }
        check_complete(keys)?;
        let keys: Vec<Key> = keys.iter().map(|k| self.client.resolve_key(k)).collect();
        let found = self
            .client
            .lookup(&self.ctx, &keys, ReadOptions::Transaction(self.id.clone()))?;
        decode_into(found, dst)
    }

    /// Run a query inside this transaction
    pub fn run(&self, query: &Query) -> QueryIter {
        self.client.run(&self.ctx, &query.transaction(&self.id))
    }

    pub fn put<R: Record>(&mut self, key: &Key, src: &R) -> Result<PendingKey> {
        let mut pending = self.put_multi(std::slice::from_ref(key), std::slice::from_ref(src))?;
        pending
            .pop()
            .ok_or_else(|| Error::Transport("no pending key".to_string()))
    }

    pub fn put_multi<R: Record>(&mut self, keys: &[Key], src: &[R]) -> Result<Vec<PendingKey>> {
        self.check_writable()?;
        check_lengths(keys.len(), src.len())?;
        let mut errs = MultiError::new(keys.len());
        let mut mutations = Vec::with_capacity(keys.len());
        for (i, (key, record)) in keys.iter().zip(src).enumerate() {
            let key = self.client.resolve_key(key);
            match key.validate().and_then(|_| Mutation::upsert(&key, record)) {
                Ok(m) => mutations.push(m),
                Err(e) => errs.set(i, e),
            }
        }
        errs.into_result()?;
        Ok(mutations.into_iter().map(|m| self.buffer(m)).collect())
    }

    pub fn delete(&mut self, key: &Key) -> Result<()> {
        self.delete_multi(std::slice::from_ref(key))
    }

    pub fn delete_multi(&mut self, keys: &[Key]) -> Result<()> {
        self.check_writable()?;
        check_complete(keys)?;
        for key in keys {
            let key = self.client.resolve_key(key);
            self.buffer(Mutation::delete(&key));
        }
        Ok(())
    }

    /// Buffer mutations, returning one pending key per mutation in input
    /// order
    pub fn mutate(&mut self, mutations: Vec<Mutation>) -> Result<Vec<PendingKey>> {
        self.check_writable()?;
        let mut errs = MultiError::new(mutations.len());
        let mut resolved = Vec::with_capacity(mutations.len());
        for (i, mut m) in mutations.into_iter().enumerate() {
            let key = self.client.resolve_key(m.key());
            m.set_key(key);
            if let Err(e) = m.validate() {
                errs.set(i, e);
            }
            resolved.push(m);
        }
        errs.into_result()?;
        Ok(resolved.into_iter().map(|m| self.buffer(m)).collect())
    }

    /// Apply the buffered writes
    ///
    /// The transaction is finished afterwards whether or not the commit
    /// succeeded.
    pub fn commit(&mut self) -> Result<Commit> {
        self.check_active()?;
        self.state = TxnState::Committed;
        let mutations = std::mem::take(&mut self.mutations);
        debug!(txn = ?self.id, mutations = mutations.len(), "committing transaction");
        let keys = self
            .client
            .commit_mutations(&self.ctx, Some(self.id.clone()), mutations)?;
        Ok(Commit {
            txn: self.id.clone(),
            keys,
        })
    }

    /// Abandon the transaction and its buffered writes
    pub fn rollback(&mut self) -> Result<()> {
        self.check_active()?;
        self.state = TxnState::RolledBack;
        self.mutations.clear();
        debug!(txn = ?self.id, "rolling back transaction");
        self.ctx.check()?;
        self.client.transport().rollback(&self.ctx, &self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ClientConfig, Entity, TransactionOptions};
    use keel_memory::MemoryDatastore;

    fn client() -> Client {
        Client::new(MemoryDatastore::new(), ClientConfig::new().with_project_id("test")).unwrap()
    }

    #[test]
    fn test_pending_keys_resolve_in_order() {
        let client = client();
        let ctx = Context::background();
        let mut tx = client.new_transaction(&ctx, TransactionOptions::new()).unwrap();
        let named = Key::name_key("T", "named", None);
        let pending = tx
            .mutate(vec![
                Mutation::insert(&Key::incomplete("T", None), &Entity::new()).unwrap(),
                Mutation::upsert(&named, &Entity::new()).unwrap(),
            ])
            .unwrap();
        assert_eq!(pending.len(), 2);
        let commit = tx.commit().unwrap();
        assert!(commit.key(&pending[0]).unwrap().is_complete());
        assert_eq!(commit.key(&pending[1]), Some(named));
    }

    #[test]
    fn test_repeated_write_shares_slot() {
        let client = client();
        let ctx = Context::background();
        let key = Key::name_key("T", "a", None);
        let mut tx = client.new_transaction(&ctx, TransactionOptions::new()).unwrap();
        let first = tx.put(&key, &Entity::new().set("N", 1)).unwrap();
        let second = tx.put(&key, &Entity::new().set("N", 2)).unwrap();
        assert_eq!(first, second);
        tx.commit().unwrap();

        let mut got = Entity::new();
        client.get(&ctx, &key, &mut got).unwrap();
        assert_eq!(got.get("N").and_then(|v| v.as_int()), Some(2));
    }

    #[test]
    fn test_finished_transaction() {
        let client = client();
        let ctx = Context::background();
        let mut tx = client.new_transaction(&ctx, TransactionOptions::new()).unwrap();
        tx.rollback().unwrap();
        assert!(!tx.is_active());
        assert!(matches!(tx.commit(), Err(Error::TransactionFinished)));
        assert!(matches!(
            tx.put(&Key::name_key("T", "a", None), &Entity::new()),
            Err(Error::TransactionFinished)
        ));
        let mut e = Entity::new();
        assert!(matches!(
            tx.get(&Key::name_key("T", "a", None), &mut e),
            Err(Error::TransactionFinished)
        ));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let client = client();
        let ctx = Context::background();
        let mut tx = client
            .new_transaction(&ctx, TransactionOptions::new().read_only())
            .unwrap();
        let key = Key::name_key("T", "a", None);
        assert!(matches!(tx.put(&key, &Entity::new()), Err(Error::ReadOnlyTransaction)));
        assert!(matches!(tx.delete(&key), Err(Error::ReadOnlyTransaction)));
        assert!(tx.commit().is_ok());
    }

    #[test]
    fn test_commit_from_other_transaction() {
        let client = client();
        let ctx = Context::background();
        let mut a = client.new_transaction(&ctx, TransactionOptions::new()).unwrap();
        let mut b = client.new_transaction(&ctx, TransactionOptions::new()).unwrap();
        let pa = a.put(&Key::incomplete("T", None), &Entity::new()).unwrap();
        b.put(&Key::incomplete("T", None), &Entity::new()).unwrap();
        a.commit().unwrap();
        let commit_b = b.commit().unwrap();
        assert_eq!(commit_b.key(&pa), None);
    }
}
