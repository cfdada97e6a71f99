//! In memory storage for literals and op indexes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::hash::Hash;
use crate::literal::Literal;
use crate::model::{OpHeader, TerminalOpsState};
use crate::store::{SaveOutcome, Store, StoreError};

use super::StoreEvent;

/// In-memory [`Store`]. `Clone` hands out another handle to the same
/// backing maps.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    literals: BTreeMap<Hash, Literal>,
    /// `(first path segment, referenced hash) -> referring hashes`,
    /// in persistence order.
    refs: BTreeMap<(String, Hash), Vec<Hash>>,
    /// Per-object terminal op sets, maintained incrementally.
    terminal: BTreeMap<Hash, BTreeSet<Hash>>,
    /// Which target each persisted op applies to.
    op_targets: BTreeMap<Hash, Hash>,
    subscribers: Vec<flume::Sender<StoreEvent>>,
}

impl MemStore {
    /// Fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted literals.
    pub fn len(&self) -> usize {
        self.inner.read().literals.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().literals.is_empty()
    }
}

fn field_of(path: &str) -> String {
    match path.split_once('/') {
        Some((field, _)) => field.to_string(),
        None => path.to_string(),
    }
}

impl Store for MemStore {
    fn save(
        &self,
        literal: &Literal,
        header: Option<&OpHeader>,
    ) -> Result<SaveOutcome, StoreError> {
        literal.validate().map_err(|_| StoreError::HashMismatch)?;

        let mut inner = self.inner.write();
        let already_present = inner.literals.contains_key(&literal.hash);
        // a literal may land as plain data first (e.g. fetched as a causal
        // dependency) and only later be saved with its op header; the header
        // upgrade still needs indexing
        let needs_indexing = header.is_some() && !inner.op_targets.contains_key(&literal.hash);
        if already_present && !needs_indexing {
            return Ok(SaveOutcome::AlreadyPresent);
        }

        if let Some(header) = header {
            if literal.signatures.is_empty() {
                return Err(StoreError::MissingSignature);
            }
            if header.class_name != literal.class_name {
                return Err(StoreError::InvalidHeader);
            }
            let target_matches = literal
                .dependencies
                .iter()
                .any(|d| d.path == "target" && d.hash == header.target);
            if !target_matches {
                return Err(StoreError::InvalidHeader);
            }
            for prev in &header.prev_ops {
                if inner.op_targets.get(prev) != Some(&header.target) {
                    return Err(StoreError::MissingDependency(*prev));
                }
            }
        }

        if !already_present {
            for dep in &literal.dependencies {
                inner
                    .refs
                    .entry((field_of(&dep.path), dep.hash))
                    .or_default()
                    .push(literal.hash);
            }
        }
        // on a header upgrade this refreshes a copy stored before signing
        inner.literals.insert(literal.hash, literal.clone());

        if let Some(header) = header {
            let op = literal.hash;
            inner.op_targets.insert(op, header.target);
            let terminal = inner.terminal.entry(header.target).or_default();
            terminal.insert(op);
            for prev in &header.prev_ops {
                terminal.remove(prev);
            }
            let event = StoreEvent::OpSaved {
                target: header.target,
                op,
            };
            inner
                .subscribers
                .retain(|tx| tx.send(event.clone()).is_ok());
        }

        Ok(SaveOutcome::Saved)
    }

    fn load_literal(&self, hash: &Hash) -> Result<Option<Literal>> {
        Ok(self.inner.read().literals.get(hash).cloned())
    }

    fn contains(&self, hash: &Hash) -> Result<bool> {
        Ok(self.inner.read().literals.contains_key(hash))
    }

    fn terminal_ops(&self, obj: &Hash) -> Result<Option<TerminalOpsState>> {
        let inner = self.inner.read();
        Ok(inner
            .terminal
            .get(obj)
            .map(|ops| TerminalOpsState::new(*obj, ops.iter().copied())))
    }

    fn referrers(&self, field: &str, hash: &Hash) -> Result<Vec<Hash>> {
        let inner = self.inner.read();
        Ok(inner
            .refs
            .get(&(field.to_string(), *hash))
            .cloned()
            .unwrap_or_default())
    }

    fn subscribe(&self) -> flume::Receiver<StoreEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.write().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Author;
    use crate::literal::Value;
    use crate::model::{register_class, ClassKind, MutableObject, MutationOp, Object};
    use rand::rngs::OsRng;

    fn signed_op(
        author: &Author,
        target: Hash,
        payload: &str,
        prev: impl IntoIterator<Item = Hash>,
    ) -> MutationOp {
        register_class("test/append", ClassKind::MutationOp).unwrap();
        let mut op = MutationOp::new(
            "test/append",
            target,
            author.identity().hash().unwrap(),
            Value::Text(payload.into()),
        )
        .with_prev_ops(prev);
        op.sign(author).unwrap();
        op
    }

    #[test]
    fn save_is_idempotent() {
        let store = MemStore::new();
        let author = Author::new(&mut OsRng);
        let literal = author.identity().to_literal().unwrap();
        assert_eq!(store.save(&literal, None).unwrap(), SaveOutcome::Saved);
        assert_eq!(
            store.save(&literal, None).unwrap(),
            SaveOutcome::AlreadyPresent
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn op_save_requires_prev_ops_present() {
        let store = MemStore::new();
        let author = Author::new(&mut OsRng);
        let obj = MutableObject::new(["test/append".to_string()], &mut rand::thread_rng());
        let target = obj.hash().unwrap();

        let first = signed_op(&author, target, "a", []);
        let first_hash = first.hash().unwrap();
        let second = signed_op(&author, target, "b", [first_hash]);

        let err = store
            .save(&second.to_literal().unwrap(), Some(&second.header()))
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingDependency(h) if h == first_hash));

        store
            .save(&first.to_literal().unwrap(), Some(&first.header()))
            .unwrap();
        store
            .save(&second.to_literal().unwrap(), Some(&second.header()))
            .unwrap();
    }

    #[test]
    fn op_saved_as_data_is_indexed_on_header_upgrade() {
        let store = MemStore::new();
        let author = Author::new(&mut OsRng);
        let obj = MutableObject::new(["test/append".to_string()], &mut rand::thread_rng());
        let target = obj.hash().unwrap();
        let op = signed_op(&author, target, "a", []);
        let literal = op.to_literal().unwrap();

        // lands as plain data first, e.g. as a causal dependency
        assert_eq!(store.save(&literal, None).unwrap(), SaveOutcome::Saved);
        assert!(store.terminal_ops(&target).unwrap().is_none());

        // the header upgrade indexes it as an op
        assert_eq!(
            store.save(&literal, Some(&op.header())).unwrap(),
            SaveOutcome::Saved
        );
        assert_eq!(
            store.terminal_ops(&target).unwrap().unwrap().terminal_ops,
            [op.hash().unwrap()].into_iter().collect()
        );
        assert_eq!(
            store.save(&literal, Some(&op.header())).unwrap(),
            SaveOutcome::AlreadyPresent
        );
    }

    #[test]
    fn terminal_ops_track_the_frontier() {
        let store = MemStore::new();
        let author = Author::new(&mut OsRng);
        let obj = MutableObject::new(["test/append".to_string()], &mut rand::thread_rng());
        let target = obj.hash().unwrap();

        let a = signed_op(&author, target, "a", []);
        let a_hash = a.hash().unwrap();
        store
            .save(&a.to_literal().unwrap(), Some(&a.header()))
            .unwrap();
        let state = store.terminal_ops(&target).unwrap().unwrap();
        assert_eq!(state.terminal_ops, [a_hash].into_iter().collect());

        let b = signed_op(&author, target, "b", [a_hash]);
        let c = signed_op(&author, target, "c", [a_hash]);
        store
            .save(&b.to_literal().unwrap(), Some(&b.header()))
            .unwrap();
        store
            .save(&c.to_literal().unwrap(), Some(&c.header()))
            .unwrap();

        let state = store.terminal_ops(&target).unwrap().unwrap();
        assert_eq!(
            state.terminal_ops,
            [b.hash().unwrap(), c.hash().unwrap()].into_iter().collect()
        );
    }

    #[test]
    fn subscribers_see_each_op_once() {
        let store = MemStore::new();
        let rx1 = store.subscribe();
        let rx2 = store.subscribe();

        let author = Author::new(&mut OsRng);
        let obj = MutableObject::new(["test/append".to_string()], &mut rand::thread_rng());
        let target = obj.hash().unwrap();
        let op = signed_op(&author, target, "a", []);
        store
            .save(&op.to_literal().unwrap(), Some(&op.header()))
            .unwrap();

        let expected = StoreEvent::OpSaved {
            target,
            op: op.hash().unwrap(),
        };
        assert_eq!(rx1.try_recv().unwrap(), expected);
        assert_eq!(rx2.try_recv().unwrap(), expected);
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn load_reconstructs_typed_objects() {
        let store = MemStore::new();
        let author = Author::new(&mut OsRng);
        let identity = author.identity();
        store.save(&identity.to_literal().unwrap(), None).unwrap();
        let obj = MutableObject::new(["test/append".to_string()], &mut rand::thread_rng());
        store.save(&obj.to_literal().unwrap(), None).unwrap();
        let target = obj.hash().unwrap();
        let op = signed_op(&author, target, "a", []);
        store
            .save(&op.to_literal().unwrap(), Some(&op.header()))
            .unwrap();

        match store.load(&identity.hash().unwrap()).unwrap().unwrap() {
            Object::Identity(loaded) => assert_eq!(loaded, identity),
            other => panic!("unexpected object: {other:?}"),
        }
        match store.load(&target).unwrap().unwrap() {
            Object::Mutable(loaded) => assert_eq!(loaded, obj),
            other => panic!("unexpected object: {other:?}"),
        }

        // materialize then literalize is identity on the hash
        let loaded = store.load(&op.hash().unwrap()).unwrap().unwrap();
        assert_eq!(loaded.to_literal().unwrap().hash, op.hash().unwrap());
        match loaded {
            Object::MutationOp(loaded_op) => assert_eq!(loaded_op, op),
            other => panic!("unexpected object: {other:?}"),
        }

        assert!(store.load(&Hash::new(b"absent")).unwrap().is_none());
    }

    #[test]
    fn load_requires_subobject_deps() {
        let store = MemStore::new();
        let author = Author::new(&mut OsRng);
        store
            .save(&author.identity().to_literal().unwrap(), None)
            .unwrap();
        let obj = MutableObject::new(["test/append".to_string()], &mut rand::thread_rng());
        store.save(&obj.to_literal().unwrap(), None).unwrap();
        let target = obj.hash().unwrap();

        // payload references a subobject that was never persisted
        register_class("test/append", ClassKind::MutationOp).unwrap();
        let mut op = MutationOp::new(
            "test/append",
            target,
            author.identity().hash().unwrap(),
            Value::Ref(Hash::new(b"ghost")),
        );
        op.sign(&author).unwrap();
        store
            .save(&op.to_literal().unwrap(), Some(&op.header()))
            .unwrap();

        assert!(store.load_literal(&op.hash().unwrap()).unwrap().is_some());
        assert!(store.load(&op.hash().unwrap()).is_err());
    }

    #[test]
    fn referrers_index_by_target() {
        let store = MemStore::new();
        let author = Author::new(&mut OsRng);
        let obj = MutableObject::new(["test/append".to_string()], &mut rand::thread_rng());
        let target = obj.hash().unwrap();

        let a = signed_op(&author, target, "a", []);
        let b = signed_op(&author, target, "b", [a.hash().unwrap()]);
        store
            .save(&a.to_literal().unwrap(), Some(&a.header()))
            .unwrap();
        store
            .save(&b.to_literal().unwrap(), Some(&b.header()))
            .unwrap();

        let ops = store.referrers("target", &target).unwrap();
        assert_eq!(ops, vec![a.hash().unwrap(), b.hash().unwrap()]);
    }
}
