//! Abstraction over the available storage solutions.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::hash::Hash;
use crate::literal::{DepKind, Literal};
use crate::model::{Object, OpHeader, TerminalOpsState};

pub mod memory;

/// Outcome of a save; saving the same hash twice is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The literal was persisted.
    Saved,
    /// The literal was already present; nothing changed.
    AlreadyPresent,
}

/// Validation failures on save.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The literal's declared hash does not recompute.
    #[error("literal hash does not recompute")]
    HashMismatch,
    /// An op literal was supplied without any signature.
    #[error("op literal carries no signature")]
    MissingSignature,
    /// An op's `prev_ops` entry is not persisted against the same target.
    #[error("missing dependency {0} for op persistence")]
    MissingDependency(Hash),
    /// The supplied op header does not match the literal.
    #[error("op header does not match literal")]
    InvalidHeader,
}

/// Notification that an op landed in the store.
///
/// Every subscriber channel receives every event exactly once; sibling
/// consumers sharing the backend each get their own channel, which is the
/// in-process analog of a cross-process broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A new op targeting `target` was persisted.
    OpSaved {
        /// The mutable object the op applies to.
        target: Hash,
        /// The op's hash.
        op: Hash,
    },
}

/// Content-addressed literal storage with reference indexing.
pub trait Store: std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Persist a literal, idempotent by hash.
    ///
    /// Ops pass their [`OpHeader`]; the store validates signatures and the
    /// presence of every `prev_ops` hash against the same target, maintains
    /// the terminal-ops set incrementally, and notifies subscribers. A
    /// literal that was first saved as plain data is indexed as an op when
    /// it is saved again with its header.
    fn save(&self, literal: &Literal, header: Option<&OpHeader>)
        -> Result<SaveOutcome, StoreError>;

    /// Load a literal by hash.
    fn load_literal(&self, hash: &Hash) -> Result<Option<Literal>>;

    /// Reconstruct the hashed object stored under `hash`.
    ///
    /// Dispatches on the literal's registered class and requires every
    /// transitive subobject dependency to be persisted. Reference
    /// dependencies stay hashes and are resolved by further lookups, never
    /// by embedding.
    fn load(&self, hash: &Hash) -> Result<Option<Object>> {
        let Some(literal) = self.load_literal(hash)? else {
            return Ok(None);
        };
        let mut visited = BTreeSet::new();
        let mut queue = vec![literal.clone()];
        while let Some(current) = queue.pop() {
            if !visited.insert(current.hash) {
                continue;
            }
            for dep in &current.dependencies {
                if dep.kind != DepKind::Subobject {
                    continue;
                }
                match self.load_literal(&dep.hash)? {
                    Some(sub) => queue.push(sub),
                    None => anyhow::bail!("missing subobject {} under {hash}", dep.hash),
                }
            }
        }
        Ok(Some(Object::from_literal(&literal)?))
    }

    /// Whether a literal with this hash is persisted.
    fn contains(&self, hash: &Hash) -> Result<bool>;

    /// The terminal-ops state of a mutable object, if any op ever landed.
    fn terminal_ops(&self, obj: &Hash) -> Result<Option<TerminalOpsState>>;

    /// Hashes of persisted literals whose dependency at `field` references
    /// `hash`, in persistence order.
    fn referrers(&self, field: &str, hash: &Hash) -> Result<Vec<Hash>>;

    /// Subscribe to op-arrival notifications.
    fn subscribe(&self) -> flume::Receiver<StoreEvent>;
}
