//! Synchronization of mutable, content-addressed objects over an untrusted
//! peer mesh.
//!
//! A mutable object is identified by the hash of its creation literal; its
//! state is the fold of a DAG of signed [mutation ops](model::MutationOp)
//! linked by `prev_ops`. Peers diffuse per-agent state hashes through a
//! [gossip agent](proto::gossip) and reconcile individual object graphs with
//! a [terminal-ops sync agent](proto::sync) that fetches missing ops together
//! with just enough of their dependency chains. Transfers are safe against
//! arbitrary-object exfiltration (every request carries a dependency chain
//! rooted in an accepted op) and robust against out-of-order arrival
//! (partially arrived ops are buffered with bounded memory until their
//! dependencies land).
//!
//! The crate exposes a [generic storage interface](store::Store) with an
//! [in-memory implementation](store::memory::MemStore), a sans-IO
//! [protocol core](proto) driven by `InEvent`/`OutEvent`, and, behind the
//! `net` feature, a [tokio actor](net::Node) that runs a protocol pod
//! against a transport-supplied message channel. Transport and peer-group
//! membership stay external: the core sees peer-joined/peer-lost events and
//! emits messages addressed by an opaque [endpoint](proto::Endpoint) type.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod hash;
pub mod keys;
pub mod literal;
pub mod model;
#[cfg(feature = "net")]
pub mod net;
pub mod proto;
pub mod store;

pub use self::hash::Hash;
pub use self::keys::{Author, AuthorId, Identity};
pub use self::literal::{Literal, LiteralContext, OwnershipProof, ProofSecret, Value};
pub use self::model::{
    register_class, ClassKind, MutableObject, MutationOp, Object, OpHeader, TerminalOpsState,
};
pub use self::store::{memory::MemStore, SaveOutcome, Store, StoreError, StoreEvent};
