//! The mutable-object / operation model.
//!
//! A mutable object is identified by the hash of its creation literal; its
//! semantic state is the fold of its accepted mutation ops. Ops form a DAG
//! through `prev_ops` (causal order on the same target) and may cite ops
//! through `causal_ops` (semantic justification; the cited op can live on
//! the same target or on another object). Undo ops are ordinary ops by
//! construction; they travel through the DAG like any other and their
//! cascade semantics live above this crate.

use std::collections::{BTreeMap, BTreeSet};

use ed25519_dalek::Signature;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::keys::{Author, Identity, IDENTITY_CLASS};
use crate::literal::{DepKind, Literal, LiteralError, LiteralSignature, Value};

/// Class name of mutable-object creation literals.
pub const MUTABLE_CLASS: &str = "mutable";
/// Class name of terminal-ops state literals.
pub const TERMINAL_OPS_STATE_CLASS: &str = "terminal-ops-state";

/// Errors from the object model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A literal of an unexpected class was supplied.
    #[error("expected class {expected}, found {found}")]
    WrongClass {
        /// Class the caller required.
        expected: &'static str,
        /// Class carried by the literal.
        found: String,
    },
    /// The literal's value tree does not have the required shape.
    #[error("malformed literal: {0}")]
    Malformed(&'static str),
    /// The class name is not registered, or registered with another kind.
    #[error("class {0:?} not registered as a mutation op")]
    UnregisteredClass(String),
    /// Re-registration of a class name with a conflicting kind.
    #[error("class {0:?} already registered with a different kind")]
    ClassConflict(String),
    /// An op operation that requires a signature found none.
    #[error("mutation op is not signed")]
    MissingSignature,
    /// Signature verification failed.
    #[error("bad op signature")]
    BadSignature(#[from] ed25519_dalek::SignatureError),
    /// The signing author does not match the op's author reference.
    #[error("author mismatch")]
    AuthorMismatch,
    /// Literal encoding failed.
    #[error(transparent)]
    Literal(#[from] LiteralError),
}

/// What a registered class name rehydrates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// A mutation op; the codec exposes `target`, `prev_ops`, `causal_ops`.
    MutationOp,
    /// Plain hashed data.
    Data,
}

static REGISTRY: Lazy<RwLock<BTreeMap<String, ClassKind>>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    map.insert(IDENTITY_CLASS.to_string(), ClassKind::Data);
    map.insert(MUTABLE_CLASS.to_string(), ClassKind::Data);
    map.insert(TERMINAL_OPS_STATE_CLASS.to_string(), ClassKind::Data);
    RwLock::new(map)
});

/// Register a class name. Idempotent for the same kind; registering an
/// existing name with a different kind is an error, and de-registration
/// does not exist.
pub fn register_class(name: impl Into<String>, kind: ClassKind) -> Result<(), ModelError> {
    let name = name.into();
    let mut registry = REGISTRY.write();
    match registry.get(&name) {
        Some(existing) if *existing != kind => Err(ModelError::ClassConflict(name)),
        Some(_) => Ok(()),
        None => {
            registry.insert(name, kind);
            Ok(())
        }
    }
}

/// Look up the kind a class name was registered with.
pub fn class_kind(name: &str) -> Option<ClassKind> {
    REGISTRY.read().get(name).copied()
}

/// The header the store needs to index an op without consulting the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpHeader {
    /// The op's class name.
    pub class_name: String,
    /// The mutable object the op applies to.
    pub target: Hash,
    /// Previously observed ops on the same target.
    pub prev_ops: BTreeSet<Hash>,
}

/// A signed, hashed mutation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOp {
    /// Registered op class name.
    pub class_name: String,
    /// Reference to the mutable object this op applies to.
    pub target: Hash,
    /// Hashes of previously observed ops on the same target; empty for an
    /// initial op. Defines the causal order of the op DAG.
    pub prev_ops: BTreeSet<Hash>,
    /// Ops whose validity justifies this one, on this target or any other
    /// mutable object. Justification only; DAG order comes from `prev_ops`.
    pub causal_ops: BTreeSet<Hash>,
    /// Hash of the author's identity literal.
    pub author: Hash,
    /// Class-specific payload. References inside the payload travel with
    /// the op as subobjects.
    pub payload: Value,
    /// Signature over the op hash, by the author's key.
    pub signature: Option<Signature>,
}

impl MutationOp {
    /// Start a new unsigned op.
    pub fn new(
        class_name: impl Into<String>,
        target: Hash,
        author: Hash,
        payload: Value,
    ) -> Self {
        MutationOp {
            class_name: class_name.into(),
            target,
            prev_ops: BTreeSet::new(),
            causal_ops: BTreeSet::new(),
            author,
            payload,
            signature: None,
        }
    }

    /// Set the causal predecessors on the same target.
    pub fn with_prev_ops(mut self, prev_ops: impl IntoIterator<Item = Hash>) -> Self {
        self.prev_ops = prev_ops.into_iter().collect();
        self
    }

    /// Set the causal justifications.
    pub fn with_causal_ops(mut self, causal_ops: impl IntoIterator<Item = Hash>) -> Self {
        self.causal_ops = causal_ops.into_iter().collect();
        self
    }

    fn build_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("author".to_string(), Value::Ref(self.author));
        map.insert(
            "causalOps".to_string(),
            Value::List(self.causal_ops.iter().map(|h| Value::Ref(*h)).collect()),
        );
        map.insert("payload".to_string(), self.payload.clone());
        map.insert(
            "prevOps".to_string(),
            Value::List(self.prev_ops.iter().map(|h| Value::Ref(*h)).collect()),
        );
        map.insert("target".to_string(), Value::Ref(self.target));
        Value::Map(map)
    }

    /// The canonical literal, carrying the signature if the op is signed.
    pub fn to_literal(&self) -> Result<Literal, ModelError> {
        if class_kind(&self.class_name) != Some(ClassKind::MutationOp) {
            return Err(ModelError::UnregisteredClass(self.class_name.clone()));
        }
        let mut literal = Literal::build(self.class_name.as_str(), self.build_value(), |path| {
            if path.starts_with("payload") {
                DepKind::Subobject
            } else {
                DepKind::Reference
            }
        })?;
        if let Some(signature) = self.signature.clone() {
            literal.signatures.push(LiteralSignature {
                author: self.author,
                signature,
            });
        }
        Ok(literal)
    }

    /// The op's content hash. Independent of whether the op is signed.
    pub fn hash(&self) -> Result<Hash, ModelError> {
        let unsigned = MutationOp {
            signature: None,
            ..self.clone()
        };
        Ok(unsigned.to_literal()?.hash)
    }

    /// Sign the op. The author keypair must match the op's author reference.
    pub fn sign(&mut self, author: &Author) -> Result<(), ModelError> {
        if author.identity().hash()? != self.author {
            return Err(ModelError::AuthorMismatch);
        }
        let hash = self.hash()?;
        self.signature = Some(author.sign(hash.as_bytes()));
        Ok(())
    }

    /// Verify the signature against the author's identity.
    pub fn verify(&self, identity: &Identity) -> Result<(), ModelError> {
        if identity.hash()? != self.author {
            return Err(ModelError::AuthorMismatch);
        }
        let signature = self.signature.clone().ok_or(ModelError::MissingSignature)?;
        let hash = self.hash()?;
        identity.verify(hash.as_bytes(), &signature)?;
        Ok(())
    }

    /// Structural rehydration from a literal.
    ///
    /// Requires the class to be registered as a mutation op; never trusts
    /// anything about the class beyond that.
    pub fn from_literal(literal: &Literal) -> Result<Self, ModelError> {
        if class_kind(&literal.class_name) != Some(ClassKind::MutationOp) {
            return Err(ModelError::UnregisteredClass(literal.class_name.clone()));
        }
        let Some(Value::Ref(target)) = literal.value.get("target") else {
            return Err(ModelError::Malformed("target must be a reference"));
        };
        let Some(Value::Ref(author)) = literal.value.get("author") else {
            return Err(ModelError::Malformed("author must be a reference"));
        };
        let prev_ops = ref_list(&literal.value, "prevOps")
            .ok_or(ModelError::Malformed("prevOps must be a list of references"))?;
        let causal_ops = ref_list(&literal.value, "causalOps").ok_or(ModelError::Malformed(
            "causalOps must be a list of references",
        ))?;
        let payload = literal
            .value
            .get("payload")
            .ok_or(ModelError::Malformed("payload missing"))?
            .clone();
        let signature = literal
            .signatures
            .iter()
            .find(|s| s.author == *author)
            .map(|s| s.signature.clone());
        Ok(MutationOp {
            class_name: literal.class_name.clone(),
            target: *target,
            prev_ops,
            causal_ops,
            author: *author,
            payload,
            signature,
        })
    }

    /// The indexing header.
    pub fn header(&self) -> OpHeader {
        OpHeader {
            class_name: self.class_name.clone(),
            target: self.target,
            prev_ops: self.prev_ops.clone(),
        }
    }
}

fn ref_list(value: &Value, field: &str) -> Option<BTreeSet<Hash>> {
    let Some(Value::List(items)) = value.get(field) else {
        return None;
    };
    let mut out = BTreeSet::new();
    for item in items {
        let Value::Ref(hash) = item else {
            return None;
        };
        out.insert(*hash);
    }
    Some(out)
}

/// A hashed object reconstructed from its literal.
///
/// Produced by [`crate::store::Store::load`], which consults the class
/// registry to pick the shape. Registered data classes without a built-in
/// shape come back as their raw literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    /// An author identity.
    Identity(Identity),
    /// A mutation op.
    MutationOp(MutationOp),
    /// A mutable object descriptor.
    Mutable(MutableObject),
    /// A terminal-ops state.
    TerminalOpsState(TerminalOpsState),
    /// A registered data class without a built-in shape.
    Data(Literal),
}

impl Object {
    /// Rehydrate from a literal, dispatching on the registered class.
    pub fn from_literal(literal: &Literal) -> anyhow::Result<Object> {
        match literal.class_name.as_str() {
            IDENTITY_CLASS => Ok(Object::Identity(Identity::from_literal(literal)?)),
            MUTABLE_CLASS => Ok(Object::Mutable(MutableObject::from_literal(literal)?)),
            TERMINAL_OPS_STATE_CLASS => Ok(Object::TerminalOpsState(
                TerminalOpsState::from_literal(literal)?,
            )),
            other => match class_kind(other) {
                Some(ClassKind::MutationOp) => {
                    Ok(Object::MutationOp(MutationOp::from_literal(literal)?))
                }
                Some(ClassKind::Data) => Ok(Object::Data(literal.clone())),
                None => anyhow::bail!("class {other:?} is not registered"),
            },
        }
    }

    /// The canonical literal; inverse of [`Object::from_literal`] on hash.
    pub fn to_literal(&self) -> anyhow::Result<Literal> {
        match self {
            Object::Identity(identity) => Ok(identity.to_literal()?),
            Object::MutationOp(op) => Ok(op.to_literal()?),
            Object::Mutable(obj) => Ok(obj.to_literal()?),
            Object::TerminalOpsState(state) => Ok(state.to_literal()?),
            Object::Data(literal) => Ok(literal.clone()),
        }
    }
}

/// Descriptor of a mutable object: its creation literal declares the set of
/// mutation op classes it accepts. The literal's hash is the object identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableObject {
    accepted_classes: BTreeSet<String>,
    seed: [u8; 32],
}

impl MutableObject {
    /// Create a new object accepting the given op classes. A random seed
    /// makes the identity unique.
    pub fn new<R: Rng + ?Sized>(
        accepted_classes: impl IntoIterator<Item = String>,
        rng: &mut R,
    ) -> Self {
        let mut seed = [0u8; 32];
        rng.fill(&mut seed);
        MutableObject {
            accepted_classes: accepted_classes.into_iter().collect(),
            seed,
        }
    }

    /// The op classes this object accepts.
    pub fn accepted_classes(&self) -> &BTreeSet<String> {
        &self.accepted_classes
    }

    /// The creation literal.
    pub fn to_literal(&self) -> Result<Literal, LiteralError> {
        let mut map = BTreeMap::new();
        map.insert(
            "acceptedClasses".to_string(),
            Value::List(
                self.accepted_classes
                    .iter()
                    .map(|c| Value::Text(c.clone()))
                    .collect(),
            ),
        );
        map.insert(
            "seed".to_string(),
            Value::Bytes(self.seed.to_vec().into()),
        );
        Literal::build_refs_only(MUTABLE_CLASS, Value::Map(map))
    }

    /// The object identity.
    pub fn hash(&self) -> Result<Hash, LiteralError> {
        Ok(self.to_literal()?.hash)
    }

    /// Rehydrate from a creation literal.
    pub fn from_literal(literal: &Literal) -> Result<Self, ModelError> {
        if literal.class_name != MUTABLE_CLASS {
            return Err(ModelError::WrongClass {
                expected: MUTABLE_CLASS,
                found: literal.class_name.clone(),
            });
        }
        let Some(Value::List(classes)) = literal.value.get("acceptedClasses") else {
            return Err(ModelError::Malformed("acceptedClasses must be a list"));
        };
        let mut accepted_classes = BTreeSet::new();
        for class in classes {
            let Value::Text(name) = class else {
                return Err(ModelError::Malformed("accepted class must be text"));
            };
            accepted_classes.insert(name.clone());
        }
        let Some(Value::Bytes(seed_bytes)) = literal.value.get("seed") else {
            return Err(ModelError::Malformed("seed missing"));
        };
        let seed: [u8; 32] = seed_bytes
            .as_ref()
            .try_into()
            .map_err(|_| ModelError::Malformed("seed must be 32 bytes"))?;
        Ok(MutableObject {
            accepted_classes,
            seed,
        })
    }
}

/// The current frontier of a mutable object's op DAG, as a hashed object.
/// Its literal hash is the state hash the gossip layer diffuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOpsState {
    /// The mutable object this state describes.
    pub mutable_obj: Hash,
    /// Ops with no persisted successor.
    pub terminal_ops: BTreeSet<Hash>,
}

impl TerminalOpsState {
    /// Build a state from a terminal op set.
    pub fn new(mutable_obj: Hash, terminal_ops: impl IntoIterator<Item = Hash>) -> Self {
        TerminalOpsState {
            mutable_obj,
            terminal_ops: terminal_ops.into_iter().collect(),
        }
    }

    /// The canonical literal.
    pub fn to_literal(&self) -> Result<Literal, LiteralError> {
        let mut map = BTreeMap::new();
        map.insert("mutableObj".to_string(), Value::Ref(self.mutable_obj));
        map.insert(
            "terminalOps".to_string(),
            Value::List(self.terminal_ops.iter().map(|h| Value::Ref(*h)).collect()),
        );
        Literal::build_refs_only(TERMINAL_OPS_STATE_CLASS, Value::Map(map))
    }

    /// The state hash.
    pub fn hash(&self) -> Result<Hash, LiteralError> {
        Ok(self.to_literal()?.hash)
    }

    /// Rehydrate from a literal.
    pub fn from_literal(literal: &Literal) -> Result<Self, ModelError> {
        if literal.class_name != TERMINAL_OPS_STATE_CLASS {
            return Err(ModelError::WrongClass {
                expected: TERMINAL_OPS_STATE_CLASS,
                found: literal.class_name.clone(),
            });
        }
        let Some(Value::Ref(mutable_obj)) = literal.value.get("mutableObj") else {
            return Err(ModelError::Malformed("mutableObj must be a reference"));
        };
        let terminal_ops = ref_list(&literal.value, "terminalOps").ok_or(
            ModelError::Malformed("terminalOps must be a list of references"),
        )?;
        Ok(TerminalOpsState {
            mutable_obj: *mutable_obj,
            terminal_ops,
        })
    }
}
