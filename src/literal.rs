//! Canonical serialized form of objects and the bundles they travel in.
//!
//! A [`Literal`] is the canonical, hashable rendition of an object: its class
//! name, a value tree, and a typed dependency list. Nested objects are never
//! embedded; they are referenced by hash ([`Value::Ref`]) and declared in the
//! dependency list, either as `Subobject` (travels together with the literal)
//! or `Reference` (long-lived object the receiver is expected to hold, backed
//! by an ownership proof when omitted from a transfer).
//!
//! The canonical encoding is the postcard serialization of
//! `(class_name, value, dependencies)`; maps are ordered, so two peers
//! produce byte-identical canonical forms for equal values. The content hash
//! is blake3 over those bytes. Signatures sign the hash and are excluded from
//! the hashed region.

use std::collections::BTreeMap;

use bytes::Bytes;
use ed25519_dalek::Signature;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Errors produced while encoding, validating or bundling literals.
#[derive(Debug, thiserror::Error)]
pub enum LiteralError {
    /// The declared hash does not match the recomputed one.
    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch {
        /// Hash carried by the literal.
        declared: Hash,
        /// Hash recomputed from the canonical bytes.
        computed: Hash,
    },
    /// A root hash of a context has no literal in the bundle.
    #[error("root {0} missing from context")]
    MissingRoot(Hash),
    /// Canonical encoding failed.
    #[error(transparent)]
    Encode(#[from] postcard::Error),
}

/// The canonical payload tree of a literal.
///
/// Nested hashed objects appear as [`Value::Ref`]; the owning literal's
/// dependency list records how the reference is to be transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed map; ordering is part of the canonical form.
    Map(BTreeMap<String, Value>),
    /// Reference to another hashed object.
    Ref(Hash),
}

impl Value {
    /// Collect every [`Value::Ref`] in the tree, with the path that leads to it.
    pub fn refs(&self) -> Vec<(String, Hash)> {
        let mut out = Vec::new();
        self.collect_refs("", &mut out);
        out
    }

    fn collect_refs(&self, prefix: &str, out: &mut Vec<(String, Hash)>) {
        match self {
            Value::Ref(hash) => out.push((prefix.to_string(), *hash)),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_refs(&join(prefix, &i.to_string()), out);
                }
            }
            Value::Map(entries) => {
                for (key, item) in entries {
                    item.collect_refs(&join(prefix, key), out);
                }
            }
            _ => {}
        }
    }

    /// Look up a nested value by `/`-separated path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut cur = self;
        for seg in path.split('/') {
            cur = match cur {
                Value::Map(entries) => entries.get(seg)?,
                Value::List(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }
}

fn join(prefix: &str, seg: &str) -> String {
    if prefix.is_empty() {
        seg.to_string()
    } else {
        format!("{prefix}/{seg}")
    }
}

/// How a dependency travels when its owner is transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DepKind {
    /// Part of the owning object; its literal is bundled into the context.
    Subobject,
    /// Long-lived object referenced by hash; omitted from transfers and
    /// vouched for with an ownership proof instead.
    Reference,
}

/// A typed entry in a literal's dependency list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Hash of the referenced object.
    pub hash: Hash,
    /// Path in the value tree where the reference appears.
    pub path: String,
    /// Transfer behavior.
    pub kind: DepKind,
}

/// A signature binding a literal to an authoring identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralSignature {
    /// Hash of the author's identity literal.
    pub author: Hash,
    /// Ed25519 signature over the literal hash.
    pub signature: Signature,
}

/// Canonical serialized form of a hashed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Literal {
    /// Content hash of the canonical bytes.
    pub hash: Hash,
    /// Registered class name.
    pub class_name: String,
    /// Canonical payload.
    pub value: Value,
    /// Ordered dependency list; every entry's hash is reachable from `value`.
    pub dependencies: Vec<Dependency>,
    /// Signatures over `hash`. Excluded from the hashed region.
    pub signatures: Vec<LiteralSignature>,
}

impl Literal {
    /// Build a literal from its parts, deriving the dependency list from the
    /// value tree and computing the content hash.
    ///
    /// `kind_for` assigns a [`DepKind`] to each reference path.
    pub fn build(
        class_name: impl Into<String>,
        value: Value,
        kind_for: impl Fn(&str) -> DepKind,
    ) -> Result<Literal, LiteralError> {
        let class_name = class_name.into();
        let mut dependencies: Vec<Dependency> = value
            .refs()
            .into_iter()
            .map(|(path, hash)| Dependency {
                hash,
                kind: kind_for(&path),
                path,
            })
            .collect();
        dependencies.sort_by(|a, b| (&a.path, a.hash).cmp(&(&b.path, b.hash)));
        let hash = Self::compute_hash(&class_name, &value, &dependencies)?;
        Ok(Literal {
            hash,
            class_name,
            value,
            dependencies,
            signatures: Vec::new(),
        })
    }

    /// Build a literal whose references are all [`DepKind::Reference`].
    pub fn build_refs_only(
        class_name: impl Into<String>,
        value: Value,
    ) -> Result<Literal, LiteralError> {
        Self::build(class_name, value, |_| DepKind::Reference)
    }

    /// The canonical bytes hashing operates on.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, LiteralError> {
        canonical_bytes(&self.class_name, &self.value, &self.dependencies)
    }

    fn compute_hash(
        class_name: &str,
        value: &Value,
        dependencies: &[Dependency],
    ) -> Result<Hash, LiteralError> {
        Ok(Hash::new(canonical_bytes(class_name, value, dependencies)?))
    }

    /// Check that the declared hash matches the canonical bytes.
    pub fn validate(&self) -> Result<(), LiteralError> {
        let computed = Self::compute_hash(&self.class_name, &self.value, &self.dependencies)?;
        if computed != self.hash {
            return Err(LiteralError::HashMismatch {
                declared: self.hash,
                computed,
            });
        }
        Ok(())
    }

    /// Look up a dependency entry by hash.
    pub fn dependency(&self, hash: &Hash) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.hash == *hash)
    }
}

fn canonical_bytes(
    class_name: &str,
    value: &Value,
    dependencies: &[Dependency],
) -> Result<Vec<u8>, LiteralError> {
    Ok(postcard::to_stdvec(&(class_name, value, dependencies))?)
}

/// A bundle of literals for a single transfer: one or more roots plus the
/// transitive dependencies that travel with them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralContext {
    /// The objects this context is about.
    pub root_hashes: Vec<Hash>,
    /// Literals keyed by hash; includes the roots and bundled dependencies.
    pub literals: BTreeMap<Hash, Literal>,
}

impl LiteralContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a literal; roots must be added through `push_root`.
    pub fn insert(&mut self, literal: Literal) {
        self.literals.insert(literal.hash, literal);
    }

    /// Add a root literal.
    pub fn push_root(&mut self, literal: Literal) {
        let hash = literal.hash;
        self.literals.insert(hash, literal);
        if !self.root_hashes.contains(&hash) {
            self.root_hashes.push(hash);
        }
    }

    /// Whether the bundle carries a literal for `hash`.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.literals.contains_key(hash)
    }

    /// Get a bundled literal.
    pub fn get(&self, hash: &Hash) -> Option<&Literal> {
        self.literals.get(hash)
    }

    /// Check every literal re-hashes to its key and every root is present.
    pub fn validate(&self) -> Result<(), LiteralError> {
        for (hash, literal) in &self.literals {
            literal.validate()?;
            if literal.hash != *hash {
                return Err(LiteralError::HashMismatch {
                    declared: *hash,
                    computed: literal.hash,
                });
            }
        }
        for root in &self.root_hashes {
            if !self.literals.contains_key(root) {
                return Err(LiteralError::MissingRoot(*root));
            }
        }
        Ok(())
    }

    /// Transitive dependencies of the roots that are absent from the bundle.
    ///
    /// For each missing hash, returns the chain of hashes from a root down to
    /// the literal that lists it (inclusive), suitable for extending a
    /// dependency chain in a follow-up request.
    pub fn missing_deps(&self) -> BTreeMap<Hash, Vec<Hash>> {
        let mut missing = BTreeMap::new();
        let mut visited = std::collections::BTreeSet::new();
        let mut queue: std::collections::VecDeque<(Hash, Vec<Hash>)> = self
            .root_hashes
            .iter()
            .map(|root| (*root, vec![*root]))
            .collect();
        while let Some((hash, chain)) = queue.pop_front() {
            if !visited.insert(hash) {
                continue;
            }
            let Some(literal) = self.literals.get(&hash) else {
                continue;
            };
            for dep in &literal.dependencies {
                if self.literals.contains_key(&dep.hash) {
                    let mut next = chain.clone();
                    next.push(dep.hash);
                    queue.push_back((dep.hash, next));
                } else {
                    missing.entry(dep.hash).or_insert_with(|| chain.clone());
                }
            }
        }
        missing
    }
}

/// A receiver-chosen, per-request secret for ownership proofs.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSecret([u8; 32]);

impl ProofSecret {
    /// Draw a fresh secret.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        Self(bytes)
    }

    /// The secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ProofSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProofSecret(..)")
    }
}

/// Proof that the sender possesses an omitted dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipProof {
    /// Hash of the omitted object.
    pub hash: Hash,
    /// Keyed hash of the object's canonical bytes under the receiver's secret.
    pub proof: Hash,
}

impl OwnershipProof {
    /// Compute the proof for a literal under `secret`.
    pub fn compute(literal: &Literal, secret: &ProofSecret) -> Result<Self, LiteralError> {
        Ok(OwnershipProof {
            hash: literal.hash,
            proof: Hash::keyed(literal.canonical_bytes()?, secret.as_bytes()),
        })
    }

    /// Check the proof against a locally held literal.
    pub fn matches(&self, local: &Literal, secret: &ProofSecret) -> bool {
        local.hash == self.hash
            && local
                .canonical_bytes()
                .map(|bytes| Hash::keyed(bytes, secret.as_bytes()) == self.proof)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_value() -> Value {
        let mut map = BTreeMap::new();
        map.insert("name".into(), Value::Text("thing".into()));
        map.insert("count".into(), Value::Int(3));
        map.insert("child".into(), Value::Ref(Hash::new(b"child")));
        Value::Map(map)
    }

    #[test]
    fn literal_hash_is_stable() {
        let a = Literal::build_refs_only("test", sample_value()).unwrap();
        let b = Literal::build_refs_only("test", sample_value()).unwrap();
        assert_eq!(a.hash, b.hash);
        a.validate().unwrap();
    }

    #[test]
    fn tampered_literal_fails_validation() {
        let mut literal = Literal::build_refs_only("test", sample_value()).unwrap();
        literal.value = Value::Int(42);
        assert!(matches!(
            literal.validate(),
            Err(LiteralError::HashMismatch { .. })
        ));
    }

    #[test]
    fn refs_carry_paths() {
        let literal = Literal::build_refs_only("test", sample_value()).unwrap();
        assert_eq!(literal.dependencies.len(), 1);
        assert_eq!(literal.dependencies[0].path, "child");
        assert_eq!(literal.dependencies[0].hash, Hash::new(b"child"));
    }

    #[test]
    fn context_missing_deps_reports_chain() {
        let inner = Literal::build_refs_only("test", Value::Ref(Hash::new(b"leaf"))).unwrap();
        let outer = Literal::build("test", Value::Ref(inner.hash), |_| DepKind::Subobject).unwrap();
        let mut ctx = LiteralContext::new();
        let outer_hash = outer.hash;
        let inner_hash = inner.hash;
        ctx.push_root(outer);
        ctx.insert(inner);
        ctx.validate().unwrap();

        let missing = ctx.missing_deps();
        assert_eq!(missing.len(), 1);
        let chain = missing.get(&Hash::new(b"leaf")).unwrap();
        assert_eq!(chain, &vec![outer_hash, inner_hash]);
    }

    #[test]
    fn context_rejects_absent_root() {
        let mut ctx = LiteralContext::new();
        ctx.root_hashes.push(Hash::new(b"nope"));
        assert!(matches!(
            ctx.validate(),
            Err(LiteralError::MissingRoot(_))
        ));
    }

    #[test]
    fn ownership_proof_roundtrip() {
        let literal = Literal::build_refs_only("test", sample_value()).unwrap();
        let mut rng = rand::thread_rng();
        let secret = ProofSecret::random(&mut rng);
        let proof = OwnershipProof::compute(&literal, &secret).unwrap();
        assert!(proof.matches(&literal, &secret));

        let other_secret = ProofSecret::random(&mut rng);
        assert!(!proof.matches(&literal, &other_secret));
    }
}
