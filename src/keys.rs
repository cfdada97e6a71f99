//! Keypairs and the identity objects that ops reference as their author.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::literal::{Literal, LiteralError, Value};

/// Class name of identity literals.
pub const IDENTITY_CLASS: &str = "identity";

/// A signing keypair. The private half never appears in literals.
#[derive(Clone, Serialize, Deserialize)]
pub struct Author {
    priv_key: SigningKey,
}

impl Author {
    /// Generate a fresh keypair.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let priv_key = SigningKey::generate(rng);
        Author { priv_key }
    }

    /// Rebuild from the secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Author {
            priv_key: SigningKey::from_bytes(bytes),
        }
    }

    /// The secret key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.priv_key.to_bytes()
    }

    /// The public identifier.
    pub fn id(&self) -> AuthorId {
        AuthorId(self.priv_key.verifying_key())
    }

    /// The identity object other peers see.
    pub fn identity(&self) -> Identity {
        Identity::new(self.id())
    }

    /// Sign a message.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.priv_key.sign(msg)
    }
}

impl Debug for Author {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Author({})", self.id())
    }
}

/// The public half of an [`Author`] keypair.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct AuthorId(VerifyingKey);

impl AuthorId {
    /// Verify a signature made by this author.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify_strict(msg, signature)
    }

    /// The public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Rebuild from public key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> anyhow::Result<Self> {
        Ok(AuthorId(VerifyingKey::from_bytes(bytes)?))
    }
}

impl Debug for AuthorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthorId({})", hex::encode(&self.0.as_bytes()[..5]))
    }
}

impl Display for AuthorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0.as_bytes()))
    }
}

/// A hashed object binding a public key to a stable identity hash.
///
/// Ops reference their author by the hash of this literal, so identities are
/// long-lived reference dependencies: they are omitted from transfers and
/// vouched for with ownership proofs once a peer holds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    key: AuthorId,
    info: BTreeMap<String, String>,
}

impl Identity {
    /// Identity with no extra info.
    pub fn new(key: AuthorId) -> Self {
        Identity {
            key,
            info: BTreeMap::new(),
        }
    }

    /// Attach free-form info (display name, role, ...). Part of the hash.
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    /// The public key this identity binds.
    pub fn author_id(&self) -> &AuthorId {
        &self.key
    }

    /// Verify a signature made by this identity's key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.key.verify(msg, signature)
    }

    /// The canonical literal.
    pub fn to_literal(&self) -> Result<Literal, LiteralError> {
        let mut map = BTreeMap::new();
        map.insert(
            "key".to_string(),
            Value::Bytes(self.key.as_bytes().to_vec().into()),
        );
        map.insert(
            "info".to_string(),
            Value::Map(
                self.info
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Text(v.clone())))
                    .collect(),
            ),
        );
        Literal::build_refs_only(IDENTITY_CLASS, Value::Map(map))
    }

    /// The identity hash ops carry in their `author` field.
    pub fn hash(&self) -> Result<Hash, LiteralError> {
        Ok(self.to_literal()?.hash)
    }

    /// Rehydrate from a literal.
    pub fn from_literal(literal: &Literal) -> anyhow::Result<Self> {
        anyhow::ensure!(
            literal.class_name == IDENTITY_CLASS,
            "not an identity literal: {}",
            literal.class_name
        );
        let Some(Value::Bytes(key_bytes)) = literal.value.get("key") else {
            anyhow::bail!("identity literal without key bytes");
        };
        let bytes: [u8; 32] = key_bytes
            .as_ref()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid identity key length"))?;
        let key = AuthorId::from_bytes(&bytes)?;
        let mut info = BTreeMap::new();
        if let Some(Value::Map(entries)) = literal.value.get("info") {
            for (k, v) in entries {
                if let Value::Text(text) = v {
                    info.insert(k.clone(), text.clone());
                }
            }
        }
        Ok(Identity { key, info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_literal_roundtrip() {
        let author = Author::new(&mut rand::rngs::OsRng);
        let identity = author.identity().with_info("name", "alice");
        let literal = identity.to_literal().unwrap();
        literal.validate().unwrap();

        let back = Identity::from_literal(&literal).unwrap();
        assert_eq!(identity, back);
        assert_eq!(back.to_literal().unwrap().hash, literal.hash);
    }

    #[test]
    fn identity_hash_depends_on_info() {
        let author = Author::new(&mut rand::rngs::OsRng);
        let plain = author.identity();
        let named = author.identity().with_info("name", "alice");
        assert_ne!(plain.hash().unwrap(), named.hash().unwrap());
    }

    #[test]
    fn signature_verifies() {
        let author = Author::new(&mut rand::rngs::OsRng);
        let sig = author.sign(b"message");
        author.id().verify(b"message", &sig).unwrap();
        assert!(author.id().verify(b"other", &sig).is_err());
    }
}
