//! Homomorphic codec capability
//!
//! The engine depends only on the `HeCodec` surface: encode vectors, compute
//! an encrypted inner product, move ciphertexts through base64. The concrete
//! scheme (CKKS via a hardware-backed library, or the deterministic mock) is
//! selected per client through the `CodecRegistry`.

pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::{Error, Result};

pub use mock::MockHeCodec;

/// Serialized encrypted vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedVector(Vec<u8>);

/// Serialized encrypted scalar (an inner-product result)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedScalar(Vec<u8>);

impl EncryptedVector {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        BASE64
            .decode(encoded)
            .map(Self)
            .map_err(|e| Error::corrupt(format!("invalid base64 ciphertext: {}", e)))
    }
}

impl EncryptedScalar {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        BASE64
            .decode(encoded)
            .map(Self)
            .map_err(|e| Error::corrupt(format!("invalid base64 scalar: {}", e)))
    }
}

/// Operations the search engine needs from an HE scheme.
///
/// `encode_*` and `decrypt_scalar` are client-side (they touch key material);
/// `inner_product` is the only server-side computation and never yields
/// plaintext. Implementations must satisfy
/// `decrypt(inner_product(encode(a), encode(b))) ≈ a · b`.
pub trait HeCodec: Send + Sync {
    /// Codec name used in registry routing and logs
    fn name(&self) -> &'static str;

    /// Encrypt a stored vector (client-side)
    fn encode_vector(&self, plain: &[f32]) -> Result<EncryptedVector>;

    /// Encrypt a query vector (client-side)
    fn encode_query(&self, plain: &[f32]) -> Result<EncryptedVector>;

    /// Homomorphic inner product of two encrypted vectors (server-side)
    fn inner_product(&self, a: &EncryptedVector, b: &EncryptedVector) -> Result<EncryptedScalar>;

    /// Recover the plaintext scalar (client-side, needs the secret key)
    fn decrypt_scalar(&self, enc: &EncryptedScalar) -> Result<f32>;
}

/// Process-wide codec routing table.
///
/// Scheme tags presented by clients resolve through `aliases` first, so a
/// deployment without the real CKKS library can explicitly route `CKKS` to
/// the deterministic mock.
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn HeCodec>>,
    aliases: HashMap<String, String>,
}

impl CodecRegistry {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        let mut codecs: HashMap<String, Arc<dyn HeCodec>> = HashMap::new();
        codecs.insert("mock".to_string(), Arc::new(MockHeCodec::default()));

        for (tag, target) in &aliases {
            if codecs.contains_key(&target.to_ascii_lowercase()) {
                tracing::info!(scheme = %tag, codec = %target, "HE scheme alias registered");
            } else {
                tracing::warn!(scheme = %tag, codec = %target, "alias targets unknown codec");
            }
        }

        Self { codecs, aliases }
    }

    /// Resolve a client's scheme tag to a codec.
    pub fn resolve(&self, scheme: &str) -> Result<Arc<dyn HeCodec>> {
        let key = self
            .aliases
            .get(scheme)
            .map(String::as_str)
            .unwrap_or(scheme)
            .to_ascii_lowercase();

        self.codecs.get(&key).cloned().ok_or_else(|| {
            Error::validation(format!("unsupported HE scheme '{}'", scheme))
        })
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert("CKKS".to_string(), "mock".to_string());
        Self::new(aliases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_aliases() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.resolve("CKKS").unwrap().name(), "mock");
        assert_eq!(registry.resolve("mock").unwrap().name(), "mock");
        assert_eq!(registry.resolve("MOCK").unwrap().name(), "mock");
        assert!(registry.resolve("BFV").is_err());
    }

    #[test]
    fn base64_round_trip() {
        let vector = EncryptedVector::from_bytes(vec![1, 2, 3, 255]);
        let restored = EncryptedVector::from_base64(&vector.to_base64()).unwrap();
        assert_eq!(vector, restored);

        assert!(EncryptedVector::from_base64("!!!not-base64!!!").is_err());
    }
}
