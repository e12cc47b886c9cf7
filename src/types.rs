//! Core types for secure-search

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Plaintext embedding vector (client-side only; never crosses the wire)
pub type Vector = Vec<f32>;

/// Supported polynomial modulus degrees for the CKKS-style context
pub const POLY_MODULUS_DEGREES: [u32; 4] = [4096, 8192, 16384, 32768];

/// LSH shape for a client: `num_tables` hash tables of `hash_size` bits each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LshSettings {
    pub num_tables: u32,
    pub hash_size: u32,
    pub num_candidates: u32,
}

impl Default for LshSettings {
    fn default() -> Self {
        Self {
            num_tables: 20,
            hash_size: 16,
            num_candidates: 100,
        }
    }
}

impl LshSettings {
    pub fn validate(&self) -> crate::Result<()> {
        if !(1..=50).contains(&self.num_tables) {
            return Err(crate::Error::validation(format!(
                "num_tables must be in [1, 50], got {}",
                self.num_tables
            )));
        }
        if !(8..=32).contains(&self.hash_size) {
            return Err(crate::Error::validation(format!(
                "hash_size must be in [8, 32], got {}",
                self.hash_size
            )));
        }
        if self.num_candidates == 0 {
            return Err(crate::Error::validation(
                "num_candidates must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// HE context descriptor supplied by the client at initialization.
///
/// The public key and scale are opaque to the engine; they are stored so a
/// hardware-backed codec can reconstruct its evaluation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeContextParams {
    /// Base64-encoded serialized public key
    pub public_key: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_poly_modulus_degree")]
    pub poly_modulus_degree: u32,
    #[serde(default = "default_scale")]
    pub scale: u64,
}

fn default_scheme() -> String {
    "CKKS".to_string()
}

fn default_poly_modulus_degree() -> u32 {
    8192
}

fn default_scale() -> u64 {
    1 << 40
}

impl HeContextParams {
    pub fn validate(&self) -> crate::Result<()> {
        if !POLY_MODULUS_DEGREES.contains(&self.poly_modulus_degree) {
            return Err(crate::Error::validation(format!(
                "poly_modulus_degree must be one of {:?}, got {}",
                POLY_MODULUS_DEGREES, self.poly_modulus_degree
            )));
        }
        Ok(())
    }
}

/// A registered client and its immutable search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: Uuid,
    pub client_name: String,
    pub api_key_hash: String,
    pub he_scheme: String,
    pub poly_modulus_degree: u32,
    pub scale: u64,
    pub public_key: Vec<u8>,
    pub embedding_dim: u32,
    pub lsh: LshSettings,
    pub max_embeddings: u64,
    pub total_embeddings: u64,
    pub total_searches: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub is_active: bool,
}

impl ClientRecord {
    /// True when `other` describes the same HE context and LSH shape.
    ///
    /// Re-initialization with a matching shape is idempotent; a mismatch
    /// while embeddings exist is a `ConfigConflict`.
    pub fn shape_matches(&self, params: &HeContextParams, dim: u32, lsh: &LshSettings) -> bool {
        self.he_scheme == params.scheme
            && self.poly_modulus_degree == params.poly_modulus_degree
            && self.scale == params.scale
            && self.embedding_dim == dim
            && self.lsh.num_tables == lsh.num_tables
            && self.lsh.hash_size == lsh.hash_size
    }
}

/// A stored encrypted embedding row
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub embedding_id: Uuid,
    pub client_id: Uuid,
    pub external_id: Option<String>,
    pub ciphertext: Vec<u8>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
}

/// Ciphertext + metadata pair returned by a bulk fetch
#[derive(Debug, Clone)]
pub struct FetchedEmbedding {
    pub embedding_id: Uuid,
    pub ciphertext: Vec<u8>,
    pub metadata: Option<serde_json::Value>,
}

/// Candidate selection output of the LSH index
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    /// Embedding IDs ranked by match count desc, created_at desc, id asc
    pub ids: Vec<Uuid>,
    /// Distinct embeddings that matched at least one bucket (pre-limit)
    pub matched: u64,
    /// Buckets that exceeded the fanout bound and were subsampled
    pub truncated_buckets: u32,
}

/// Per-search timing and cardinality report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStats {
    pub candidates_found: u64,
    pub candidates_checked: u64,
    pub results_returned: u64,
    pub lsh_time_ms: u64,
    pub he_compute_time_ms: u64,
    pub total_time_ms: u64,
}

/// One encrypted similarity result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMatch {
    pub embedding_id: Uuid,
    /// Base64-encoded encrypted inner product; only the client can decrypt
    pub encrypted_similarity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Counters exposed by `GET /stats/{client_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    pub client_id: Uuid,
    pub client_name: String,
    pub total_embeddings: u64,
    pub total_searches: u64,
    pub embedding_dim: u32,
    pub max_embeddings: u64,
    pub last_active_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
