//! Client-side pipeline
//!
//! Holds everything the server must never see: the embedding plaintext, the
//! secret key side of the codec, and decrypted similarity scores. Vectors are
//! hashed with the server-distributed planes and encrypted locally; search
//! responses are decrypted and ranked here.

pub mod embedder;

use std::env;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::handlers::{
    AddEmbeddingResponse, InitResponse, SearchApiResponse,
};
use crate::he::{EncryptedScalar, HeCodec, MockHeCodec};
use crate::lsh::LshPlanes;
use crate::types::{ClientStats, LshSettings, SearchStats, Vector};
use crate::{Error, Result};

pub use embedder::PseudoEmbedder;

pub const ENV_SERVER_URL: &str = "SECURE_SEARCH_SERVER_URL";
pub const ENV_API_KEY: &str = "SECURE_SEARCH_API_KEY";
pub const ENV_API_KEY_FALLBACK: &str = "DB_SERVER_API_KEY";
pub const ENV_STRIP_PLAINTEXT: &str = "SECURE_SEARCH_STRIP_PLAINTEXT_METADATA";
pub const ENV_THOUSANDS: &str = "SECURE_SEARCH_THOUSANDS";

/// Corpus scale (in thousands of documents) for large-corpus runs; 0 unset.
pub fn corpus_thousands() -> usize {
    env::var(ENV_THOUSANDS)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

/// A decrypted, ranked search result
#[derive(Debug, Clone)]
pub struct RankedMatch {
    pub embedding_id: Uuid,
    pub similarity: f32,
    pub metadata: Option<Value>,
}

/// Server-assigned identity after `initialize`
#[derive(Debug, Clone)]
struct Session {
    client_id: Uuid,
    planes: LshPlanes,
    lsh: LshSettings,
}

pub struct ClientPipeline {
    http: reqwest::Client,
    server_url: String,
    api_key: String,
    strip_plaintext_metadata: bool,
    codec: Arc<dyn HeCodec>,
    embedder: PseudoEmbedder,
    session: Option<Session>,
}

impl ClientPipeline {
    pub fn new(server_url: &str, api_key: &str, dim: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            strip_plaintext_metadata: false,
            codec: Arc::new(MockHeCodec::default()),
            embedder: PseudoEmbedder::new(dim),
            session: None,
        }
    }

    /// Build a pipeline from the standard environment variables.
    pub fn from_env(dim: u32) -> Result<Self> {
        let server_url = env::var(ENV_SERVER_URL)
            .map_err(|_| Error::validation(format!("{} is not set", ENV_SERVER_URL)))?;
        let api_key = env::var(ENV_API_KEY)
            .or_else(|_| env::var(ENV_API_KEY_FALLBACK))
            .map_err(|_| {
                Error::unauthenticated(format!(
                    "neither {} nor {} is set",
                    ENV_API_KEY, ENV_API_KEY_FALLBACK
                ))
            })?;

        let strip = env::var(ENV_STRIP_PLAINTEXT)
            .map(|raw| matches!(raw.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self::new(&server_url, &api_key, dim).with_strip_plaintext(strip))
    }

    pub fn with_strip_plaintext(mut self, strip: bool) -> Self {
        self.strip_plaintext_metadata = strip;
        self
    }

    pub fn client_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.client_id)
    }

    /// LSH shape confirmed by the server at initialization.
    pub fn lsh_config(&self) -> Option<LshSettings> {
        self.session.as_ref().map(|s| s.lsh)
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::validation("client not initialized; call initialize() first"))
    }

    /// Establish the HE context and receive the LSH planes from the server.
    pub async fn initialize(&mut self, lsh: LshSettings) -> Result<Uuid> {
        let body = json!({
            "context_params": {
                "public_key": BASE64.encode(b"mock-public-key"),
                "scheme": "CKKS",
                "poly_modulus_degree": 8192u32,
                "scale": 1u64 << 40,
            },
            "embedding_dim": self.embedder.dim(),
            "lsh_config": lsh,
        });

        let response = self.post("/initialize", &body).await?;
        let init: InitResponse = parse_response(response).await?;

        let planes = LshPlanes::from_base64(&init.random_planes)?;
        if planes.dim() != self.embedder.dim() {
            return Err(Error::validation(format!(
                "server planes have dimension {}, embedder uses {}",
                planes.dim(),
                self.embedder.dim()
            )));
        }

        tracing::info!(client_id = %init.client_id, "initialized with server planes");

        let client_id = init.client_id;
        self.session = Some(Session {
            client_id,
            planes,
            lsh: init.lsh_config,
        });
        Ok(client_id)
    }

    /// Build the `add_embedding` payload without sending it.
    ///
    /// Split out so the privacy invariant can be asserted against the exact
    /// bytes that would go on the wire.
    pub fn build_add_payload(
        &self,
        text: &str,
        metadata: Option<Value>,
        external_id: Option<&str>,
    ) -> Result<Value> {
        let session = self.session()?;

        let vector = self.embedder.embed(text);
        let hashes = session.planes.hash_vector(&vector)?;
        let ciphertext = self.codec.encode_vector(&vector)?;

        let mut metadata = match metadata {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => {
                return Err(Error::validation(format!(
                    "metadata must be a JSON object, got {}",
                    other
                )))
            }
            None => json!({}),
        };

        let fields = metadata.as_object_mut().expect("object checked above");
        if self.strip_plaintext_metadata {
            fields.remove("text");
        } else {
            fields.insert("text".to_string(), json!(text));
        }
        fields.insert("text_length".to_string(), json!(text.len()));
        fields.insert(
            "word_count".to_string(),
            json!(text.split_whitespace().count()),
        );

        if self.strip_plaintext_metadata {
            ensure_no_plaintext(&metadata)?;
        }

        Ok(json!({
            "client_id": session.client_id,
            "encrypted_embedding": ciphertext.to_base64(),
            "lsh_hashes": hashes,
            "metadata": metadata,
            "external_id": external_id,
        }))
    }

    /// Encrypt, hash, and upload one text.
    pub async fn add_embedding(
        &self,
        text: &str,
        metadata: Option<Value>,
        external_id: Option<&str>,
    ) -> Result<Uuid> {
        let payload = self.build_add_payload(text, metadata, external_id)?;
        let response = self.post("/add_embedding", &payload).await?;
        let added: AddEmbeddingResponse = parse_response(response).await?;
        Ok(added.embedding_id)
    }

    /// Search by text: hash + encrypt the query, decrypt and rank the scores.
    pub async fn search(
        &self,
        query_text: &str,
        top_k: u32,
        rerank_candidates: u32,
    ) -> Result<(Vec<RankedMatch>, SearchStats)> {
        let vector = self.embedder.embed(query_text);
        self.search_vector(&vector, top_k, rerank_candidates).await
    }

    /// Search by raw vector.
    pub async fn search_vector(
        &self,
        vector: &Vector,
        top_k: u32,
        rerank_candidates: u32,
    ) -> Result<(Vec<RankedMatch>, SearchStats)> {
        let session = self.session()?;

        let hashes = session.planes.hash_vector(vector)?;
        let encrypted_query = self.codec.encode_query(vector)?;

        let body = json!({
            "client_id": session.client_id,
            "encrypted_query": encrypted_query.to_base64(),
            "lsh_hashes": hashes,
            "top_k": top_k,
            "rerank_candidates": rerank_candidates.max(top_k).max(1),
        });

        let response = self.post("/search", &body).await?;
        let search: SearchApiResponse = parse_response(response).await?;

        // Only the key holder can rank: decrypt, sort desc, apply top_k
        let mut matches = Vec::with_capacity(search.results.len());
        for result in search.results {
            let scalar = EncryptedScalar::from_base64(&result.encrypted_similarity)?;
            matches.push(RankedMatch {
                embedding_id: result.embedding_id,
                similarity: self.codec.decrypt_scalar(&scalar)?,
                metadata: result.metadata,
            });
        }
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k as usize);

        let stats = SearchStats {
            candidates_found: search.candidates_found,
            candidates_checked: search.candidates_checked,
            results_returned: matches.len() as u64,
            lsh_time_ms: search.lsh_time_ms,
            he_compute_time_ms: search.he_compute_time_ms,
            total_time_ms: search.search_time_ms,
        };

        Ok((matches, stats))
    }

    /// Soft-delete one embedding on the server.
    pub async fn delete_embedding(&self, embedding_id: Uuid) -> Result<()> {
        self.session()?;
        let url = format!("{}/embeddings/{}", self.server_url, embedding_id);
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let _: Value = parse_response(response).await?;
        Ok(())
    }

    /// Fetch usage counters.
    pub async fn stats(&self) -> Result<ClientStats> {
        let session = self.session()?;
        let url = format!("{}/stats/{}", self.server_url, session.client_id);
        let response = self.http.get(url).bearer_auth(&self.api_key).send().await?;
        parse_response(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.server_url, path);
        Ok(self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?)
    }
}

/// Fail closed: no `text` key may survive anywhere in outbound metadata.
fn ensure_no_plaintext(metadata: &Value) -> Result<()> {
    match metadata {
        Value::Object(map) => {
            if map.contains_key("text") {
                return Err(Error::PlaintextLeak(
                    "metadata still contains a 'text' field".to_string(),
                ));
            }
            map.values().try_for_each(ensure_no_plaintext)
        }
        Value::Array(items) => items.iter().try_for_each(ensure_no_plaintext),
        _ => Ok(()),
    }
}

/// Decode a server response, reconstructing typed errors from error bodies.
async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body: Value = response.json().await.unwrap_or_else(|_| json!({}));
    let detail = body
        .get("detail")
        .and_then(Value::as_str)
        .unwrap_or("unknown server error")
        .to_string();
    let kind = body.get("kind").and_then(Value::as_str).unwrap_or("");

    Err(Error::from_kind(kind, format!("{} ({})", detail, status)))
}

/// CLI exit code for an error: 2 auth, 3 network, 4 server-side.
pub fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::Unauthenticated(_) => 2,
        Error::Transport(_) => 3,
        _ => 4,
    }
}
