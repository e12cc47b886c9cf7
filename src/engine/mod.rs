//! Search orchestration
//!
//! A search runs in three bounded stages: LSH candidate filtering, a bulk
//! ciphertext fetch, and homomorphic scoring of at most `rerank_candidates`
//! ciphertexts. The server cannot order encrypted scores, so every checked
//! candidate is returned with its encrypted similarity and the key-holding
//! client ranks after decryption.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::db::Database;
use crate::he::{CodecRegistry, EncryptedVector};
use crate::index::LshIndex;
use crate::store::EmbeddingStore;
use crate::types::{ClientRecord, EncryptedMatch, SearchStats};
use crate::{Error, Result};

/// Parameters of one search call, already authenticated.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub encrypted_query: String,
    pub lsh_hashes: Vec<u32>,
    pub top_k: u32,
    pub rerank_candidates: u32,
}

#[derive(Clone)]
pub struct SearchEngine {
    db: Database,
    store: EmbeddingStore,
    index: LshIndex,
    codecs: Arc<CodecRegistry>,
}

impl SearchEngine {
    pub fn new(
        db: Database,
        store: EmbeddingStore,
        index: LshIndex,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            db,
            store,
            index,
            codecs,
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// Run one search end to end.
    ///
    /// CPU-bound; callers run this on the blocking pool under the request's
    /// wall-clock budget. An empty candidate set is a normal result, not an
    /// error; an undecodable stored ciphertext aborts with
    /// `CorruptCiphertext`.
    pub fn search(
        &self,
        client: &ClientRecord,
        request: &SearchParams,
    ) -> Result<(Vec<EncryptedMatch>, SearchStats)> {
        let start = Instant::now();

        if request.top_k == 0 {
            return Err(Error::validation("top_k must be at least 1"));
        }
        if request.lsh_hashes.len() != client.lsh.num_tables as usize {
            return Err(Error::validation(format!(
                "expected {} query hashes, got {}",
                client.lsh.num_tables,
                request.lsh_hashes.len()
            )));
        }

        // The candidate ceiling always wins over what the client asked for
        let ceiling = client.lsh.num_candidates.max(1);
        let floor = request.top_k.min(ceiling);
        let rerank = request.rerank_candidates.clamp(floor, ceiling) as usize;

        let query = EncryptedVector::from_base64(&request.encrypted_query)?;
        let codec = self.codecs.resolve(&client.he_scheme)?;

        // Stage 1: LSH filter
        let lsh_start = Instant::now();
        let candidates = self
            .index
            .candidates(client.client_id, &request.lsh_hashes, rerank)?;
        let lsh_time_ms = lsh_start.elapsed().as_millis() as u64;

        if candidates.truncated_buckets > 0 {
            tracing::warn!(
                client_id = %client.client_id,
                truncated_buckets = candidates.truncated_buckets,
                "oversized LSH buckets were subsampled"
            );
        }

        // Stage 2: bulk ciphertext fetch, aligned with the ranking
        let fetched = self.store.fetch_many(client.client_id, &candidates.ids)?;

        // Stage 3: homomorphic scoring; ordering is preserved so the
        // response keeps the match-count ranking
        let he_start = Instant::now();
        let mut results = Vec::with_capacity(fetched.len());
        for item in fetched {
            let stored = EncryptedVector::from_bytes(item.ciphertext);
            let score = codec.inner_product(&query, &stored)?;
            results.push(EncryptedMatch {
                embedding_id: item.embedding_id,
                encrypted_similarity: score.to_base64(),
                metadata: item.metadata,
            });
        }
        let he_compute_time_ms = he_start.elapsed().as_millis() as u64;

        let stats = SearchStats {
            candidates_found: candidates.matched,
            candidates_checked: results.len() as u64,
            results_returned: results.len() as u64,
            lsh_time_ms,
            he_compute_time_ms,
            total_time_ms: start.elapsed().as_millis() as u64,
        };

        self.log_search(client.client_id, request, &stats)?;

        tracing::debug!(
            client_id = %client.client_id,
            candidates_found = stats.candidates_found,
            candidates_checked = stats.candidates_checked,
            total_time_ms = stats.total_time_ms,
            "search complete"
        );

        Ok((results, stats))
    }

    /// Append to the analytics log and bump the client's search counter.
    fn log_search(
        &self,
        client_id: Uuid,
        request: &SearchParams,
        stats: &SearchStats,
    ) -> Result<()> {
        self.db.with_retry(|conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();

            tx.execute(
                "INSERT INTO search_log (search_id, client_id, top_k, rerank_candidates,
                                         candidates_found, candidates_checked, results_returned,
                                         lsh_time_ms, he_compute_time_ms, total_time_ms,
                                         created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    Uuid::new_v4().to_string(),
                    client_id.to_string(),
                    request.top_k,
                    request.rerank_candidates,
                    stats.candidates_found as i64,
                    stats.candidates_checked as i64,
                    stats.results_returned as i64,
                    stats.lsh_time_ms as i64,
                    stats.he_compute_time_ms as i64,
                    stats.total_time_ms as i64,
                    now,
                ],
            )?;

            tx.execute(
                "UPDATE clients
                 SET total_searches = total_searches + 1, last_active_at = ?2
                 WHERE client_id = ?1",
                params![client_id.to_string(), now],
            )?;

            tx.commit()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;
    use crate::he::{HeCodec, MockHeCodec};
    use crate::lsh::LshPlanes;
    use crate::registry::ClientRegistry;
    use crate::store::NewEmbedding;
    use crate::types::{HeContextParams, LshSettings};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: ClientRegistry,
        engine: SearchEngine,
        client: ClientRecord,
        planes: Arc<LshPlanes>,
        codec: MockHeCodec,
    }

    fn fixture(lsh: LshSettings, dim: u32) -> Fixture {
        let (_dir, db) = test_database();
        let registry = ClientRegistry::new(db.clone(), "test-secret".to_string(), 1000, 8);
        let store = EmbeddingStore::new(db.clone());
        let index = LshIndex::new(db.clone(), 512);
        let engine = SearchEngine::new(db, store, index, Arc::new(CodecRegistry::default()));

        let params = HeContextParams {
            public_key: BASE64.encode(b"pk"),
            scheme: "CKKS".to_string(),
            poly_modulus_degree: 8192,
            scale: 1 << 40,
        };
        let (client, planes) = registry.initialize("bearer", &params, dim, &lsh).unwrap();

        Fixture {
            _dir,
            registry,
            engine,
            client,
            planes,
            codec: MockHeCodec::default(),
        }
    }

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }

    fn seeded_vector(dim: u32, tag: u64) -> Vec<f32> {
        unit((0..dim)
            .map(|i| ((i as u64 * 31 + tag * 17) % 23) as f32 - 11.0)
            .collect())
    }

    fn upload(fixture: &Fixture, vector: &[f32], label: &str) -> Uuid {
        let ciphertext = fixture.codec.encode_vector(vector).unwrap().into_bytes();
        let hashes = fixture.planes.hash_vector(vector).unwrap();
        fixture
            .engine
            .store()
            .insert(&NewEmbedding {
                client_id: fixture.client.client_id,
                ciphertext,
                lsh_hashes: hashes,
                metadata: Some(serde_json::json!({ "label": label })),
                external_id: None,
            })
            .unwrap()
    }

    fn search_params(fixture: &Fixture, query: &[f32], top_k: u32, rerank: u32) -> SearchParams {
        SearchParams {
            encrypted_query: fixture.codec.encode_query(query).unwrap().to_base64(),
            lsh_hashes: fixture.planes.hash_vector(query).unwrap(),
            top_k,
            rerank_candidates: rerank,
        }
    }

    #[test]
    fn finds_and_scores_exact_match() {
        let lsh = LshSettings {
            num_tables: 8,
            hash_size: 8,
            num_candidates: 50,
        };
        let fixture = fixture(lsh, 32);

        let target = seeded_vector(32, 1);
        let target_id = upload(&fixture, &target, "target");
        for tag in 2..10 {
            upload(&fixture, &seeded_vector(32, tag), "noise");
        }

        let (results, stats) = fixture
            .engine
            .search(&fixture.client, &search_params(&fixture, &target, 5, 20))
            .unwrap();

        assert!(stats.candidates_found >= 1);
        assert!(stats.candidates_checked <= 20);

        // Decrypt like the client would; the exact duplicate scores ~1.0
        let best = results
            .iter()
            .map(|m| {
                let scalar = crate::he::EncryptedScalar::from_base64(&m.encrypted_similarity)
                    .unwrap();
                (m.embedding_id, fixture.codec.decrypt_scalar(&scalar).unwrap())
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .unwrap();
        assert_eq!(best.0, target_id);
        assert!((best.1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn empty_candidate_set_is_not_an_error() {
        let fixture = fixture(LshSettings::default(), 16);

        let (results, stats) = fixture
            .engine
            .search(
                &fixture.client,
                &search_params(&fixture, &seeded_vector(16, 1), 5, 20),
            )
            .unwrap();

        assert!(results.is_empty());
        assert_eq!(stats.candidates_found, 0);
        assert_eq!(stats.candidates_checked, 0);
    }

    #[test]
    fn candidate_ceiling_bounds_results() {
        let lsh = LshSettings {
            num_tables: 4,
            hash_size: 8,
            num_candidates: 5,
        };
        let fixture = fixture(lsh, 16);

        let base = seeded_vector(16, 1);
        for _ in 0..20 {
            upload(&fixture, &base, "dup");
        }

        // rerank_candidates far above the configured ceiling
        let (results, stats) = fixture
            .engine
            .search(&fixture.client, &search_params(&fixture, &base, 3, 1000))
            .unwrap();

        assert!(results.len() <= 5);
        assert!(stats.candidates_checked <= 5);
    }

    #[test]
    fn soft_deleted_embedding_never_returned() {
        let lsh = LshSettings {
            num_tables: 8,
            hash_size: 8,
            num_candidates: 50,
        };
        let fixture = fixture(lsh, 32);

        let target = seeded_vector(32, 1);
        let target_id = upload(&fixture, &target, "target");
        fixture
            .engine
            .store()
            .soft_delete(fixture.client.client_id, target_id)
            .unwrap();

        let (results, _) = fixture
            .engine
            .search(&fixture.client, &search_params(&fixture, &target, 5, 20))
            .unwrap();
        assert!(results.iter().all(|m| m.embedding_id != target_id));
    }

    #[test]
    fn corrupt_stored_ciphertext_aborts() {
        let lsh = LshSettings {
            num_tables: 4,
            hash_size: 8,
            num_candidates: 10,
        };
        let fixture = fixture(lsh, 16);

        let vector = seeded_vector(16, 1);
        let hashes = fixture.planes.hash_vector(&vector).unwrap();
        fixture
            .engine
            .store()
            .insert(&NewEmbedding {
                client_id: fixture.client.client_id,
                ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
                lsh_hashes: hashes,
                metadata: None,
                external_id: None,
            })
            .unwrap();

        let err = fixture
            .engine
            .search(&fixture.client, &search_params(&fixture, &vector, 5, 10))
            .unwrap_err();
        assert!(matches!(err, Error::CorruptCiphertext(_)));
    }

    #[test]
    fn zero_top_k_rejected() {
        let fixture = fixture(LshSettings::default(), 16);
        let err = fixture
            .engine
            .search(
                &fixture.client,
                &search_params(&fixture, &seeded_vector(16, 1), 0, 10),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn search_counter_increments() {
        let fixture = fixture(LshSettings::default(), 16);

        fixture
            .engine
            .search(
                &fixture.client,
                &search_params(&fixture, &seeded_vector(16, 1), 5, 20),
            )
            .unwrap();

        let stats = fixture.registry.stats(fixture.client.client_id).unwrap();
        assert_eq!(stats.total_searches, 1);
    }
}
