//! Client registry
//!
//! Owns the client lifecycle: initialization (idempotent per bearer token),
//! bearer authentication, counters, deactivation, and the in-process plane
//! cache. Planes are never persisted; they are regenerated from
//! `sha256(server_secret || client_id)` whenever they fall out of the cache.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::Database;
use crate::lsh::{plane_seed, LshPlanes};
use crate::types::{ClientRecord, ClientStats, HeContextParams, LshSettings};
use crate::{Error, Result};

/// Hash a bearer token for storage and lookup.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

#[derive(Clone)]
pub struct ClientRegistry {
    db: Database,
    server_secret: String,
    default_max_embeddings: u64,
    planes: Arc<PlaneCache>,
}

impl ClientRegistry {
    pub fn new(
        db: Database,
        server_secret: String,
        default_max_embeddings: u64,
        plane_cache_capacity: usize,
    ) -> Self {
        Self {
            db,
            server_secret,
            default_max_embeddings,
            planes: Arc::new(PlaneCache::new(plane_cache_capacity)),
        }
    }

    /// Register or re-register a client for a bearer token.
    ///
    /// Re-initialization with the same shape is idempotent and returns the
    /// existing client with byte-identical planes. Changing the HE context or
    /// LSH shape after embeddings exist fails with `ConfigConflict`; with no
    /// embeddings the record is updated in place.
    pub fn initialize(
        &self,
        api_key: &str,
        params: &HeContextParams,
        embedding_dim: u32,
        lsh: &LshSettings,
    ) -> Result<(ClientRecord, Arc<LshPlanes>)> {
        params.validate()?;
        lsh.validate()?;
        if embedding_dim == 0 {
            return Err(Error::validation("embedding_dim must be positive"));
        }
        if api_key.trim().is_empty() {
            return Err(Error::unauthenticated("empty bearer token"));
        }

        let public_key = BASE64
            .decode(&params.public_key)
            .map_err(|e| Error::validation(format!("invalid base64 public_key: {}", e)))?;

        let key_hash = hash_api_key(api_key);
        let default_quota = self.default_max_embeddings;

        let record = self.db.with_retry(|conn| {
            let existing = conn
                .query_row(
                    &format!("{CLIENT_SELECT} WHERE api_key_hash = ?1"),
                    params![key_hash],
                    row_to_client,
                )
                .optional()?;

            if let Some(client) = existing {
                if !client.is_active {
                    return Err(Error::unauthenticated("client is deactivated"));
                }

                if client.shape_matches(params, embedding_dim, lsh) {
                    // Idempotent path; only num_candidates may drift freely
                    if client.lsh.num_candidates != lsh.num_candidates {
                        conn.execute(
                            "UPDATE clients SET num_candidates = ?2 WHERE client_id = ?1",
                            params![client.client_id.to_string(), lsh.num_candidates],
                        )?;
                    }
                    let mut client = client;
                    client.lsh.num_candidates = lsh.num_candidates;
                    return Ok(client);
                }

                if client.total_embeddings > 0 {
                    return Err(Error::ConfigConflict(format!(
                        "client {} already holds {} embeddings; HE context and LSH shape \
                         cannot change",
                        client.client_id, client.total_embeddings
                    )));
                }

                conn.execute(
                    "UPDATE clients
                     SET he_scheme = ?2, poly_modulus_degree = ?3, scale = ?4, public_key = ?5,
                         embedding_dim = ?6, num_tables = ?7, hash_size = ?8,
                         num_candidates = ?9, last_active_at = ?10
                     WHERE client_id = ?1",
                    params![
                        client.client_id.to_string(),
                        params.scheme,
                        params.poly_modulus_degree,
                        params.scale as i64,
                        public_key,
                        embedding_dim,
                        lsh.num_tables,
                        lsh.hash_size,
                        lsh.num_candidates,
                        Utc::now(),
                    ],
                )?;
                self.planes.evict(client.client_id);

                return conn
                    .query_row(
                        &format!("{CLIENT_SELECT} WHERE api_key_hash = ?1"),
                        params![key_hash],
                        row_to_client,
                    )
                    .map_err(Error::from);
            }

            let client_id = Uuid::new_v4();
            let client_name = format!("client_{}", &client_id.simple().to_string()[..8]);
            let now = Utc::now();

            conn.execute(
                "INSERT INTO clients (client_id, client_name, api_key_hash, he_scheme,
                                      poly_modulus_degree, scale, public_key, embedding_dim,
                                      num_tables, hash_size, num_candidates, max_embeddings,
                                      created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    client_id.to_string(),
                    client_name,
                    key_hash,
                    params.scheme,
                    params.poly_modulus_degree,
                    params.scale as i64,
                    public_key,
                    embedding_dim,
                    lsh.num_tables,
                    lsh.hash_size,
                    lsh.num_candidates,
                    default_quota as i64,
                    now,
                ],
            )?;

            tracing::info!(
                client_id = %client_id,
                embedding_dim,
                num_tables = lsh.num_tables,
                hash_size = lsh.hash_size,
                "registered client"
            );

            conn.query_row(
                &format!("{CLIENT_SELECT} WHERE client_id = ?1"),
                params![client_id.to_string()],
                row_to_client,
            )
            .map_err(Error::from)
        })?;

        let planes = self.planes_for(&record)?;
        Ok((record, planes))
    }

    /// Resolve a bearer token to its active client.
    pub fn authenticate(&self, api_key: &str) -> Result<ClientRecord> {
        let key_hash = hash_api_key(api_key);
        self.db.with_retry(|conn| {
            conn.query_row(
                &format!("{CLIENT_SELECT} WHERE api_key_hash = ?1 AND is_active = 1"),
                params![key_hash],
                row_to_client,
            )
            .optional()?
            .ok_or_else(|| Error::unauthenticated("unknown or inactive API key"))
        })
    }

    /// Look up a client by ID (active or not).
    pub fn get(&self, client_id: Uuid) -> Result<ClientRecord> {
        self.db.with_retry(|conn| {
            conn.query_row(
                &format!("{CLIENT_SELECT} WHERE client_id = ?1"),
                params![client_id.to_string()],
                row_to_client,
            )
            .optional()?
            .ok_or_else(|| Error::not_found(format!("client {} not found", client_id)))
        })
    }

    /// Planes for a client, regenerating on cache miss.
    pub fn planes_for(&self, client: &ClientRecord) -> Result<Arc<LshPlanes>> {
        if let Some(planes) = self.planes.get(client.client_id) {
            return Ok(planes);
        }

        let seed = plane_seed(&self.server_secret, client.client_id);
        let planes = Arc::new(LshPlanes::generate(
            client.lsh.num_tables,
            client.lsh.hash_size,
            client.embedding_dim,
            seed,
        )?);
        self.planes.put(client.client_id, planes.clone());
        Ok(planes)
    }

    /// Counters for `GET /stats/{client_id}`.
    pub fn stats(&self, client_id: Uuid) -> Result<ClientStats> {
        let client = self.get(client_id)?;
        Ok(ClientStats {
            client_id: client.client_id,
            client_name: client.client_name,
            total_embeddings: client.total_embeddings,
            total_searches: client.total_searches,
            embedding_dim: client.embedding_dim,
            max_embeddings: client.max_embeddings,
            last_active_at: client.last_active_at,
            is_active: client.is_active,
            created_at: client.created_at,
        })
    }

    /// Deactivate a client and drop its cached planes.
    pub fn deactivate(&self, client_id: Uuid) -> Result<()> {
        self.db.with_retry(|conn| {
            let changed = conn.execute(
                "UPDATE clients SET is_active = 0, last_active_at = ?2 WHERE client_id = ?1",
                params![client_id.to_string(), Utc::now()],
            )?;
            if changed == 0 {
                return Err(Error::not_found(format!("client {} not found", client_id)));
            }
            Ok(())
        })?;

        self.planes.evict(client_id);
        tracing::info!(client_id = %client_id, "deactivated client");
        Ok(())
    }
}

const CLIENT_SELECT: &str = "SELECT client_id, client_name, api_key_hash, he_scheme,
        poly_modulus_degree, scale, public_key, embedding_dim, num_tables, hash_size,
        num_candidates, max_embeddings, total_embeddings, total_searches, created_at,
        last_active_at, is_active
 FROM clients";

fn row_to_client(row: &Row<'_>) -> rusqlite::Result<ClientRecord> {
    let id_text: String = row.get(0)?;
    let client_id = Uuid::parse_str(&id_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ClientRecord {
        client_id,
        client_name: row.get(1)?,
        api_key_hash: row.get(2)?,
        he_scheme: row.get(3)?,
        poly_modulus_degree: row.get::<_, i64>(4)? as u32,
        scale: row.get::<_, i64>(5)? as u64,
        public_key: row.get(6)?,
        embedding_dim: row.get::<_, i64>(7)? as u32,
        lsh: LshSettings {
            num_tables: row.get::<_, i64>(8)? as u32,
            hash_size: row.get::<_, i64>(9)? as u32,
            num_candidates: row.get::<_, i64>(10)? as u32,
        },
        max_embeddings: row.get::<_, i64>(11)? as u64,
        total_embeddings: row.get::<_, i64>(12)? as u64,
        total_searches: row.get::<_, i64>(13)? as u64,
        created_at: row.get(14)?,
        last_active_at: row.get(15)?,
        is_active: row.get::<_, i64>(16)? != 0,
    })
}

/// Bounded cache of per-client plane matrices, least-recently-used eviction.
struct PlaneCache {
    capacity: usize,
    inner: Mutex<PlaneCacheInner>,
}

#[derive(Default)]
struct PlaneCacheInner {
    entries: HashMap<Uuid, Arc<LshPlanes>>,
    recency: VecDeque<Uuid>,
}

impl PlaneCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PlaneCacheInner::default()),
        }
    }

    fn get(&self, client_id: Uuid) -> Option<Arc<LshPlanes>> {
        let mut inner = self.inner.lock().expect("plane cache poisoned");
        let planes = inner.entries.get(&client_id).cloned()?;
        inner.recency.retain(|id| *id != client_id);
        inner.recency.push_back(client_id);
        Some(planes)
    }

    fn put(&self, client_id: Uuid, planes: Arc<LshPlanes>) {
        let mut inner = self.inner.lock().expect("plane cache poisoned");
        if inner.entries.insert(client_id, planes).is_none() {
            inner.recency.push_back(client_id);
        }
        while inner.entries.len() > self.capacity {
            match inner.recency.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn evict(&self, client_id: Uuid) {
        let mut inner = self.inner.lock().expect("plane cache poisoned");
        inner.entries.remove(&client_id);
        inner.recency.retain(|id| *id != client_id);
    }
}
