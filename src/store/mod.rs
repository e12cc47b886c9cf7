//! Durable storage of encrypted embeddings
//!
//! Ciphertexts are immutable once written. An insert is one transaction
//! covering the embedding row, its metadata, its LSH postings, the quota
//! check, and the client counter bump; partial writes are never observable.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::db::{map_sqlite_error, Database};
use crate::index;
use crate::types::FetchedEmbedding;
use crate::{Error, Result};

#[derive(Clone)]
pub struct EmbeddingStore {
    db: Database,
}

/// Everything needed to persist one embedding
pub struct NewEmbedding {
    pub client_id: Uuid,
    pub ciphertext: Vec<u8>,
    pub lsh_hashes: Vec<u32>,
    pub metadata: Option<serde_json::Value>,
    pub external_id: Option<String>,
}

impl EmbeddingStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an embedding with its metadata and postings atomically.
    pub fn insert(&self, new: &NewEmbedding) -> Result<Uuid> {
        self.db.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row = tx
                .query_row(
                    "SELECT total_embeddings, max_embeddings, num_tables
                     FROM clients WHERE client_id = ?1 AND is_active = 1",
                    params![new.client_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;

            let (total, quota, num_tables) = row.ok_or_else(|| {
                Error::not_found(format!("client {} not found", new.client_id))
            })?;

            if total >= quota {
                return Err(Error::QuotaExceeded(format!(
                    "client {} holds {} of {} allowed embeddings",
                    new.client_id, total, quota
                )));
            }

            if new.lsh_hashes.len() != num_tables as usize {
                return Err(Error::validation(format!(
                    "expected {} LSH hashes, got {}",
                    num_tables,
                    new.lsh_hashes.len()
                )));
            }

            if let Some(external_id) = &new.external_id {
                let exists: Option<String> = tx
                    .query_row(
                        "SELECT embedding_id FROM embeddings
                         WHERE client_id = ?1 AND external_id = ?2",
                        params![new.client_id.to_string(), external_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Err(Error::DuplicateExternalId(external_id.clone()));
                }
            }

            let embedding_id = Uuid::new_v4();
            let now = Utc::now();

            tx.execute(
                "INSERT INTO embeddings (embedding_id, client_id, external_id, ciphertext,
                                         size_bytes, created_at, accessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    embedding_id.to_string(),
                    new.client_id.to_string(),
                    new.external_id,
                    new.ciphertext,
                    new.ciphertext.len() as i64,
                    now,
                ],
            )
            .map_err(|e| map_sqlite_error(e, new.external_id.as_deref().unwrap_or("")))?;

            if let Some(metadata) = &new.metadata {
                tx.execute(
                    "INSERT INTO embedding_metadata (embedding_id, metadata) VALUES (?1, ?2)",
                    params![embedding_id.to_string(), serde_json::to_string(metadata)?],
                )?;
            }

            index::write_postings(&tx, new.client_id, embedding_id, &new.lsh_hashes)?;

            tx.execute(
                "UPDATE clients
                 SET total_embeddings = total_embeddings + 1, last_active_at = ?2
                 WHERE client_id = ?1",
                params![new.client_id.to_string(), now],
            )?;

            tx.commit()?;
            Ok(embedding_id)
        })
    }

    /// Bulk fetch ciphertexts + metadata, preserving the requested order.
    ///
    /// Soft-deleted rows are silently dropped so the caller's alignment with
    /// the candidate ranking survives.
    pub fn fetch_many(&self, client_id: Uuid, ids: &[Uuid]) -> Result<Vec<FetchedEmbedding>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.db.with_retry(|conn| {
            let placeholders = (0..ids.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");

            let sql = format!(
                "SELECT e.embedding_id, e.ciphertext, m.metadata
                 FROM embeddings e
                 LEFT JOIN embedding_metadata m ON m.embedding_id = e.embedding_id
                 WHERE e.client_id = ?1 AND e.is_deleted = 0
                   AND e.embedding_id IN ({placeholders})"
            );

            let mut stmt = conn.prepare(&sql)?;
            let mut bindings: Vec<String> = Vec::with_capacity(ids.len() + 1);
            bindings.push(client_id.to_string());
            bindings.extend(ids.iter().map(Uuid::to_string));

            let mut by_id: HashMap<Uuid, FetchedEmbedding> = HashMap::with_capacity(ids.len());
            let mut rows = stmt.query(rusqlite::params_from_iter(bindings.iter()))?;
            while let Some(row) = rows.next()? {
                let id_text: String = row.get(0)?;
                let embedding_id = Uuid::parse_str(&id_text)
                    .map_err(|e| Error::database(format!("bad uuid in embeddings: {}", e)))?;
                let metadata: Option<String> = row.get(2)?;
                let metadata = metadata
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()?;
                by_id.insert(
                    embedding_id,
                    FetchedEmbedding {
                        embedding_id,
                        ciphertext: row.get(1)?,
                        metadata,
                    },
                );
            }
            drop(rows);

            let now = Utc::now();
            let update_sql = format!(
                "UPDATE embeddings SET accessed_at = ?1, access_count = access_count + 1
                 WHERE client_id = ?2 AND is_deleted = 0
                   AND embedding_id IN ({placeholders_upd})",
                placeholders_upd = (0..ids.len())
                    .map(|i| format!("?{}", i + 3))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut update_bindings: Vec<Box<dyn rusqlite::types::ToSql>> =
                vec![Box::new(now), Box::new(client_id.to_string())];
            for id in ids {
                update_bindings.push(Box::new(id.to_string()));
            }
            conn.execute(
                &update_sql,
                rusqlite::params_from_iter(update_bindings.iter().map(|b| b.as_ref())),
            )?;

            Ok(ids
                .iter()
                .filter_map(|id| by_id.remove(id))
                .collect())
        })
    }

    /// Hide an embedding from every future candidate pool.
    pub fn soft_delete(&self, client_id: Uuid, embedding_id: Uuid) -> Result<()> {
        self.db.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();

            let changed = tx.execute(
                "UPDATE embeddings SET is_deleted = 1, deleted_at = ?3
                 WHERE client_id = ?1 AND embedding_id = ?2 AND is_deleted = 0",
                params![client_id.to_string(), embedding_id.to_string(), now],
            )?;

            if changed == 0 {
                return Err(Error::not_found(format!(
                    "embedding {} not found",
                    embedding_id
                )));
            }

            tx.execute(
                "UPDATE clients
                 SET total_embeddings = MAX(total_embeddings - 1, 0), last_active_at = ?2
                 WHERE client_id = ?1",
                params![client_id.to_string(), now],
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    /// Physically remove soft-deleted embeddings past the retention horizon.
    /// Postings and metadata cascade.
    pub fn purge_orphans(&self, retention_days: i64) -> Result<usize> {
        self.db.with_retry(|conn| {
            let cutoff = Utc::now() - Duration::days(retention_days);
            let removed = conn.execute(
                "DELETE FROM embeddings WHERE is_deleted = 1 AND deleted_at < ?1",
                params![cutoff],
            )?;
            if removed > 0 {
                tracing::info!(removed, retention_days, "purged soft-deleted embeddings");
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;
    use crate::registry::tests::seed_client;

    fn store_with_client() -> (tempfile::TempDir, EmbeddingStore, Uuid) {
        let (dir, db) = test_database();
        let client_id = seed_client(&db, 4, 8, 16, 100);
        (dir, EmbeddingStore::new(db), client_id)
    }

    fn new_embedding(client_id: Uuid, external_id: Option<&str>) -> NewEmbedding {
        NewEmbedding {
            client_id,
            ciphertext: vec![7u8; 64],
            lsh_hashes: vec![1, 2, 3, 4],
            metadata: Some(serde_json::json!({"category": "test"})),
            external_id: external_id.map(str::to_string),
        }
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let (_dir, store, client_id) = store_with_client();

        let id = store.insert(&new_embedding(client_id, None)).unwrap();
        let fetched = store.fetch_many(client_id, &[id]).unwrap();

        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].embedding_id, id);
        assert_eq!(fetched[0].ciphertext, vec![7u8; 64]);
        assert_eq!(
            fetched[0].metadata.as_ref().unwrap()["category"],
            serde_json::json!("test")
        );
    }

    #[test]
    fn fetch_preserves_request_order() {
        let (_dir, store, client_id) = store_with_client();

        let first = store.insert(&new_embedding(client_id, None)).unwrap();
        let second = store.insert(&new_embedding(client_id, None)).unwrap();
        let third = store.insert(&new_embedding(client_id, None)).unwrap();

        let fetched = store
            .fetch_many(client_id, &[third, first, second])
            .unwrap();
        let order: Vec<Uuid> = fetched.iter().map(|f| f.embedding_id).collect();
        assert_eq!(order, vec![third, first, second]);
    }

    #[test]
    fn duplicate_external_id_rejected() {
        let (_dir, store, client_id) = store_with_client();

        store
            .insert(&new_embedding(client_id, Some("doc-1")))
            .unwrap();
        let err = store
            .insert(&new_embedding(client_id, Some("doc-1")))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateExternalId(_)));
    }

    #[test]
    fn quota_enforced() {
        let (_dir, db) = test_database();
        let client_id = seed_client(&db, 4, 8, 16, 2);
        let store = EmbeddingStore::new(db);

        store.insert(&new_embedding(client_id, None)).unwrap();
        store.insert(&new_embedding(client_id, None)).unwrap();
        let err = store.insert(&new_embedding(client_id, None)).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
    }

    #[test]
    fn wrong_hash_count_rejected() {
        let (_dir, store, client_id) = store_with_client();
        let mut embedding = new_embedding(client_id, None);
        embedding.lsh_hashes = vec![1, 2];
        assert!(matches!(
            store.insert(&embedding).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn soft_deleted_rows_do_not_surface() {
        let (_dir, store, client_id) = store_with_client();

        let id = store.insert(&new_embedding(client_id, None)).unwrap();
        store.soft_delete(client_id, id).unwrap();

        assert!(store.fetch_many(client_id, &[id]).unwrap().is_empty());

        // Deleting again is a NotFound, not a silent success
        assert!(matches!(
            store.soft_delete(client_id, id).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn purge_removes_old_soft_deletes() {
        let (_dir, store, client_id) = store_with_client();

        let id = store.insert(&new_embedding(client_id, None)).unwrap();
        store.soft_delete(client_id, id).unwrap();

        // Horizon in the future: nothing old enough yet
        assert_eq!(store.purge_orphans(30).unwrap(), 0);
        // Horizon of -1 days puts the cutoff ahead of `deleted_at`
        assert_eq!(store.purge_orphans(-1).unwrap(), 1);
    }
}
