//! LSH posting index
//!
//! Posting lists live in the `lsh_postings` table keyed by
//! `(client_id, table_index, hash_value, embedding_id)`. Candidate selection
//! joins the unrolled query hash vector against that table and ranks by the
//! number of tables in which a stored embedding collides with the query.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Transaction};
use uuid::Uuid;

use crate::db::Database;
use crate::types::CandidateSet;
use crate::{Error, Result};

/// Write one posting row per hash table, inside the caller's transaction.
///
/// Called from the embedding insert so postings and the embedding row commit
/// or roll back together.
pub fn write_postings(
    tx: &Transaction<'_>,
    client_id: Uuid,
    embedding_id: Uuid,
    hashes: &[u32],
) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO lsh_postings (client_id, table_index, hash_value, embedding_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (table_index, hash_value) in hashes.iter().enumerate() {
        stmt.execute(params![
            client_id.to_string(),
            table_index as i64,
            *hash_value as i64,
            embedding_id.to_string(),
        ])?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct LshIndex {
    db: Database,
    /// Per-bucket read bound; larger buckets are deterministically subsampled
    max_bucket_fanout: u32,
}

impl LshIndex {
    pub fn new(db: Database, max_bucket_fanout: u32) -> Self {
        Self {
            db,
            max_bucket_fanout: max_bucket_fanout.max(1),
        }
    }

    /// Select up to `limit` candidates for a query hash vector.
    ///
    /// Ranking: match count desc, then most recent `created_at`, then
    /// embedding id. Buckets larger than the fanout bound contribute a
    /// deterministic subsample (UUIDv4 low hex digits are uniform random
    /// bits, so ordering by them is a stable pseudo-random pick) and the
    /// truncation is reported.
    pub fn candidates(
        &self,
        client_id: Uuid,
        query_hashes: &[u32],
        limit: usize,
    ) -> Result<CandidateSet> {
        if query_hashes.is_empty() || limit == 0 {
            return Ok(CandidateSet::default());
        }

        self.db.with_retry(|conn| {
            let probe_cte = probe_values(query_hashes.len());
            let client = client_id.to_string();

            // Pass 1: bucket sizes for the probed pairs (at most T rows)
            let sizes_sql = format!(
                "WITH probe(table_index, hash_value) AS (VALUES {probe_cte})
                 SELECT p.table_index, p.hash_value, COUNT(*)
                 FROM lsh_postings p
                 JOIN probe q ON q.table_index = p.table_index
                             AND q.hash_value = p.hash_value
                 WHERE p.client_id = ?1
                 GROUP BY p.table_index, p.hash_value"
            );

            let mut bindings = probe_bindings(&client, query_hashes);
            let mut stmt = conn.prepare(&sizes_sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(bindings.iter()))?;

            let fanout = self.max_bucket_fanout as i64;
            let mut in_budget: Vec<(i64, i64)> = Vec::new();
            let mut oversized: Vec<(i64, i64)> = Vec::new();
            while let Some(row) = rows.next()? {
                let pair = (row.get::<_, i64>(0)?, row.get::<_, i64>(1)?);
                if row.get::<_, i64>(2)? > fanout {
                    oversized.push(pair);
                } else {
                    in_budget.push(pair);
                }
            }
            drop(rows);
            drop(stmt);

            if oversized.is_empty() {
                return self.select_aggregated(conn, &client, query_hashes, limit);
            }

            // Pathological path: merge bounded per-bucket reads in memory
            let mut tally: HashMap<Uuid, (u32, DateTime<Utc>)> = HashMap::new();

            if !in_budget.is_empty() {
                let rows_sql = format!(
                    "WITH probe(table_index, hash_value) AS (VALUES {cte})
                     SELECT p.embedding_id, e.created_at
                     FROM lsh_postings p
                     JOIN probe q ON q.table_index = p.table_index
                                 AND q.hash_value = p.hash_value
                     JOIN embeddings e ON e.embedding_id = p.embedding_id
                     WHERE p.client_id = ?1 AND e.is_deleted = 0",
                    cte = probe_values(in_budget.len())
                );
                bindings = vec![Value::Text(client.clone())];
                for (table_index, hash_value) in &in_budget {
                    bindings.push(Value::Integer(*table_index));
                    bindings.push(Value::Integer(*hash_value));
                }
                let mut stmt = conn.prepare(&rows_sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(bindings.iter()))?;
                while let Some(row) = rows.next()? {
                    tally_row(&mut tally, row)?;
                }
            }

            for (table_index, hash_value) in &oversized {
                let mut stmt = conn.prepare_cached(
                    "SELECT p.embedding_id, e.created_at
                     FROM lsh_postings p
                     JOIN embeddings e ON e.embedding_id = p.embedding_id
                     WHERE p.client_id = ?1 AND p.table_index = ?2 AND p.hash_value = ?3
                       AND e.is_deleted = 0
                     ORDER BY substr(p.embedding_id, 25)
                     LIMIT ?4",
                )?;
                let mut rows = stmt.query(params![client, table_index, hash_value, fanout])?;
                while let Some(row) = rows.next()? {
                    tally_row(&mut tally, row)?;
                }
            }

            let matched = tally.len() as u64;
            let mut ranked: Vec<(Uuid, u32, DateTime<Utc>)> = tally
                .into_iter()
                .map(|(id, (count, created))| (id, count, created))
                .collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));
            ranked.truncate(limit);

            tracing::debug!(
                oversized = oversized.len(),
                matched,
                "bucket fanout bound hit during candidate selection"
            );

            Ok(CandidateSet {
                ids: ranked.into_iter().map(|(id, _, _)| id).collect(),
                matched,
                truncated_buckets: oversized.len() as u32,
            })
        })
    }

    /// Canonical selection: one aggregated join, entirely in SQL.
    fn select_aggregated(
        &self,
        conn: &rusqlite::Connection,
        client: &str,
        query_hashes: &[u32],
        limit: usize,
    ) -> Result<CandidateSet> {
        let probe_cte = probe_values(query_hashes.len());

        let matched_sql = format!(
            "WITH probe(table_index, hash_value) AS (VALUES {probe_cte})
             SELECT COUNT(DISTINCT p.embedding_id)
             FROM lsh_postings p
             JOIN probe q ON q.table_index = p.table_index
                         AND q.hash_value = p.hash_value
             JOIN embeddings e ON e.embedding_id = p.embedding_id
             WHERE p.client_id = ?1 AND e.is_deleted = 0"
        );
        let bindings = probe_bindings(client, query_hashes);
        let matched: i64 = conn.query_row(
            &matched_sql,
            rusqlite::params_from_iter(bindings.iter()),
            |row| row.get(0),
        )?;

        let select_sql = format!(
            "WITH probe(table_index, hash_value) AS (VALUES {probe_cte})
             SELECT e.embedding_id, COUNT(*) AS matches
             FROM lsh_postings p
             JOIN probe q ON q.table_index = p.table_index
                         AND q.hash_value = p.hash_value
             JOIN embeddings e ON e.embedding_id = p.embedding_id
             WHERE p.client_id = ?1 AND e.is_deleted = 0
             GROUP BY e.embedding_id
             ORDER BY matches DESC, e.created_at DESC, e.embedding_id ASC
             LIMIT {limit}"
        );

        let mut stmt = conn.prepare(&select_sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(bindings.iter()))?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let id_text: String = row.get(0)?;
            ids.push(
                Uuid::parse_str(&id_text)
                    .map_err(|e| Error::database(format!("bad uuid in postings: {}", e)))?,
            );
        }

        Ok(CandidateSet {
            ids,
            matched: matched as u64,
            truncated_buckets: 0,
        })
    }
}

fn tally_row(
    tally: &mut HashMap<Uuid, (u32, DateTime<Utc>)>,
    row: &rusqlite::Row<'_>,
) -> Result<()> {
    let id_text: String = row.get(0)?;
    let embedding_id = Uuid::parse_str(&id_text)
        .map_err(|e| Error::database(format!("bad uuid in postings: {}", e)))?;
    let created_at: DateTime<Utc> = row.get(1)?;
    tally
        .entry(embedding_id)
        .and_modify(|(count, _)| *count += 1)
        .or_insert((1, created_at));
    Ok(())
}

/// `(?2, ?3), (?4, ?5), ...` — one positional pair per probed table
fn probe_values(pairs: usize) -> String {
    (0..pairs)
        .map(|i| format!("(?{}, ?{})", i * 2 + 2, i * 2 + 3))
        .collect::<Vec<_>>()
        .join(", ")
}

fn probe_bindings(client: &str, query_hashes: &[u32]) -> Vec<Value> {
    let mut bindings = Vec::with_capacity(query_hashes.len() * 2 + 1);
    bindings.push(Value::Text(client.to_string()));
    for (table_index, hash_value) in query_hashes.iter().enumerate() {
        bindings.push(Value::Integer(table_index as i64));
        bindings.push(Value::Integer(*hash_value as i64));
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;
    use crate::registry::tests::seed_client;
    use crate::store::{EmbeddingStore, NewEmbedding};

    fn setup(max_fanout: u32) -> (tempfile::TempDir, EmbeddingStore, LshIndex, Uuid) {
        let (dir, db) = test_database();
        let client_id = seed_client(&db, 4, 8, 16, 10_000);
        let store = EmbeddingStore::new(db.clone());
        let index = LshIndex::new(db, max_fanout);
        (dir, store, index, client_id)
    }

    fn add(store: &EmbeddingStore, client_id: Uuid, hashes: Vec<u32>) -> Uuid {
        store
            .insert(&NewEmbedding {
                client_id,
                ciphertext: vec![0u8; 16],
                lsh_hashes: hashes,
                metadata: None,
                external_id: None,
            })
            .unwrap()
    }

    #[test]
    fn ranks_by_match_count() {
        let (_dir, store, index, client_id) = setup(512);

        let full = add(&store, client_id, vec![10, 20, 30, 40]);
        let half = add(&store, client_id, vec![10, 20, 99, 99]);
        let none = add(&store, client_id, vec![5, 6, 7, 8]);

        let set = index.candidates(client_id, &[10, 20, 30, 40], 10).unwrap();

        assert_eq!(set.ids, vec![full, half]);
        assert_eq!(set.matched, 2);
        assert_eq!(set.truncated_buckets, 0);
        assert!(!set.ids.contains(&none));
    }

    #[test]
    fn respects_limit() {
        let (_dir, store, index, client_id) = setup(512);

        for _ in 0..8 {
            add(&store, client_id, vec![1, 2, 3, 4]);
        }

        let set = index.candidates(client_id, &[1, 2, 3, 4], 3).unwrap();
        assert_eq!(set.ids.len(), 3);
        assert_eq!(set.matched, 8);
    }

    #[test]
    fn excludes_soft_deleted() {
        let (_dir, store, index, client_id) = setup(512);

        let kept = add(&store, client_id, vec![1, 2, 3, 4]);
        let removed = add(&store, client_id, vec![1, 2, 3, 4]);
        store.soft_delete(client_id, removed).unwrap();

        let set = index.candidates(client_id, &[1, 2, 3, 4], 10).unwrap();
        assert_eq!(set.ids, vec![kept]);
    }

    #[test]
    fn no_matches_is_empty_not_error() {
        let (_dir, _store, index, client_id) = setup(512);
        let set = index.candidates(client_id, &[1, 2, 3, 4], 10).unwrap();
        assert!(set.ids.is_empty());
        assert_eq!(set.matched, 0);
    }

    #[test]
    fn oversized_bucket_is_subsampled_deterministically() {
        let (_dir, store, index, client_id) = setup(4);

        // 12 embeddings share bucket 7 of table 0; fanout bound is 4
        for _ in 0..12 {
            add(&store, client_id, vec![7, 1000, 2000, 3000]);
        }

        let first = index.candidates(client_id, &[7, 8, 9, 10], 100).unwrap();
        assert!(first.truncated_buckets >= 1);
        assert!(first.ids.len() <= 4);

        let second = index.candidates(client_id, &[7, 8, 9, 10], 100).unwrap();
        assert_eq!(first.ids, second.ids, "subsample must be deterministic");
    }

    #[test]
    fn isolation_between_clients() {
        let (_dir, db) = test_database();
        let client_a = seed_client(&db, 4, 8, 16, 100);
        let client_b = seed_client(&db, 4, 8, 16, 100);
        let store = EmbeddingStore::new(db.clone());
        let index = LshIndex::new(db, 512);

        let owned_by_b = add(&store, client_b, vec![1, 2, 3, 4]);

        let set = index.candidates(client_a, &[1, 2, 3, 4], 10).unwrap();
        assert!(set.ids.is_empty());
        assert!(!set.ids.contains(&owned_by_b));
    }
}
