//! API server state

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::Database;
use crate::engine::SearchEngine;
use crate::he::CodecRegistry;
use crate::index::LshIndex;
use crate::registry::ClientRegistry;
use crate::store::EmbeddingStore;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub registry: ClientRegistry,
    pub engine: SearchEngine,
    /// Wall-clock budget per request
    pub request_timeout: Duration,
}

impl AppState {
    /// Wire the full component stack over one database.
    pub fn new(config: &AppConfig, db: Database) -> Self {
        let codecs = Arc::new(CodecRegistry::new(config.he.scheme_aliases.clone()));

        let registry = ClientRegistry::new(
            db.clone(),
            config.security.server_secret.clone(),
            config.limits.max_embeddings,
            config.search.plane_cache_capacity,
        );

        let store = EmbeddingStore::new(db.clone());
        let index = LshIndex::new(db.clone(), config.search.max_bucket_fanout);
        let engine = SearchEngine::new(db.clone(), store, index, codecs);

        Self {
            db,
            registry,
            engine,
            request_timeout: Duration::from_secs(config.search.request_timeout_secs),
        }
    }
}
