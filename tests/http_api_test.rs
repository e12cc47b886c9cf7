//! Live HTTP round trips: a real server on an ephemeral port, driven by the
//! real client pipeline.

use tempfile::TempDir;

use secure_search::api::{create_router, AppState};
use secure_search::client::{exit_code_for, ClientPipeline};
use secure_search::config::AppConfig;
use secure_search::db::Database;
use secure_search::types::LshSettings;
use secure_search::Error;

/// Boot a server over a temp database; returns its base URL.
async fn spawn_server() -> (TempDir, String) {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.database.path = dir
        .path()
        .join("http-test.db")
        .to_string_lossy()
        .into_owned();

    let db = Database::open(&config.database).unwrap();
    let state = AppState::new(&config, db);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (dir, format!("http://{}", addr))
}

fn small_lsh() -> LshSettings {
    LshSettings {
        num_tables: 8,
        hash_size: 10,
        num_candidates: 50,
    }
}

#[tokio::test]
async fn full_client_round_trip() {
    let (_dir, url) = spawn_server().await;

    let mut pipeline = ClientPipeline::new(&url, "round-trip-bearer", 32);
    let client_id = pipeline.initialize(small_lsh()).await.unwrap();

    // Upload a small corpus
    for (text, category) in [
        ("encrypted search engines", "tech"),
        ("fresh basil pesto", "food"),
        ("marathon training plan", "sport"),
    ] {
        pipeline
            .add_embedding(text, Some(serde_json::json!({ "category": category })), None)
            .await
            .unwrap();
    }

    // Exact query comes back on top with similarity ~1
    let (matches, stats) = pipeline.search("encrypted search engines", 2, 10).await.unwrap();
    assert!(!matches.is_empty());
    assert!(matches.len() <= 2);
    assert!((matches[0].similarity - 1.0).abs() < 1e-4);
    assert_eq!(
        matches[0]
            .metadata
            .as_ref()
            .and_then(|m| m.get("category"))
            .and_then(serde_json::Value::as_str),
        Some("tech")
    );
    assert!(stats.candidates_checked <= 50);

    // Stats reflect usage
    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.client_id, client_id);
    assert_eq!(stats.total_embeddings, 3);
    assert_eq!(stats.total_searches, 1);
}

#[tokio::test]
async fn reinitialize_is_idempotent_over_http() {
    let (_dir, url) = spawn_server().await;

    let mut first = ClientPipeline::new(&url, "idem-bearer", 24);
    let first_id = first.initialize(small_lsh()).await.unwrap();

    let mut second = ClientPipeline::new(&url, "idem-bearer", 24);
    let second_id = second.initialize(small_lsh()).await.unwrap();

    assert_eq!(first_id, second_id);
}

#[tokio::test]
async fn config_conflict_after_embeddings_exist() {
    let (_dir, url) = spawn_server().await;

    let mut pipeline = ClientPipeline::new(&url, "conflict-bearer", 24);
    pipeline.initialize(small_lsh()).await.unwrap();
    pipeline.add_embedding("some content", None, None).await.unwrap();

    // Same bearer, different embedding dimension
    let mut changed = ClientPipeline::new(&url, "conflict-bearer", 48);
    let err = changed.initialize(small_lsh()).await.unwrap_err();
    assert!(matches!(err, Error::ConfigConflict(_)), "got {:?}", err);
}

#[tokio::test]
async fn duplicate_external_id_surfaces_as_conflict() {
    let (_dir, url) = spawn_server().await;

    let mut pipeline = ClientPipeline::new(&url, "dup-bearer", 24);
    pipeline.initialize(small_lsh()).await.unwrap();

    pipeline
        .add_embedding("first", None, Some("doc-1"))
        .await
        .unwrap();
    let err = pipeline
        .add_embedding("second", None, Some("doc-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateExternalId(_)), "got {:?}", err);
}

#[tokio::test]
async fn soft_delete_over_http() {
    let (_dir, url) = spawn_server().await;

    let mut pipeline = ClientPipeline::new(&url, "delete-bearer", 24);
    pipeline.initialize(small_lsh()).await.unwrap();

    let id = pipeline.add_embedding("short lived", None, None).await.unwrap();
    pipeline.delete_embedding(id).await.unwrap();

    let (matches, _) = pipeline.search("short lived", 5, 20).await.unwrap();
    assert!(matches.iter().all(|m| m.embedding_id != id));

    // Second delete is a 404
    let err = pipeline.delete_embedding(id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {:?}", err);
}

#[tokio::test]
async fn tenants_cannot_cross_authenticate() {
    let (_dir, url) = spawn_server().await;

    let mut owner = ClientPipeline::new(&url, "owner-bearer", 24);
    let owner_id = owner.initialize(small_lsh()).await.unwrap();
    owner.add_embedding("private payload", None, None).await.unwrap();

    let mut intruder = ClientPipeline::new(&url, "intruder-bearer", 24);
    intruder.initialize(small_lsh()).await.unwrap();

    // An intruder naming the owner's client_id is rejected before any work
    let body = serde_json::json!({
        "client_id": owner_id,
        "encrypted_query": "AAAA",
        "lsh_hashes": [0u32, 0u32, 0u32, 0u32, 0u32, 0u32, 0u32, 0u32],
        "top_k": 5,
        "rerank_candidates": 10,
    });
    let response = reqwest::Client::new()
        .post(format!("{}/search", url))
        .bearer_auth("intruder-bearer")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_bearer_is_unauthorized() {
    let (_dir, url) = spawn_server().await;

    let response = reqwest::Client::new()
        .post(format!("{}/initialize", url))
        .json(&serde_json::json!({
            "context_params": { "public_key": "" },
            "embedding_dim": 16,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "unauthenticated");
}

#[tokio::test]
async fn unauthenticated_error_maps_to_exit_code_two() {
    let (_dir, url) = spawn_server().await;

    let mut pipeline = ClientPipeline::new(&url, "good-bearer", 24);
    pipeline.initialize(small_lsh()).await.unwrap();

    let mut stale = ClientPipeline::new(&url, "good-bearer", 24);
    stale.initialize(small_lsh()).await.unwrap();

    // Deactivate, then try to search with the dead bearer
    let client_id = pipeline.client_id().unwrap();
    let response = reqwest::Client::new()
        .delete(format!("{}/clients/{}", url, client_id))
        .bearer_auth("good-bearer")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let err = stale.search("anything", 5, 10).await.unwrap_err();
    assert_eq!(exit_code_for(&err), 2, "got {:?}", err);
}

#[tokio::test]
async fn unreachable_server_maps_to_exit_code_three() {
    // Nothing listens on this port
    let mut pipeline = ClientPipeline::new("http://127.0.0.1:1", "bearer", 16);
    let err = pipeline.initialize(small_lsh()).await.unwrap_err();
    assert_eq!(exit_code_for(&err), 3, "got {:?}", err);
}

#[tokio::test]
async fn strip_flag_keeps_text_off_the_wire() {
    let (_dir, url) = spawn_server().await;

    let mut pipeline =
        ClientPipeline::new(&url, "privacy-bearer", 24).with_strip_plaintext(true);
    pipeline.initialize(small_lsh()).await.unwrap();

    // Inspect the exact payload that would be sent for a batch of uploads
    for i in 0..20 {
        let text = format!("confidential screenshot {}", i);
        let payload = pipeline
            .build_add_payload(&text, Some(serde_json::json!({ "index": i })), None)
            .unwrap();

        let serialized = serde_json::to_string(&payload).unwrap();
        assert!(
            !serialized.contains("confidential screenshot"),
            "plaintext leaked into outbound payload: {}",
            serialized
        );
        assert!(payload["metadata"].get("text").is_none());
    }

    // And the real upload path accepts the stripped payload
    let id = pipeline
        .add_embedding("confidential screenshot 99", None, None)
        .await
        .unwrap();

    let (matches, _) = pipeline
        .search("confidential screenshot 99", 1, 10)
        .await
        .unwrap();
    assert_eq!(matches[0].embedding_id, id);
    assert!(matches[0]
        .metadata
        .as_ref()
        .map(|m| m.get("text").is_none())
        .unwrap_or(true));
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (_dir, url) = spawn_server().await;

    let response = reqwest::Client::new()
        .get(format!("{}/health", url))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "connected");
}
