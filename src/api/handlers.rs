//! API handlers

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::SearchParams;
use crate::registry::ClientRegistry;
use crate::store::NewEmbedding;
use crate::types::{ClientRecord, ClientStats, EncryptedMatch, HeContextParams, LshSettings};
use crate::{Error, Result};

use super::AppState;

/// Error wrapper mapping `Error` kinds onto HTTP statuses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ConfigConflict(_) | Error::DuplicateExternalId(_) => StatusCode::CONFLICT,
            Error::QuotaExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::CorruptCiphertext(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = Json(serde_json::json!({
            "detail": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Extract the bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| Error::unauthenticated("missing Authorization header"))?
        .to_str()
        .map_err(|_| Error::unauthenticated("malformed Authorization header"))?;

    value
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| Error::unauthenticated("expected Bearer authorization"))
}

/// Run CPU/database-bound work on the blocking pool under the request budget.
async fn run_blocking<T, F>(state: &AppState, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let budget = state.request_timeout;
    let task = tokio::task::spawn_blocking(work);

    match tokio::time::timeout(budget, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(Error::internal(format!("worker task failed: {}", join_err))),
        Err(_) => Err(Error::Timeout(budget.as_secs())),
    }
}

/// Authenticate and check that the caller owns the client named in the body.
///
/// Touches the database; call it from inside the blocking closure.
fn authorize(registry: &ClientRegistry, api_key: &str, client_id: Uuid) -> Result<ClientRecord> {
    let client = registry.authenticate(api_key)?;
    if client.client_id != client_id {
        return Err(Error::unauthenticated(
            "bearer token does not own the requested client_id",
        ));
    }
    Ok(client)
}

/// Health check with database connectivity probe
pub async fn health(State(state): State<AppState>) -> Response {
    let db = state.db.clone();
    let probe = tokio::task::spawn_blocking(move || db.ping()).await;

    match probe {
        Ok(Ok(())) => Json(serde_json::json!({
            "status": "ok",
            "database": "connected",
        }))
        .into_response(),
        Ok(Err(err)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "reason": err.to_string(),
            })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "reason": format!("health probe failed: {}", err),
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub context_params: HeContextParams,
    pub embedding_dim: u32,
    #[serde(default)]
    pub lsh_config: LshSettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitResponse {
    pub client_id: Uuid,
    pub lsh_config: LshSettings,
    /// Base64 serialized hyperplanes; client hashing must match the server
    pub random_planes: String,
}

/// Initialize (or idempotently re-initialize) the calling client
pub async fn initialize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<InitRequest>,
) -> ApiResult<InitResponse> {
    let api_key = bearer_token(&headers)?;

    let registry = state.registry.clone();
    let response = run_blocking(&state, move || {
        let (client, planes) = registry.initialize(
            &api_key,
            &payload.context_params,
            payload.embedding_dim,
            &payload.lsh_config,
        )?;
        Ok(InitResponse {
            client_id: client.client_id,
            lsh_config: client.lsh,
            random_planes: planes.to_base64(),
        })
    })
    .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct AddEmbeddingRequest {
    pub client_id: Uuid,
    /// Base64 ciphertext of the embedding vector
    pub encrypted_embedding: String,
    pub lsh_hashes: Vec<u32>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub external_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddEmbeddingResponse {
    pub embedding_id: Uuid,
}

/// Store an encrypted embedding with its LSH postings
pub async fn add_embedding(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddEmbeddingRequest>,
) -> ApiResult<AddEmbeddingResponse> {
    let api_key = bearer_token(&headers)?;

    let ciphertext = BASE64
        .decode(&payload.encrypted_embedding)
        .map_err(|e| Error::corrupt(format!("invalid base64 ciphertext: {}", e)))?;

    let registry = state.registry.clone();
    let engine = state.engine.clone();
    let embedding_id = run_blocking(&state, move || {
        let client = authorize(&registry, &api_key, payload.client_id)?;
        engine.store().insert(&NewEmbedding {
            client_id: client.client_id,
            ciphertext,
            lsh_hashes: payload.lsh_hashes,
            metadata: payload.metadata,
            external_id: payload.external_id,
        })
    })
    .await?;

    Ok(Json(AddEmbeddingResponse { embedding_id }))
}

#[derive(Debug, Deserialize)]
pub struct SearchApiRequest {
    pub client_id: Uuid,
    pub encrypted_query: String,
    pub lsh_hashes: Vec<u32>,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_rerank")]
    pub rerank_candidates: u32,
}

fn default_top_k() -> u32 {
    10
}

fn default_rerank() -> u32 {
    100
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchApiResponse {
    pub results: Vec<EncryptedMatch>,
    pub candidates_found: u64,
    pub candidates_checked: u64,
    pub search_time_ms: u64,
    pub lsh_time_ms: u64,
    pub he_compute_time_ms: u64,
}

/// Encrypted similarity search; scores are only decryptable by the caller
pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SearchApiRequest>,
) -> ApiResult<SearchApiResponse> {
    let api_key = bearer_token(&headers)?;

    let registry = state.registry.clone();
    let engine = state.engine.clone();
    let (results, stats) = run_blocking(&state, move || {
        let client = authorize(&registry, &api_key, payload.client_id)?;
        engine.search(
            &client,
            &SearchParams {
                encrypted_query: payload.encrypted_query,
                lsh_hashes: payload.lsh_hashes,
                top_k: payload.top_k,
                rerank_candidates: payload.rerank_candidates,
            },
        )
    })
    .await?;

    Ok(Json(SearchApiResponse {
        results,
        candidates_found: stats.candidates_found,
        candidates_checked: stats.candidates_checked,
        search_time_ms: stats.total_time_ms,
        lsh_time_ms: stats.lsh_time_ms,
        he_compute_time_ms: stats.he_compute_time_ms,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteEmbeddingResponse {
    pub embedding_id: Uuid,
    pub deleted: bool,
}

/// Soft-delete an embedding; it never surfaces in search again
pub async fn delete_embedding(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(embedding_id): Path<Uuid>,
) -> ApiResult<DeleteEmbeddingResponse> {
    let api_key = bearer_token(&headers)?;

    let registry = state.registry.clone();
    let engine = state.engine.clone();
    run_blocking(&state, move || {
        let client = registry.authenticate(&api_key)?;
        engine.store().soft_delete(client.client_id, embedding_id)
    })
    .await?;

    Ok(Json(DeleteEmbeddingResponse {
        embedding_id,
        deleted: true,
    }))
}

/// Usage counters for the caller's client
pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<Uuid>,
) -> ApiResult<ClientStats> {
    let api_key = bearer_token(&headers)?;

    let registry = state.registry.clone();
    let stats = run_blocking(&state, move || {
        authorize(&registry, &api_key, client_id)?;
        registry.stats(client_id)
    })
    .await?;
    Ok(Json(stats))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeactivateResponse {
    pub client_id: Uuid,
    pub is_active: bool,
}

/// Deactivate the caller's client; its bearer token stops authenticating
pub async fn deactivate_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<Uuid>,
) -> ApiResult<DeactivateResponse> {
    let api_key = bearer_token(&headers)?;

    let registry = state.registry.clone();
    run_blocking(&state, move || {
        authorize(&registry, &api_key, client_id)?;
        registry.deactivate(client_id)
    })
    .await?;

    Ok(Json(DeactivateResponse {
        client_id,
        is_active: false,
    }))
}
