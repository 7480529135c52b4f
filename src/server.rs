//! HTTP surface for the order engine.
//!
//! A thin JSON + SSE layer over [`OrderPipeline`] and the preference
//! store. All business rules live in the library; handlers only decode,
//! call, and encode.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/orders` | Start an order session, returns `{session_id}` |
//! | `GET`  | `/orders/{id}` | Progress snapshot |
//! | `GET`  | `/orders/{id}/events` | SSE progress until ready/error |
//! | `GET`  | `/orders/{id}/review` | Proposals for review |
//! | `POST` | `/orders/{id}/commit` | SSE stream of commit events |
//! | `GET`  | `/catalog/search?q=` | Product picker search |
//! | `POST` | `/catalog/lookup` | Look up a pasted product URL/identifier |
//! | `GET`/`POST` | `/items` | List / create grocery items |
//! | `GET`/`DELETE` | `/items/{id}` | One grocery item |
//! | `POST` | `/items/{id}/aliases` | Add an alias |
//! | `POST` | `/items/{id}/products` | Add a preferred product |
//! | `POST` | `/items/{id}/top` | Make a product the top choice |
//! | `POST` | `/items/merge` | Merge two items |
//! | `DELETE` | `/aliases/{id}` | Delete an alias |
//! | `POST` | `/products/{id}/promote` | Swap a product with the one above |
//! | `DELETE` | `/products/{id}` | Delete a product |
//! | `GET`/`DELETE` | `/history` | Order history / clear it |
//! | `DELETE` | `/history/{session_id}` | Delete one session's history |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "alias '2% milk' already belongs to grocery item 3" } }
//! ```
//!
//! Error codes: `bad_request` (400), `reauth_required` (401), `not_found` (404),
//! `conflict` (409), `wrong_phase` (409), `internal` (500), `upstream_error` (502).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::{ServiceError, SessionError, StoreError};
use crate::history::{clear_history, delete_session_history, list_history, SessionHistory};
use crate::matcher::{
    add_alias, add_preferred_product, create_grocery_item, make_top_choice, promote_product,
};
use crate::models::{Alias, CatalogProduct, GroceryItem, GroceryItemDetail, PreferredProduct, ProductInfo};
use crate::pipeline::{CommitDecision, CommitEvent, OrderPipeline};
use crate::session::{Progress, ProposalItem, SessionPhase};
use crate::store::PreferenceStore;

#[derive(Clone)]
struct AppState {
    pipeline: OrderPipeline,
}

impl AppState {
    fn store(&self) -> &PreferenceStore {
        self.pipeline.store()
    }
}

/// Start the server on `[server].bind` with the configured collaborators.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(PreferenceStore::open(config).await?);
    let pipeline = OrderPipeline::from_config(config, store)?;
    spawn_session_sweeper(pipeline.clone());

    let app = router(pipeline);
    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!(bind = %bind_addr, "Server listening");
    println!("aisle server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router over an existing pipeline.
pub fn router(pipeline: OrderPipeline) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/orders", post(handle_start_order))
        .route("/orders/{id}", get(handle_progress))
        .route("/orders/{id}/events", get(handle_order_events))
        .route("/orders/{id}/review", get(handle_review))
        .route("/orders/{id}/commit", post(handle_commit))
        .route("/catalog/search", get(handle_catalog_search))
        .route("/catalog/lookup", post(handle_catalog_lookup))
        .route("/items", get(handle_list_items).post(handle_create_item))
        .route("/items/merge", post(handle_merge_items))
        .route("/items/{id}", get(handle_get_item).delete(handle_delete_item))
        .route("/items/{id}/aliases", post(handle_add_alias))
        .route("/items/{id}/products", post(handle_add_product))
        .route("/items/{id}/top", post(handle_top_choice))
        .route("/aliases/{id}", delete(handle_delete_alias))
        .route("/products/{id}/promote", post(handle_promote))
        .route("/products/{id}", delete(handle_delete_product))
        .route("/history", get(handle_history).delete(handle_clear_history))
        .route("/history/{session_id}", delete(handle_delete_history))
        .layer(cors)
        .with_state(AppState { pipeline })
}

/// Periodically drop sessions idle longer than `order.session_ttl_secs`.
pub fn spawn_session_sweeper(pipeline: OrderPipeline) -> tokio::task::JoinHandle<()> {
    let ttl = pipeline.settings().session_ttl;
    let period = ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            pipeline.sessions().expire(ttl).await;
        }
    })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);

        if let Some(e) = err.downcast_ref::<StoreError>() {
            return match e {
                StoreError::Conflict { .. } => {
                    AppError::new(StatusCode::CONFLICT, "conflict", message)
                }
                StoreError::NotFound(_) => not_found(message),
                StoreError::Invalid(_) => bad_request(message),
            };
        }
        if let Some(e) = err.downcast_ref::<SessionError>() {
            return match e {
                SessionError::NotFound(_) => not_found(message),
                SessionError::WrongPhase { .. } => {
                    AppError::new(StatusCode::CONFLICT, "wrong_phase", message)
                }
                SessionError::UnknownProposal(_) => bad_request(message),
            };
        }
        if let Some(e) = err.downcast_ref::<ServiceError>() {
            return if e.is_auth() {
                AppError::new(StatusCode::UNAUTHORIZED, "reauth_required", message)
            } else {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
            };
        }

        tracing::error!(error = %message, "Request failed");
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Option<Event> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Event::default().event(name).data(json)),
        Err(e) => {
            tracing::warn!(event = name, error = %e, "Failed to serialize SSE event");
            None
        }
    }
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("heartbeat")
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Orders ============

#[derive(Serialize)]
struct StartOrderResponse {
    session_id: String,
}

async fn handle_start_order(State(state): State<AppState>) -> Json<StartOrderResponse> {
    let session = state.pipeline.start_session().await;
    Json(StartOrderResponse {
        session_id: session.id.clone(),
    })
}

async fn handle_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Progress> {
    Ok(Json(state.pipeline.progress(&id).await?))
}

/// Streams `progress` events until the session is ready, finished or
/// failed. A session silent for `order.stale_after_secs` is failed and
/// discarded.
async fn handle_order_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session = state.pipeline.session(&id).await?;
    let stale_after = state.pipeline.settings().stale_after;
    let pipeline = state.pipeline.clone();
    let mut changes = session.subscribe();

    let stream = async_stream::stream! {
        loop {
            let progress = session.progress().await;
            let finished = matches!(
                progress.phase,
                SessionPhase::Ready | SessionPhase::Committing | SessionPhase::Done | SessionPhase::Error
            );
            if let Some(event) = sse_event("progress", &progress) {
                yield Ok(event);
            }
            if finished {
                break;
            }

            match tokio::time::timeout(stale_after, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    session.fail(format!("No progress for {:?}; order abandoned", stale_after)).await;
                    pipeline.sessions().remove(&session.id).await;
                    if let Some(event) = sse_event("timeout", &session.progress().await) {
                        yield Ok(event);
                    }
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

#[derive(Serialize)]
struct ReviewResponse {
    session_id: String,
    phase: SessionPhase,
    proposals: Vec<ProposalItem>,
}

async fn handle_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ReviewResponse> {
    let session = state.pipeline.session(&id).await?;
    Ok(Json(ReviewResponse {
        session_id: session.id.clone(),
        phase: session.phase().await,
        proposals: session.proposals().await,
    }))
}

#[derive(Deserialize)]
struct CommitRequest {
    #[serde(default)]
    decisions: Vec<CommitDecision>,
}

async fn handle_commit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CommitRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let mut events = state.pipeline.commit(&id, body.decisions).await?;
    let stale_after = state.pipeline.settings().stale_after;
    let pipeline = state.pipeline.clone();

    let stream = async_stream::stream! {
        loop {
            match tokio::time::timeout(stale_after, events.recv()).await {
                Ok(Some(event)) => {
                    let last = event.is_final();
                    if let Some(sse) = sse_event(event.name(), &event) {
                        yield Ok(sse);
                    }
                    if last {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    let message = format!("No commit progress for {:?}; order abandoned", stale_after);
                    if let Ok(session) = pipeline.session(&id).await {
                        session.fail(message.clone()).await;
                    }
                    pipeline.sessions().remove(&id).await;
                    if let Some(sse) = sse_event("error", &CommitEvent::Error { message }) {
                        yield Ok(sse);
                    }
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

// ============ Catalog ============

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<CatalogProduct>,
}

async fn handle_catalog_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<SearchResponse> {
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let results = state.pipeline.search_catalog(&params.q).await?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Deserialize)]
struct LookupRequest {
    reference: String,
}

#[derive(Serialize)]
struct LookupResponse {
    product: CatalogProduct,
}

async fn handle_catalog_lookup(
    State(state): State<AppState>,
    Json(body): Json<LookupRequest>,
) -> ApiResult<LookupResponse> {
    if body.reference.trim().is_empty() {
        return Err(bad_request("reference must not be empty"));
    }
    let product = state
        .pipeline
        .lookup_product(&body.reference)
        .await?
        .ok_or_else(|| not_found(format!("no catalog product for '{}'", body.reference)))?;
    Ok(Json(LookupResponse { product }))
}

// ============ Preferences ============

#[derive(Serialize)]
struct ItemListResponse {
    items: Vec<GroceryItemDetail>,
}

async fn handle_list_items(State(state): State<AppState>) -> ApiResult<ItemListResponse> {
    let items = state.store().list_grocery_items().await?;
    Ok(Json(ItemListResponse { items }))
}

#[derive(Deserialize)]
struct CreateItemRequest {
    name: String,
}

async fn handle_create_item(
    State(state): State<AppState>,
    Json(body): Json<CreateItemRequest>,
) -> ApiResult<GroceryItem> {
    Ok(Json(create_grocery_item(state.store(), &body.name).await?))
}

async fn handle_get_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<GroceryItemDetail> {
    state
        .store()
        .get_grocery_item(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("grocery item {} not found", id)))
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted: u64,
}

fn deleted_or_404(deleted: bool, what: String) -> ApiResult<DeletedResponse> {
    if deleted {
        Ok(Json(DeletedResponse { deleted: 1 }))
    } else {
        Err(not_found(format!("{} not found", what)))
    }
}

async fn handle_delete_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<DeletedResponse> {
    let deleted = state.store().delete_grocery_item(id).await?;
    deleted_or_404(deleted, format!("grocery item {}", id))
}

#[derive(Deserialize)]
struct AliasRequest {
    alias: String,
}

async fn handle_add_alias(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AliasRequest>,
) -> ApiResult<Alias> {
    Ok(Json(add_alias(state.store(), id, &body.alias).await?))
}

async fn handle_delete_alias(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<DeletedResponse> {
    let deleted = state.store().delete_alias(id).await?;
    deleted_or_404(deleted, format!("alias {}", id))
}

#[derive(Deserialize)]
struct AddProductRequest {
    #[serde(flatten)]
    product: ProductInfo,
    #[serde(default)]
    rank: Option<i64>,
}

async fn handle_add_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AddProductRequest>,
) -> ApiResult<PreferredProduct> {
    Ok(Json(
        add_preferred_product(state.store(), id, &body.product, body.rank).await?,
    ))
}

async fn handle_top_choice(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ProductInfo>,
) -> ApiResult<PreferredProduct> {
    Ok(Json(make_top_choice(state.store(), id, &body).await?))
}

async fn handle_promote(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<PreferredProduct> {
    Ok(Json(promote_product(state.store(), id).await?))
}

async fn handle_delete_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<DeletedResponse> {
    let deleted = state.store().delete_preferred_product(id).await?;
    deleted_or_404(deleted, format!("preferred product {}", id))
}

#[derive(Deserialize)]
struct MergeRequest {
    source_id: i64,
    target_id: i64,
}

async fn handle_merge_items(
    State(state): State<AppState>,
    Json(body): Json<MergeRequest>,
) -> ApiResult<GroceryItemDetail> {
    Ok(Json(
        state
            .store()
            .merge_grocery_items(body.source_id, body.target_id)
            .await?,
    ))
}

// ============ History ============

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    200
}

#[derive(Serialize)]
struct HistoryResponse {
    sessions: Vec<SessionHistory>,
}

async fn handle_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<HistoryResponse> {
    let sessions = list_history(state.store(), params.limit.max(1)).await?;
    Ok(Json(HistoryResponse { sessions }))
}

async fn handle_clear_history(State(state): State<AppState>) -> ApiResult<DeletedResponse> {
    let deleted = clear_history(state.store()).await?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn handle_delete_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<DeletedResponse> {
    let deleted = delete_session_history(state.store(), &session_id).await?;
    Ok(Json(DeletedResponse { deleted }))
}
