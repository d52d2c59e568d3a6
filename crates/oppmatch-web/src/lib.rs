//! Axum host layer for the Opportunity Match Server.
//!
//! Serialization, pagination link URLs and status mapping live here; all
//! matching logic is in `oppmatch-engine`. The engine is process-wide
//! mutable state, so it sits behind a readers-writer lock: ingestion
//! handlers take the write guard, query handlers the read guard.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use oppmatch_core::{IngestOutcome, OpportunityInput, RejectedRecord, UserInput};
use oppmatch_engine::{paginate, EngineConfig, MatchEngine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppmatch-web";

const DEFAULT_PAGE_SIZE: usize = 10;

pub struct AppState {
    pub engine: RwLock<MatchEngine>,
    pub server_id: Uuid,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            engine: RwLock::new(MatchEngine::new(config)),
            server_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
struct PageQuery {
    page_num: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct PaginationLinks {
    previous: Option<String>,
    next: Option<String>,
}

#[derive(Debug, Serialize)]
struct PageResponse<T> {
    data: Vec<T>,
    total: usize,
    page_size: usize,
    pagination: PaginationLinks,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(heartbeat_handler))
        .route("/matches", get(matches_handler))
        .route("/matches/org/{org_name}", get(matches_by_org_handler))
        .route("/matches/user/{user_id}", get(matches_by_user_handler))
        .route(
            "/opportunities",
            post(add_opportunities_handler).get(opportunities_handler),
        )
        .route("/keywords", get(keywords_handler))
        .route("/users", post(add_users_handler).get(users_handler))
        .route("/orgs", get(orgs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("OPPMATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(EngineConfig::from_env());
    let cutoff = state.engine.read().await.config().score_cutoff;
    info!(port, score_cutoff = cutoff, "opportunity match server listening");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn heartbeat_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Opportunity Match Server",
        "server_id": state.server_id,
    }))
}

async fn matches_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let rows = state.engine.read().await.list_matches(None, None);
    page_response(&rows, "/matches", &query)
}

async fn matches_by_org_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(org_name): AxumPath<String>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let rows = state.engine.read().await.list_matches(Some(&org_name), None);
    page_response(&rows, &format!("/matches/org/{org_name}"), &query)
}

async fn matches_by_user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let rows = state.engine.read().await.list_matches(None, Some(&user_id));
    page_response(&rows, &format!("/matches/user/{user_id}"), &query)
}

async fn add_opportunities_handler(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<Vec<serde_json::Value>>,
) -> impl IntoResponse {
    let (inputs, indices, rejected) = decode_batch::<OpportunityInput>(raw);
    let outcome = state.engine.write().await.add_opportunities(&inputs);
    Json(merge_outcome(outcome, &indices, rejected))
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let opportunities = state.engine.read().await.list_opportunities();
    page_response(&opportunities, "/opportunities", &query)
}

async fn keywords_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let keywords = state.engine.read().await.list_keywords();
    page_response(&keywords, "/keywords", &query)
}

async fn add_users_handler(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<Vec<serde_json::Value>>,
) -> impl IntoResponse {
    let (inputs, indices, rejected) = decode_batch::<UserInput>(raw);
    let outcome = state.engine.write().await.add_users(&inputs);
    Json(merge_outcome(outcome, &indices, rejected))
}

async fn users_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let users = state.engine.read().await.list_users();
    page_response(&users, "/users", &query)
}

async fn orgs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let orgs = state.engine.read().await.list_organizations();
    page_response(&orgs, "/orgs", &query)
}

/// Deserializes each batch element independently so one malformed record
/// rejects only itself. Returns the decoded inputs, their original indices,
/// and the decode-time rejections.
fn decode_batch<T: DeserializeOwned>(
    raw: Vec<serde_json::Value>,
) -> (Vec<T>, Vec<usize>, Vec<RejectedRecord>) {
    let mut inputs = Vec::new();
    let mut indices = Vec::new();
    let mut rejected = Vec::new();
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<T>(value) {
            Ok(input) => {
                indices.push(index);
                inputs.push(input);
            }
            Err(err) => rejected.push(RejectedRecord {
                index,
                reason: format!("malformed record: {err}"),
            }),
        }
    }
    (inputs, indices, rejected)
}

/// Remaps engine rejection indices back to positions in the original JSON
/// array and folds in the decode-time rejections.
fn merge_outcome(
    mut outcome: IngestOutcome,
    indices: &[usize],
    mut decode_rejected: Vec<RejectedRecord>,
) -> IngestOutcome {
    for record in &mut outcome.rejected {
        record.index = indices[record.index];
    }
    outcome.rejected.append(&mut decode_rejected);
    outcome.rejected.sort_by_key(|record| record.index);
    outcome
}

fn page_response<T: Clone + Serialize>(
    items: &[T],
    base_path: &str,
    query: &PageQuery,
) -> Json<PageResponse<T>> {
    let page_num = query.page_num.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    let page = paginate(items, page_num, page_size);
    let link = |p: usize| format!("{base_path}?page_num={p}&page_size={page_size}");
    Json(PageResponse {
        pagination: PaginationLinks {
            previous: page.previous_page.map(link),
            next: page.next_page.map(link),
        },
        data: page.data,
        total: page.total,
        page_size: page.page_size,
    })
}
