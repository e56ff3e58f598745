//! HTTP surface: the `/api` routes over [`Services`].
//!
//! Handlers are thin: parse parameters, check the load gate, run the query
//! work on a blocking thread, serialize. Responses are gzip-compressed when
//! the client accepts it and CORS is wide open, matching the public
//! deployment.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use crate::error::QueryError;
use crate::ingest::LoadProgress;
use crate::query::{
    AvailabilityResponse, DiffResponse, IntersectResponse, LibrariesResponse, SearchHit,
    SearchResponse, Services, UniqueResponse,
};

/// Shared handler state.
pub struct AppState {
    pub services: Arc<Services>,
    pub progress: Arc<LoadProgress>,
}

type ApiError = (StatusCode, String);

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/search", get(search_handler))
        .route("/api/libraries", get(libraries_handler))
        .route("/api/availability", get(availability_handler))
        .route("/api/diff", get(diff_handler))
        .route("/api/intersect", get(intersect_handler))
        .route("/api/unique", get(unique_handler))
        .route("/api/search-debug", get(search_debug_handler))
        .route("/api/search-hardcover", get(search_hardcover_handler))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until SIGINT/SIGTERM.
pub async fn serve(bind: &str, state: Arc<AppState>) -> std::io::Result<()> {
    let app = router(state);
    tracing::info!(bind, "starting server");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to register SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            #[cfg(not(unix))]
            {
                ctrl_c.await.ok();
            }
            tracing::info!("shutting down on interrupt");
        })
        .await
}

/// Refuse queries until the load pipeline has finalized the index.
fn gate(state: &AppState) -> Result<(), ApiError> {
    if state.progress.is_ready() {
        Ok(())
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, state.progress.describe()))
    }
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
}

/// Run blocking query work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, QueryError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(internal(err)),
        Err(join) => Err(internal(join)),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    gate(&state)?;
    let services = Arc::clone(&state.services);
    let results = blocking(move || services.search(&params.q)).await?;
    Ok(Json(SearchResponse { results }))
}

async fn libraries_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LibrariesResponse>, ApiError> {
    gate(&state)?;
    Ok(Json(LibrariesResponse {
        libraries: state.services.libraries().all(),
    }))
}

#[derive(Deserialize)]
struct IdParams {
    #[serde(default)]
    id: String,
}

async fn availability_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IdParams>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    gate(&state)?;
    let id: u32 = params
        .id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid id".to_string()))?;
    let services = Arc::clone(&state.services);
    let report = blocking(move || services.availability(id)).await?;
    match report {
        Some(report) => Ok(Json(report)),
        None => Err((StatusCode::BAD_REQUEST, "invalid id".to_string())),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairParams {
    #[serde(default)]
    left_library_id: String,
    #[serde(default)]
    right_library_id: String,
}

async fn diff_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PairParams>,
) -> Result<Json<DiffResponse>, ApiError> {
    gate(&state)?;
    let services = Arc::clone(&state.services);
    run_library_pair(move || {
        services.diff(&params.left_library_id, &params.right_library_id)
    })
    .await
    .map(Json)
}

async fn intersect_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PairParams>,
) -> Result<Json<IntersectResponse>, ApiError> {
    gate(&state)?;
    let services = Arc::clone(&state.services);
    run_library_pair(move || {
        services.intersect(&params.left_library_id, &params.right_library_id)
    })
    .await
    .map(Json)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibraryParams {
    #[serde(default)]
    library_id: String,
}

async fn unique_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LibraryParams>,
) -> Result<Json<UniqueResponse>, ApiError> {
    gate(&state)?;
    let services = Arc::clone(&state.services);
    run_library_pair(move || services.unique(&params.library_id))
        .await
        .map(Json)
}

/// Shared error mapping for the comparison endpoints: an unknown library is
/// the caller's mistake, everything else is ours.
async fn run_library_pair<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, QueryError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(QueryError::UnknownLibrary { .. })) => {
            Err((StatusCode::BAD_REQUEST, "invalid library id".to_string()))
        }
        Ok(Err(err)) => Err(internal(err)),
        Err(join) => Err(internal(join)),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchDebugParams {
    #[serde(default)]
    ngram: String,
    #[serde(default)]
    media_id: String,
}

async fn search_debug_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchDebugParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&state)?;
    let id: u32 = params
        .media_id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid id".to_string()))?;
    let body = match state.services.index().posting_contains(&params.ngram, id) {
        None => serde_json::json!({ "ngramBitmapExists": false }),
        Some(contains) => serde_json::json!({ "mediaSetForNgram": contains }),
    };
    Ok(Json(body))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HardcoverParams {
    #[serde(default)]
    username: String,
    #[serde(default)]
    additional_filters: String,
}

async fn search_hardcover_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HardcoverParams>,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    gate(&state)?;
    if params.username.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Missing username".to_string()));
    }
    let services = Arc::clone(&state.services);
    match tokio::task::spawn_blocking(move || {
        services.search_bookshelf(&params.username, &params.additional_filters)
    })
    .await
    {
        Ok(Ok(results)) => Ok(Json(results)),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "bookshelf search failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to search media".to_string(),
            ))
        }
        Err(join) => Err(internal(join)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FormatTable, LibraryRegistry};
    use crate::index::SearchIndex;
    use crate::store::Kv;

    fn empty_state(ready: bool) -> Arc<AppState> {
        let dir = tempfile::TempDir::new().unwrap();
        let kv = Arc::new(Kv::open(&dir.path().join("catalog.redb")).unwrap());
        // Leak the TempDir so the store outlives the test state.
        std::mem::forget(dir);
        let index = Arc::new(SearchIndex::new());
        index.finalize();
        let services = Arc::new(Services::new(
            kv,
            Arc::new(LibraryRegistry::new()),
            Arc::new(FormatTable::new()),
            index,
        ));
        let progress = Arc::new(LoadProgress::new());
        if ready {
            progress.set_phase(crate::ingest::LoadPhase::Ready);
        }
        Arc::new(AppState { services, progress })
    }

    #[test]
    fn gate_refuses_until_ready() {
        let state = empty_state(false);
        let err = gate(&state).unwrap_err();
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.1.contains("loading"));

        let state = empty_state(true);
        assert!(gate(&state).is_ok());
    }

    #[test]
    fn router_builds() {
        let _router = router(empty_state(true));
    }
}
