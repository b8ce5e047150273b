use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json,
    Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    error::{Error, Result},
    search::{Attachment, DEFAULT_LIMIT},
    service::FileGuessr,
};

/// Largest request body accepted, sized for multimodal attachments.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const MAX_LIMIT: usize = 100;

type AppState = Arc<FileGuessr>;

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidQuery(_) | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::PathNotWatched(_) => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::ConcurrentJobRejected => StatusCode::CONFLICT,
            Error::Extraction { .. } | Error::FolderUnreadable { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::ModelUnavailable(_) | Error::BackendUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::ModelTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        } else {
            tracing::debug!(error = %self, kind = self.kind(), "request rejected");
        }
        let body = json!({ "error": self.to_string(), "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}

pub fn router(service: Arc<FileGuessr>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/search", get(search))
        .route("/search/multimodal", post(search_multimodal))
        .route("/index", post(start_index))
        .route("/index/status", get(index_status))
        .route("/folders", get(list_folders))
        .route("/folders/remove", post(remove_folder))
        .route("/clear", post(clear))
        .route("/file/preview", get(preview))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Serve until Ctrl+C.
pub async fn serve(service: Arc<FileGuessr>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn health(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.health().await)
}

async fn stats(State(service): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(service.stats().await?))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

async fn search(
    State(service): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse> {
    let response = service.search(&params.q, clamp_limit(params.limit)).await?;
    Ok(Json(response))
}

async fn search_multimodal(
    State(service): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let bad = |e: axum::extract::multipart::MultipartError| {
        Error::InvalidInput(format!("malformed multipart body: {e}"))
    };

    let mut query = String::new();
    let mut attachment = None;
    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("q") => query = field.text().await.map_err(bad)?,
            Some("file") => {
                let file_name = field
                    .file_name()
                    .filter(|n| !n.is_empty())
                    .unwrap_or("attachment")
                    .to_string();
                let bytes = field.bytes().await.map_err(bad)?;
                attachment = Some(Attachment {
                    file_name,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let attachment =
        attachment.ok_or_else(|| Error::InvalidInput("file is required".into()))?;
    let response = service
        .search_multimodal(&query, attachment, DEFAULT_LIMIT)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct FolderRequest {
    folder_path: PathBuf,
}

async fn start_index(
    State(service): State<AppState>,
    Json(request): Json<FolderRequest>,
) -> Result<impl IntoResponse> {
    let job_id = service.start_index(&request.folder_path)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Indexing started",
            "folder": request.folder_path,
            "job_id": job_id,
        })),
    ))
}

async fn index_status(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.index_status())
}

async fn list_folders(State(service): State<AppState>) -> Result<impl IntoResponse> {
    let folders: Vec<PathBuf> = service
        .list_folders()?
        .into_iter()
        .map(|f| f.path)
        .collect();
    Ok(Json(json!({ "folders": folders })))
}

async fn remove_folder(
    State(service): State<AppState>,
    Json(request): Json<FolderRequest>,
) -> Result<impl IntoResponse> {
    let removal = service.remove_folder(&request.folder_path).await?;
    Ok(Json(json!({
        "message": format!("Removed: {}", removal.folder.display()),
        "folder": removal.folder,
        "removed_records": removal.removed_records,
        "cancelled_job": removal.cancelled_job,
    })))
}

async fn clear(State(service): State<AppState>) -> Result<impl IntoResponse> {
    service.clear().await?;
    Ok(Json(json!({ "message": "Index cleared" })))
}

#[derive(Debug, Deserialize)]
struct PreviewParams {
    path: PathBuf,
}

async fn preview(
    State(service): State<AppState>,
    Query(params): Query<PreviewParams>,
) -> Result<impl IntoResponse> {
    let preview = service.preview(&params.path).await?;
    Ok(([(header::CONTENT_TYPE, preview.mime)], preview.bytes))
}
