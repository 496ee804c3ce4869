//! HTTP API for uploading, analyzing and querying medical documents.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/health` | Status, version, configured components |
//! | `POST` | `/api/upload` | Multipart upload (field `file`) |
//! | `POST` | `/api/analyze/{id}` | Run the indexing pipeline on an uploaded document |
//! | `POST` | `/api/chat` | Answer a question from a ready document |
//! | `POST` | `/api/chat/stream` | Same, as Server-Sent Events (`token`… then `done` or `error`) |
//! | `GET`  | `/api/documents` | List documents |
//! | `GET`  | `/api/documents/{id}` | One document with its collection info |
//! | `DELETE` | `/api/documents/{id}` | Remove file, collection and record (409 while analyzing) |
//! | `DELETE` | `/api/documents` | Remove every document and collection |
//! | `GET`  | `/ws` | WebSocket stream of progress events (JSON text frames) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document 42 not found" } }
//! ```
//!
//! # Progress fan-out
//!
//! Each pipeline run reports onto its own channel; a forwarding task
//! republishes the events on a broadcast hub that every WebSocket client
//! subscribes to. Runs are spawned so that a disconnected HTTP client
//! does not cancel them.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::PipelineError;
use crate::index::collection_name;
use crate::models::{CollectionInfo, DocumentRecord};
use crate::pipeline::PipelineContext;
use crate::progress::{ChannelProgress, ProgressEvent, ProgressReporter, Stage};
use crate::registry::{upload_path, DocumentRegistry, RegistryError};

const HUB_CAPACITY: usize = 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<PipelineContext>,
    pub registry: Arc<DocumentRegistry>,
    pub hub: broadcast::Sender<ProgressEvent>,
}

impl AppState {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let (hub, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            ctx,
            registry: Arc::new(DocumentRegistry::new()),
            hub,
        }
    }

    /// A reporter for one run whose events end up on the hub.
    fn run_reporter(&self, document_id: &str) -> ChannelProgress {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let hub = self.hub.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // no subscribers is fine
                let _ = hub.send(event);
            }
        });
        ChannelProgress::for_document(document_id, tx)
    }
}

/// Starts the server with production clients built from `config`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = PipelineContext::from_config(config.clone())?;
    run_server_with_context(Arc::new(ctx)).await
}

/// Starts the server on `[server].bind` with an already wired context.
pub async fn run_server_with_context(ctx: Arc<PipelineContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    tokio::fs::create_dir_all(&ctx.config.server.upload_dir).await?;

    let app = router(AppState::new(ctx));

    tracing::info!(bind = %bind_addr, "medical RAG server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // multipart framing on top of the file itself
    let body_limit = state.ctx.config.server.max_file_size as usize + 1024 * 1024;

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/upload", post(handle_upload))
        .route("/api/analyze/{id}", post(handle_analyze))
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/stream", post(handle_chat_stream))
        .route(
            "/api/documents",
            get(handle_list_documents).delete(handle_delete_all),
        )
        .route(
            "/api/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/ws", get(handle_ws))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
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

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => not_found(err.to_string()),
            RegistryError::AlreadyAnalyzing(_) => {
                app_error(StatusCode::CONFLICT, "already_analyzing", err.to_string())
            }
            RegistryError::NotReady(..) => app_error(StatusCode::BAD_REQUEST, "not_ready", err.to_string()),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::MissingCredentials { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Rasterize(crate::rasterize::RasterizeError::UnsupportedInput(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            PipelineError::NoContentExtracted => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        app_error(status, err.code(), err.to_string())
    }
}

// ============ GET /api/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    store: String,
    vision_configured: bool,
    embeddings_configured: bool,
    chat_configured: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: "memory".to_string(),
        vision_configured: state.ctx.vision.is_some(),
        embeddings_configured: state.ctx.embedder.is_some(),
        chat_configured: state.ctx.chat.is_some(),
    })
}

// ============ POST /api/upload ============

#[derive(Serialize)]
struct UploadResponse {
    document_id: String,
    filename: String,
    file_size: u64,
    status: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let server = &state.ctx.config.server;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|n| n.to_string())
            .ok_or_else(|| bad_request("file field has no filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("could not read upload: {}", e)))?;
        upload = Some((filename, bytes));
        break;
    }
    let (filename, bytes) = upload.ok_or_else(|| bad_request("missing multipart field: file"))?;

    let extension = std::path::Path::new(&filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default();
    if !server
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    {
        return Err(app_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_extension",
            format!(
                "extension {:?} not allowed (allowed: {})",
                extension,
                server.allowed_extensions.join(", ")
            ),
        ));
    }

    let file_size = bytes.len() as u64;
    if file_size > server.max_file_size {
        return Err(app_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "file_too_large",
            format!(
                "file is {} bytes, maximum is {} bytes",
                file_size, server.max_file_size
            ),
        ));
    }
    if file_size == 0 {
        return Err(bad_request("uploaded file is empty"));
    }

    let document_id = uuid::Uuid::new_v4().to_string();
    let path = upload_path(&server.upload_dir, &document_id, &filename);
    tokio::fs::create_dir_all(&server.upload_dir)
        .await
        .map_err(|e| internal(format!("cannot create upload dir: {}", e)))?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| internal(format!("cannot store upload: {}", e)))?;

    state
        .registry
        .insert(DocumentRecord::new(
            document_id.clone(),
            filename.clone(),
            path,
            file_size,
        ))
        .await;

    tracing::info!(document_id = %document_id, filename = %filename, file_size, "document uploaded");
    let _ = state.hub.send(
        ProgressEvent::success(Stage::Upload, format!("{} uploaded", filename))
            .with_details(json!({ "file_size": file_size }))
            .for_document(&document_id),
    );

    Ok(Json(UploadResponse {
        document_id,
        filename,
        file_size,
        status: "uploaded".to_string(),
    }))
}

// ============ POST /api/analyze/{id} ============

#[derive(Serialize)]
struct AnalyzeResponse {
    document_id: String,
    status: String,
    collection_name: String,
    pages: usize,
    total_chunks: usize,
    degraded_pages: Vec<usize>,
}

async fn handle_analyze(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AnalyzeResponse>, AppError> {
    let record = state.registry.begin_analysis(&id).await?;

    let run_state = state.clone();
    let run = tokio::spawn(async move {
        let reporter = run_state.run_reporter(&record.document_id);
        let result = run_state
            .ctx
            .analyze_document(&record.document_id, &record.file_path, &reporter)
            .await;
        match &result {
            Ok(report) => {
                run_state
                    .registry
                    .mark_ready(
                        &record.document_id,
                        report.collection_name.clone(),
                        report.total_chunks,
                    )
                    .await
            }
            Err(e) => {
                tracing::error!(document_id = %record.document_id, error = %e, "analysis failed");
                reporter.report(ProgressEvent::error(Stage::Complete, e.to_string()));
                run_state
                    .registry
                    .mark_error(&record.document_id, e.to_string())
                    .await
            }
        }
        result
    });

    let report = match run.await {
        Ok(result) => result?,
        Err(e) => {
            state.registry.mark_error(&id, e.to_string()).await;
            return Err(internal(format!("analysis task failed: {}", e)));
        }
    };

    Ok(Json(AnalyzeResponse {
        document_id: id,
        status: "ready".to_string(),
        collection_name: report.collection_name,
        pages: report.pages,
        total_chunks: report.total_chunks,
        degraded_pages: report.degraded_pages.iter().map(|(page, _)| *page).collect(),
    }))
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    question: String,
    document_id: String,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    document_id: String,
    sources: Vec<crate::models::ScoredPassage>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    state.registry.require_ready(&req.document_id).await?;

    let run_state = state.clone();
    let document_id = req.document_id.clone();
    let question = req.question.clone();
    let answer = tokio::spawn(async move {
        let reporter = run_state.run_reporter(&document_id);
        run_state.ctx.ask(&document_id, &question, &reporter).await
    })
    .await
    .map_err(|e| internal(format!("chat task failed: {}", e)))??;

    Ok(Json(ChatResponse {
        response: answer.response,
        document_id: req.document_id,
        sources: answer.sources,
    }))
}

// ============ POST /api/chat/stream ============

fn token_event(token: &str) -> Event {
    Event::default()
        .event("token")
        .json_data(json!({ "token": token }))
        .unwrap_or_else(|_| Event::default().event("token").data(token))
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    state.registry.require_ready(&req.document_id).await?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();

    tokio::spawn(async move {
        let (token_tx, mut token_rx) = mpsc::unbounded_channel::<String>();
        let forward_tx = events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(token) = token_rx.recv().await {
                let _ = forward_tx.send(token_event(&token));
            }
        });

        let reporter = state.run_reporter(&req.document_id);
        let result = state
            .ctx
            .ask_streaming(&req.document_id, &req.question, &token_tx, &reporter)
            .await;
        drop(token_tx);
        let _ = forwarder.await;

        let final_event = match result {
            Ok(outcome) => {
                let degraded = outcome.is_degraded();
                let answer = outcome.into_value();
                Event::default()
                    .event("done")
                    .json_data(json!({
                        "document_id": req.document_id,
                        "response": answer.response,
                        "sources": answer.sources,
                        "degraded": degraded,
                    }))
                    .unwrap_or_else(|_| Event::default().event("done"))
            }
            Err(e) => {
                tracing::error!(document_id = %req.document_id, error = %e, "streamed chat failed");
                Event::default()
                    .event("error")
                    .json_data(json!({ "code": e.code(), "message": e.to_string() }))
                    .unwrap_or_else(|_| Event::default().event("error"))
            }
        };
        let _ = events_tx.send(final_event);
    });

    let stream = async_stream::stream! {
        while let Some(event) = events_rx.recv().await {
            yield Ok::<Event, Infallible>(event);
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ /api/documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentRecord>,
    total: usize,
}

async fn handle_list_documents(State(state): State<AppState>) -> Json<DocumentListResponse> {
    let documents = state.registry.list().await;
    let total = documents.len();
    Json(DocumentListResponse { documents, total })
}

#[derive(Serialize)]
struct DocumentResponse {
    document: DocumentRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection_info: Option<CollectionInfo>,
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let document = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| not_found(format!("document {} not found", id)))?;

    let collection_info = match (&document.collection_name, state.ctx.index_manager()) {
        (Some(name), Ok(index)) => index.info(name).await,
        _ => None,
    };

    Ok(Json(DocumentResponse {
        document,
        collection_info,
    }))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = state.registry.remove_idle(&id).await?;

    if let Err(e) = tokio::fs::remove_file(&record.file_path).await {
        tracing::warn!(path = %record.file_path.display(), error = %e, "could not remove upload");
    }
    // Collections only exist when an embedder was configured.
    let collection_deleted = match state.ctx.index_manager() {
        Ok(index) => index.delete(&collection_name(&id)).await,
        Err(_) => false,
    };

    tracing::info!(document_id = %id, collection_deleted, "document deleted");
    Ok(Json(json!({
        "document_id": id,
        "deleted": true,
        "collection_deleted": collection_deleted,
    })))
}

async fn handle_delete_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    let records = state.registry.clear().await;
    for record in &records {
        if let Err(e) = tokio::fs::remove_file(&record.file_path).await {
            tracing::debug!(path = %record.file_path.display(), error = %e, "could not remove upload");
        }
    }
    let deleted_collections = match state.ctx.index_manager() {
        Ok(index) => index.delete_all().await,
        Err(_) => 0,
    };

    tracing::info!(documents = records.len(), deleted_collections, "cleanup done");
    Json(json!({
        "deleted_documents": records.len(),
        "deleted_collections": deleted_collections,
    }))
}

// ============ GET /ws ============

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let events = state.hub.subscribe();
    ws.on_upgrade(move |socket| forward_progress(socket, events))
}

async fn forward_progress(mut socket: WebSocket, mut events: broadcast::Receiver<ProgressEvent>) {
    tracing::debug!("progress listener connected");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress listener lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("progress listener disconnected");
}
