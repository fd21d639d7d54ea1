use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{Method, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use doc_rag::config::Settings;
use doc_rag::models::{
    ChatRequest, ChatResponse, Choice, DocumentListResponse, IndexStatus, Message,
    RemoveResponse, UploadResponse,
};
use doc_rag::rag::RagEngine;
use doc_rag::{logger, RagError};

#[derive(Parser, Debug)]
#[command(name = "doc-rag")]
#[command(about = "Document question answering server")]
struct Args {
    /// Settings file (TOML, YAML or JSON); RAG__* variables override it
    #[arg(short, long, env = "RAG_CONFIG")]
    config: Option<PathBuf>,
}

struct AppState {
    engine: RagEngine,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn error_response(e: RagError) -> (StatusCode, String) {
    let status = match &e {
        RagError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RagError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        RagError::DuplicateDocument(_) | RagError::DuplicateChunk(_) => StatusCode::CONFLICT,
        RagError::IndexAbsent => StatusCode::NOT_FOUND,
        RagError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RagError::BackendError(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", e);
    }
    (status, e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logger::init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;
    let bind_addr = settings.server.bind_addr.clone();
    let max_upload_bytes = settings.server.max_upload_bytes;

    tracing::info!("Index directory: {}", settings.index.dir.display());
    tracing::info!("Completion backend: {}", settings.completion.base_url);

    let engine = RagEngine::init(settings).await?;
    let state = Arc::new(AppState { engine });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completion_handler))
        .route(
            "/v1/documents",
            post(upload_documents_handler).get(list_documents_handler),
        )
        .route("/v1/documents/:filename", delete(remove_document_handler))
        .route("/v1/index/status", get(index_status_handler))
        .route("/api/health", get(health_check))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.engine.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn chat_completion_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    if request.stream == Some(true) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Streaming responses are not supported".to_string(),
        ));
    }

    let answer = state
        .engine
        .chat()
        .answer(&request.messages, request.temperature)
        .await
        .map_err(error_response)?;

    let model = request
        .model
        .unwrap_or_else(|| state.engine.settings().completion.model.clone());

    Ok(Json(ChatResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model,
        choices: vec![Choice {
            index: 0,
            message: Message::assistant(answer.response),
            finish_reason: Some("stop".to_string()),
        }],
        sources: answer.sources,
        context_used: Some(answer.context_used),
    }))
}

async fn upload_documents_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<UploadResponse> {
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid multipart body: {}", e)))?
    {
        // Only the final path component is kept
        let Some(filename) = field
            .file_name()
            .and_then(|name| FsPath::new(name).file_name())
            .map(|name| name.to_string_lossy().to_string())
        else {
            continue;
        };

        let data = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read {}: {}", filename, e)))?;
        files.push((filename, data.to_vec()));
    }

    if files.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No files uploaded".to_string()));
    }

    tracing::info!("Received {} files for indexing", files.len());
    let report = state
        .engine
        .manager()
        .ingest_batch(files)
        .await
        .map_err(error_response)?;

    Ok(Json(report))
}

async fn list_documents_handler(State(state): State<Arc<AppState>>) -> Json<DocumentListResponse> {
    Json(state.engine.index().filenames().await.into())
}

async fn remove_document_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> ApiResult<RemoveResponse> {
    let removed_chunks = state
        .engine
        .manager()
        .remove(&filename)
        .await
        .map_err(error_response)?;

    if removed_chunks == 0 {
        return Err((StatusCode::NOT_FOUND, format!("{} is not indexed", filename)));
    }

    Ok(Json(RemoveResponse {
        filename,
        removed_chunks,
    }))
}

async fn index_status_handler(State(state): State<Arc<AppState>>) -> Json<IndexStatus> {
    Json(state.engine.manager().status().await)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let completion_healthy = state.engine.completion().health_check().await;
    let index = state.engine.index();

    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "index": {
            "built": index.is_built().await,
            "chunks": index.len().await,
            "model": index.model_id(),
        },
        "services": {
            "completion": completion_healthy
        }
    }))
}
