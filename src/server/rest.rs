// REST handlers — generation proxying, installed-asset listings, and the
// download enqueue endpoint.

use std::path::Path;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::downloader::{DownloadJob, DownloadRequest, EnqueueError};
use crate::upstream::client::CatalogClient;
use crate::upstream::paths::library_roots;
use crate::util::new_hex_id;
use crate::worker::{AppliedLora, ModelKind};

use super::handler::GatewayState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: impl Into<String>, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: u16,
    pub timestamp: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageRequest {
    pub positive_prompt: String,
    pub negative_prompt: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageToVideoRequest {
    pub positive_prompt: String,
    pub negative_prompt: String,
    /// Base64-encoded source image.
    pub image: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetModelRequest {
    pub model_path: String,
    /// `t2i` or `i2v`; empty defaults to `t2i`.
    pub model_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelResponse {
    pub model_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentModelResponse {
    pub model_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearModelResponse {
    pub model_path: String,
    pub loras: Vec<LoraDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoraDto {
    pub weight: f32,
    pub path: String,
    #[serde(default)]
    pub trigger_words: Option<String>,
}

impl LoraDto {
    fn plain(lora: &AppliedLora) -> Self {
        Self {
            weight: lora.weight,
            path: lora.path.clone(),
            trigger_words: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListModelsResponse {
    pub model_paths: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ListLorasResponse {
    pub lorapaths: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub job_id: String,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: StatusCode::OK.as_u16(),
        timestamp: chrono::Utc::now().timestamp(),
    })
}

/// POST /generateimage — proxy to the worker, stream the image back.
pub async fn generate_image(
    State(state): State<GatewayState>,
    Json(req): Json<ImageRequest>,
) -> Response {
    info!(
        "generate requested positiveLen={} negativeLen={}",
        req.positive_prompt.len(),
        req.negative_prompt.len()
    );

    match state
        .worker
        .generate_image(&req.positive_prompt, &req.negative_prompt)
        .await
    {
        Ok(image) => {
            info!(
                "generate completed mimeType={} bytes={}",
                image.mime_type,
                image.bytes.len()
            );
            media_response(&image.mime_type, &image.filename_hint, image.bytes)
        }
        Err(err) => {
            error!("generate failed: {}", err);
            error_response(
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "worker failed to generate image",
            )
        }
    }
}

/// POST /generateimagetovideo
pub async fn generate_image_to_video(
    State(state): State<GatewayState>,
    Json(req): Json<ImageToVideoRequest>,
) -> Response {
    let image = match BASE64.decode(req.image.as_bytes()) {
        Ok(image) => image,
        Err(err) => {
            warn!("invalid image payload: {}", err);
            return error_response(StatusCode::BAD_REQUEST, err.to_string(), "invalid body");
        }
    };

    match state
        .worker
        .generate_image_to_video(&image, &req.positive_prompt, &req.negative_prompt)
        .await
    {
        Ok(video) => {
            info!(
                "generate video completed mimeType={} bytes={}",
                video.mime_type,
                video.bytes.len()
            );
            media_response(&video.mime_type, &video.filename_hint, video.bytes)
        }
        Err(err) => {
            error!("generate video failed: {}", err);
            error_response(
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "worker failed to generate video",
            )
        }
    }
}

fn media_response(mime_type: &str, filename_hint: &str, bytes: Vec<u8>) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = mime_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = format!("inline; filename={filename_hint}").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    (StatusCode::OK, headers, bytes).into_response()
}

/// GET /models — installed checkpoints under the configured library root.
pub async fn list_models(State(state): State<GatewayState>) -> Json<ListModelsResponse> {
    let model_paths = match library_roots(&state.base_dir) {
        Some((models_root, _)) => list_safetensors(&models_root),
        None => Vec::new(),
    };
    info!("scan models completed count={}", model_paths.len());
    Json(ListModelsResponse { model_paths })
}

/// GET /loras
pub async fn list_loras(State(state): State<GatewayState>) -> Json<ListLorasResponse> {
    let lorapaths = match library_roots(&state.base_dir) {
        Some((_, loras_root)) => list_safetensors(&loras_root),
        None => Vec::new(),
    };
    info!("scan loras completed count={}", lorapaths.len());
    Json(ListLorasResponse { lorapaths })
}

fn list_safetensors(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().ends_with(".safetensors")
        {
            files.push(entry.path().display().to_string());
        }
    }
    files.sort();
    files
}

/// POST /setmodel
pub async fn set_model(
    State(state): State<GatewayState>,
    Json(req): Json<SetModelRequest>,
) -> Response {
    let kind = match ModelKind::parse(&req.model_type) {
        Ok(kind) => kind,
        Err(err) => {
            warn!("invalid modelType {:?}", req.model_type);
            return error_response(StatusCode::BAD_REQUEST, err.to_string(), "invalid modelType");
        }
    };

    info!(
        "set model requested modelPath={} modelType={}",
        req.model_path, req.model_type
    );
    match state.worker.set_model(&req.model_path, kind).await {
        Ok(model_path) => Json(SetModelResponse { model_path }).into_response(),
        Err(err) => {
            error!("set model failed: {}", err);
            error_response(
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "worker failed to set model",
            )
        }
    }
}

/// POST /setloras — apply loras, then enrich the reply with trigger words
/// looked up from the catalog via the version id encoded in each filename.
pub async fn set_loras(
    State(state): State<GatewayState>,
    Json(req): Json<Vec<LoraDto>>,
) -> Response {
    info!("set loras requested count={}", req.len());

    let mut wanted = Vec::with_capacity(req.len());
    for lora in &req {
        if lora.weight < 0.1 {
            warn!(
                "invalid lora weight path={} weight={}",
                lora.path, lora.weight
            );
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid lora weight",
                "LoRA weight must be >= 0.1",
            );
        }
        wanted.push(AppliedLora {
            path: lora.path.clone(),
            weight: lora.weight,
        });
    }

    let applied = match state.worker.set_loras(&wanted).await {
        Ok(applied) => applied,
        Err(err) => {
            error!("set loras failed: {}", err);
            return error_response(
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "worker failed to apply loras",
            );
        }
    };

    let catalog = state.downloader.catalog();
    let mut out = Vec::with_capacity(applied.len());
    for lora in &applied {
        out.push(LoraDto {
            weight: lora.weight,
            path: lora.path.clone(),
            trigger_words: trigger_words_for(catalog, &lora.path).await,
        });
    }

    info!(
        "set loras completed requested={} applied={}",
        wanted.len(),
        out.len()
    );
    Json(out).into_response()
}

/// Best-effort trigger-word lookup: downloaded loras are named
/// `<version_id>-<stem>`, so the id before the first dash keys the catalog.
async fn trigger_words_for(catalog: &CatalogClient, path: &str) -> Option<String> {
    let stem = Path::new(path).file_stem()?.to_str()?;
    let version_id = stem.split('-').next()?.parse::<i64>().ok()?;

    let info = catalog.get_model_version(version_id).await.ok()?;
    if info.trained_words.is_empty() {
        return None;
    }
    Some(info.trained_words.join(","))
}

/// GET /currentmodel
pub async fn current_model(State(state): State<GatewayState>) -> Response {
    match state.worker.current_model().await {
        Ok(model_path) => Json(CurrentModelResponse { model_path }).into_response(),
        Err(err) => {
            error!("get current model failed: {}", err);
            error_response(
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "worker failed to get current model",
            )
        }
    }
}

/// GET /currentloras
pub async fn current_loras(State(state): State<GatewayState>) -> Response {
    match state.worker.current_loras().await {
        Ok(loras) => Json(loras.iter().map(LoraDto::plain).collect::<Vec<_>>()).into_response(),
        Err(err) => {
            error!("get current loras failed: {}", err);
            error_response(
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "worker failed to get current loras",
            )
        }
    }
}

/// POST /clearmodel
pub async fn clear_model(State(state): State<GatewayState>) -> Response {
    info!("clear model requested");
    match state.worker.clear_model().await {
        Ok((model_path, loras)) => Json(ClearModelResponse {
            model_path,
            loras: loras.iter().map(LoraDto::plain).collect(),
        })
        .into_response(),
        Err(err) => {
            error!("clear model failed: {}", err);
            error_response(
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "worker failed to clear model",
            )
        }
    }
}

/// POST /clearloras
pub async fn clear_loras(State(state): State<GatewayState>) -> Response {
    info!("clear loras requested");
    match state.worker.clear_loras().await {
        Ok(loras) => Json(loras.iter().map(LoraDto::plain).collect::<Vec<_>>()).into_response(),
        Err(err) => {
            error!("clear loras failed: {}", err);
            error_response(
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "worker failed to clear loras",
            )
        }
    }
}

/// POST /download — validate, mint a job id, hand off to the orchestrator.
pub async fn download_model(
    State(state): State<GatewayState>,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!("invalid download body: {}", rejection);
            return error_response(
                StatusCode::BAD_REQUEST,
                rejection.to_string(),
                "invalid body",
            );
        }
    };

    if req.client_id.trim().is_empty() {
        warn!("missing clientId");
        return error_response(
            StatusCode::BAD_REQUEST,
            "clientId is required",
            "missing clientId",
        );
    }
    if req.model_version_id <= 0 {
        warn!("invalid modelVersionId {}", req.model_version_id);
        return error_response(
            StatusCode::BAD_REQUEST,
            "modelVersionId must be > 0",
            "invalid modelVersionId",
        );
    }

    let job_id = new_hex_id();
    info!(
        "download enqueue requested jobId={} clientId={} modelVersionId={}",
        job_id, req.client_id, req.model_version_id
    );

    let result = state.downloader.enqueue(DownloadJob {
        job_id: job_id.clone(),
        client_id: req.client_id,
        model_version_id: req.model_version_id,
    });

    match result {
        Ok(()) => (StatusCode::ACCEPTED, Json(DownloadResponse { job_id })).into_response(),
        Err(EnqueueError::AlreadyQueued(existing)) => {
            info!("download already queued existingJobId={}", existing);
            (
                StatusCode::ACCEPTED,
                Json(DownloadResponse { job_id: existing }),
            )
                .into_response()
        }
        Err(err @ EnqueueError::QueueFull) => {
            warn!("download enqueue failed: {}", err);
            error_response(
                StatusCode::TOO_MANY_REQUESTS,
                err.to_string(),
                "failed to enqueue download",
            )
        }
        Err(err @ EnqueueError::ShuttingDown) => {
            warn!("download enqueue failed: {}", err);
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                err.to_string(),
                "failed to enqueue download",
            )
        }
    }
}
