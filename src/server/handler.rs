// Axum server assembly — shared state, routes, CORS, request logging, and a
// start/shutdown handle for the embedding process.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::downloader::DownloaderService;
use crate::hub::Hub;
use crate::util::new_hex_id;
use crate::worker::GenerationWorker;

use super::{rest, ws};

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct GatewayState {
    pub hub: Arc<Hub>,
    pub downloader: Arc<DownloaderService>,
    pub worker: Arc<dyn GenerationWorker>,
    pub base_dir: String,
}

pub struct GatewayServer {
    port: u16,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl GatewayServer {
    /// Bind and serve. Pass port 0 to pick a free port (tests do).
    pub async fn start(state: GatewayState, port: u16, allowed_origins: &str) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = router(state, allowed_origins)?;

        info!(
            "api starting port={} allowedOrigins={}",
            port, allowed_origins
        );

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and finish in-flight requests.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn router(state: GatewayState, allowed_origins: &str) -> Result<Router> {
    let allowed_origins = allowed_origins.trim();
    let cors = if allowed_origins.is_empty() || allowed_origins == "*" {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(allowed_origins.parse::<HeaderValue>()?)
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                header::ACCEPT,
                header::ORIGIN,
            ])
    };

    Ok(Router::new()
        .route("/health", get(rest::health))
        .route("/generateimage", post(rest::generate_image))
        .route("/generateimagetovideo", post(rest::generate_image_to_video))
        .route("/models", get(rest::list_models))
        .route("/loras", get(rest::list_loras))
        .route("/setmodel", post(rest::set_model))
        .route("/setloras", post(rest::set_loras))
        .route("/currentmodel", get(rest::current_model))
        .route("/currentloras", get(rest::current_loras))
        .route("/clearmodel", post(rest::clear_model))
        .route("/clearloras", post(rest::clear_loras))
        .route("/download", post(rest::download_model))
        .route("/ws", get(ws::notifications_without_id))
        .route("/ws/{id}", get(ws::notifications))
        .layer(cors)
        .layer(axum::middleware::from_fn(request_log))
        .with_state(state))
}

/// Tag every request with an id and log start/completion with duration.
async fn request_log(req: Request, next: Next) -> Response {
    let req_id = new_hex_id();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    debug!("request started reqId={} {} {}", req_id, method, path);

    let mut resp = next.run(req).await;
    if let Ok(value) = req_id.parse::<HeaderValue>() {
        resp.headers_mut().insert("x-request-id", value);
    }

    info!(
        "request completed reqId={} {} {} status={} dur={:?}",
        req_id,
        method,
        path,
        resp.status().as_u16(),
        start.elapsed()
    );
    resp
}
