// Integration tests for the catalog client against fake upstream servers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use model_gateway::config::UpstreamConfig;
use model_gateway::upstream::client::CatalogClient;

async fn start_server(app: Router) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    port
}

fn catalog(model_info_url: String, api_key: &str) -> CatalogClient {
    CatalogClient::new(
        &UpstreamConfig {
            download_url: String::new(),
            model_info_url,
            api_key: api_key.to_string(),
        },
        CancellationToken::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_get_model_version_parses_flexible_timestamps() {
    let app = Router::new().route(
        "/api/v1/model-versions/{id}",
        get(|| async {
            axum::Json(serde_json::json!({
                "id": 123,
                "modelId": 7,
                "name": "v1.0",
                "createdAt": "2025-04-14T02:31:00.353",
                "updatedAt": "2025-04-14T02:31:00.353Z",
                "baseModel": "SDXL 1.0",
                "model": {"name": "Foo", "type": "Checkpoint"},
                "files": [{"name": "Foo.safetensors", "primary": true, "scannedAt": null}],
                "downloadUrl": "https://u/abc"
            }))
        }),
    );
    let port = start_server(app).await;

    let client = catalog(
        format!("http://127.0.0.1:{port}/api/v1/model-versions/{{id}}"),
        "k",
    );
    let info = client.get_model_version(123).await.unwrap();

    assert_eq!(info.id, 123);
    assert_eq!(info.base_model, "SDXL 1.0");
    assert_eq!(info.model.kind.as_deref(), Some("Checkpoint"));
    assert_eq!(info.preferred_filename(), Some("Foo.safetensors"));
    assert_eq!(info.download_url, "https://u/abc");

    // Timezone-less timestamps are read as UTC, so both variants agree.
    assert_eq!(info.created_at, info.updated_at);
    assert!(info.created_at.is_some());
    assert!(info.files[0].scanned_at.is_none());
}

#[tokio::test]
async fn test_get_model_version_error_includes_status_and_snippet() {
    let app = Router::new().route(
        "/info/{id}",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "upstream exploded") }),
    );
    let port = start_server(app).await;

    let client = catalog(format!("http://127.0.0.1:{port}/info/{{id}}"), "k");
    let err = client.get_model_version(5).await.unwrap_err().to_string();

    assert!(err.contains("503"), "missing status in {err:?}");
    assert!(err.contains("upstream exploded"), "missing snippet in {err:?}");
}

#[tokio::test]
async fn test_download_names_file_from_content_disposition() {
    let app = Router::new().route(
        "/dl/abc",
        get(|| async {
            (
                [(
                    header::CONTENT_DISPOSITION,
                    r#"attachment; filename="Foo.safetensors""#,
                )],
                "BYTES",
            )
        }),
    );
    let port = start_server(app).await;
    let dir = tempfile::tempdir().unwrap();

    let client = catalog(String::new(), "k");
    client
        .download(
            &format!("http://127.0.0.1:{port}/dl/abc"),
            123,
            dir.path(),
        )
        .await
        .unwrap();

    let final_path = dir.path().join("123-Foo.safetensors");
    assert_eq!(std::fs::read(&final_path).unwrap(), b"BYTES");
    assert!(!dir.path().join("123-Foo.safetensors.part").exists());
}

#[tokio::test]
async fn test_download_defaults_filename_without_content_disposition() {
    let app = Router::new().route("/dl/x", get(|| async { "DATA" }));
    let port = start_server(app).await;
    let dir = tempfile::tempdir().unwrap();

    let client = catalog(String::new(), "k");
    client
        .download(&format!("http://127.0.0.1:{port}/dl/x"), 42, dir.path())
        .await
        .unwrap();

    assert!(dir.path().join("42-model.safetensors").exists());
}

#[tokio::test]
async fn test_download_skips_existing_non_empty_file() {
    let app = Router::new().route("/dl/x", get(|| async { "NEW CONTENT" }));
    let port = start_server(app).await;
    let dir = tempfile::tempdir().unwrap();

    std::fs::write(dir.path().join("42-model.safetensors"), b"OLD").unwrap();

    let client = catalog(String::new(), "k");
    client
        .download(&format!("http://127.0.0.1:{port}/dl/x"), 42, dir.path())
        .await
        .unwrap();

    // The existing file is left untouched.
    assert_eq!(
        std::fs::read(dir.path().join("42-model.safetensors")).unwrap(),
        b"OLD"
    );
}

#[tokio::test]
async fn test_download_failure_leaves_no_part_file() {
    let app = Router::new().route(
        "/dl/broken",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "disk on fire") }),
    );
    let port = start_server(app).await;
    let dir = tempfile::tempdir().unwrap();

    let client = catalog(String::new(), "k");
    let err = client
        .download(
            &format!("http://127.0.0.1:{port}/dl/broken"),
            9,
            dir.path(),
        )
        .await
        .unwrap_err()
        .to_string();

    assert!(err.contains("500"), "missing status in {err:?}");
    assert!(err.contains("disk on fire"), "missing snippet in {err:?}");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

type SeenAuth = Arc<Mutex<Option<String>>>;

async fn record_auth(State(seen): State<SeenAuth>, headers: HeaderMap) -> impl IntoResponse {
    *seen.lock() = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (
        [(header::CONTENT_DISPOSITION, r#"attachment; filename="f.bin""#)],
        "PAYLOAD",
    )
}

#[tokio::test]
async fn test_cross_host_redirect_strips_authorization() {
    // Second listener = different host:port, like a presigned bucket URL.
    let seen: SeenAuth = Arc::new(Mutex::new(None));
    let cdn = Router::new()
        .route("/signed/f.bin", get(record_auth))
        .with_state(seen.clone());
    let cdn_port = start_server(cdn).await;

    let origin = Router::new().route(
        "/dl/f",
        get(move || async move {
            (
                StatusCode::FOUND,
                [(
                    header::LOCATION,
                    format!("http://127.0.0.1:{cdn_port}/signed/f.bin"),
                )],
            )
        }),
    );
    let origin_port = start_server(origin).await;

    let dir = tempfile::tempdir().unwrap();
    let client = catalog(String::new(), "secret");
    client
        .download(
            &format!("http://127.0.0.1:{origin_port}/dl/f"),
            1,
            dir.path(),
        )
        .await
        .unwrap();

    assert_eq!(*seen.lock(), None, "token leaked to foreign host");
    assert_eq!(std::fs::read(dir.path().join("1-f.bin")).unwrap(), b"PAYLOAD");
}

#[tokio::test]
async fn test_same_host_redirect_keeps_authorization() {
    let seen: SeenAuth = Arc::new(Mutex::new(None));
    let app = Router::new()
        .route(
            "/dl/f",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/real/f.bin")]) }),
        )
        .route("/real/f.bin", get(record_auth))
        .with_state(seen.clone());
    let port = start_server(app).await;

    let dir = tempfile::tempdir().unwrap();
    let client = catalog(String::new(), "secret");
    client
        .download(&format!("http://127.0.0.1:{port}/dl/f"), 1, dir.path())
        .await
        .unwrap();

    assert_eq!(seen.lock().as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn test_redirect_loop_is_bounded() {
    let app = Router::new().route(
        "/loop",
        get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/loop")]) }),
    );
    let port = start_server(app).await;

    let dir = tempfile::tempdir().unwrap();
    let client = catalog(String::new(), "k");
    let err = client
        .download(&format!("http://127.0.0.1:{port}/loop"), 1, dir.path())
        .await
        .unwrap_err()
        .to_string();

    assert!(err.contains("too many redirects"), "got {err:?}");
}
