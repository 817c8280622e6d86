use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::ws::rejection::WebSocketUpgradeRejection,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use parley_shared::protocol::download_url;
use parley_shared::token::TokenService;
use parley_shared::types::Identity;
use parley_store::{FileAvailability, FileRecord, FileRegistry};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::credentials::CredentialStore;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::ws;

/// Multipart framing allowance on top of the raw file size.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub registry: Arc<FileRegistry>,
    pub tokens: Arc<TokenService>,
    pub credentials: Arc<CredentialStore>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/login", post(login))
        .route("/upload", post(upload))
        .route("/download/:id", get(download))
        .route("/files", get(list_files))
        .route("/file-info/:id", get(file_info))
        .route("/verify-files", post(verify_files))
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(body_limit(state.config.max_upload_size)))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn body_limit(max_upload_size: usize) -> usize {
    max_upload_size.saturating_add(MULTIPART_OVERHEAD)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
    files: usize,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Serialize)]
struct LoginResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    success: bool,
    file_id: Uuid,
    file_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileInfo {
    id: Uuid,
    name: String,
    uploader: Identity,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    url: String,
}

impl From<FileRecord> for FileInfo {
    fn from(record: FileRecord) -> Self {
        Self {
            url: download_url(&record.id),
            id: record.id,
            name: record.original_name,
            uploader: record.uploader,
            size_bytes: record.size_bytes,
            created_at: record.created_at,
        }
    }
}

#[derive(Serialize)]
struct FileListResponse {
    success: bool,
    files: Vec<FileInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileInfoResponse {
    success: bool,
    file_info: FileInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyFilesRequest {
    #[serde(default, alias = "file_ids")]
    file_ids: Vec<String>,
}

#[derive(Serialize)]
struct VerifyFilesResponse {
    success: bool,
    results: HashMap<String, FileAvailability>,
}

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Parley chat gateway is running" }))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.hub.connection_count().await,
        files: state.registry.len().await,
    })
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ServerError> {
    let (Some(username), Some(password)) = (req.username, req.password) else {
        return Err(ServerError::BadRequest(
            "Username and password required".to_string(),
        ));
    };
    if username.is_empty() || password.is_empty() {
        return Err(ServerError::BadRequest(
            "Username and password required".to_string(),
        ));
    }

    let credentials = state.credentials.clone();
    let identity = tokio::task::spawn_blocking(move || {
        credentials.verify_credentials(&username, &password)
    })
    .await
    .map_err(|e| ServerError::Internal(format!("Credential check panicked: {e}")))??;

    let access_token = state.tokens.issue(&identity);
    info!(identity = %identity, "Issued session token");

    Ok(Json(LoginResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.tokens.ttl().num_seconds(),
    }))
}

/// Resolve the caller's identity from an `Authorization: Bearer` header.
fn authenticate(headers: &HeaderMap, tokens: &TokenService) -> Result<Identity, ServerError> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::Unauthorized("Missing bearer token".into()))?;

    let token = auth
        .strip_prefix("Bearer ")
        .ok_or_else(|| ServerError::Unauthorized("Missing bearer token".into()))?;

    Ok(tokens.verify(token)?)
}

async fn upload(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    let identity = authenticate(&headers, &state.tokens)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("").to_string();
        if file_name.is_empty() {
            return Err(ServerError::BadRequest("No selected file".to_string()));
        }

        let record = state.registry.register(&identity, &file_name, field).await?;

        return Ok(Json(UploadResponse {
            success: true,
            file_url: download_url(&record.id),
            file_id: record.id,
        }));
    }

    Err(ServerError::BadRequest("No file part".to_string()))
}

async fn download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServerError> {
    let (record, file) = state.registry.open_content(&id).await?;

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(&record.original_name),
        ),
        (header::CONTENT_LENGTH, record.size_bytes.to_string()),
    ];

    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

/// `attachment` disposition with an ASCII-only quoted filename.
fn content_disposition(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

async fn list_files(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<FileListResponse>, ServerError> {
    authenticate(&headers, &state.tokens)?;

    let files = state
        .registry
        .list_all()
        .await
        .into_iter()
        .map(FileInfo::from)
        .collect();

    Ok(Json(FileListResponse {
        success: true,
        files,
    }))
}

async fn file_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileInfoResponse>, ServerError> {
    let record = state.registry.lookup(&id).await?;
    Ok(Json(FileInfoResponse {
        success: true,
        file_info: record.into(),
    }))
}

/// Check whether files referenced in a client's history still exist.
async fn verify_files(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<VerifyFilesRequest>,
) -> Result<Json<VerifyFilesResponse>, ServerError> {
    authenticate(&headers, &state.tokens)?;

    let mut results = HashMap::with_capacity(req.file_ids.len());
    for raw in req.file_ids {
        let availability = match Uuid::parse_str(&raw) {
            Ok(id) => state.registry.availability(&id).await,
            Err(_) => FileAvailability {
                exists: false,
                name: None,
            },
        };
        results.insert(raw, availability);
    }

    Ok(Json(VerifyFilesResponse {
        success: true,
        results,
    }))
}

/// Admission happens here, before the upgrade is accepted: a bad token gets
/// a 401 and never a socket.
async fn ws_upgrade(
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match state.hub.authenticate(params.token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => return ServerError::from(e).into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let hub = state.hub.clone();
    let send_timeout = state.config.send_timeout;
    ws.on_upgrade(move |socket| async move {
        let admission = hub.join(identity).await;
        ws::serve_connection(socket, hub, admission, send_timeout).await;
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Application state over a temporary upload directory, with one account
/// `alice` / `wonderland`.
#[cfg(test)]
pub(crate) async fn test_state(
    dir: &tempfile::TempDir,
    max_upload_size: usize,
    hub_config: crate::hub::HubConfig,
) -> AppState {
    let config = ServerConfig {
        upload_dir: dir.path().join("uploads"),
        snapshot_path: dir.path().join("files.json"),
        max_upload_size,
        users: vec![("alice".to_string(), "wonderland".to_string())],
        ..ServerConfig::default()
    };
    let registry = Arc::new(
        FileRegistry::open(
            config.upload_dir.clone(),
            config.snapshot_path.clone(),
            config.max_upload_size,
        )
        .await
        .unwrap(),
    );
    let tokens = Arc::new(TokenService::generate(config.token_ttl));
    let hub = Arc::new(Hub::new(tokens.clone(), registry.clone(), hub_config));
    AppState {
        hub,
        registry,
        tokens,
        credentials: Arc::new(CredentialStore::from_users(&config.users).unwrap()),
        rate_limiter: RateLimiter::default(),
        config: Arc::new(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::hub::HubConfig;

    const BOUNDARY: &str = "parley-test-boundary";

    async fn test_app() -> (Router, AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, 1024, HubConfig::default()).await;
        (build_router(state.clone()), state, dir)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_upload(token: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _state, _dir) = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
    }

    #[tokio::test]
    async fn test_login_issues_hub_admissible_token() {
        let (app, state, _dir) = test_app().await;
        let response = app
            .oneshot(json_request(
                Method::POST,
                "/login",
                serde_json::json!({ "username": "alice", "password": "wonderland" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let token = json["access_token"].as_str().unwrap();
        let identity = state.hub.authenticate(Some(token)).unwrap();
        assert_eq!(identity.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_login_rejections() {
        let (app, _state, _dir) = test_app().await;

        let wrong = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/login",
                serde_json::json!({ "username": "alice", "password": "nope" }),
            ))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let missing = app
            .oneshot(json_request(
                Method::POST,
                "/login",
                serde_json::json!({ "username": "alice" }),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        let (app, _state, _dir) = test_app().await;

        let no_header = app
            .clone()
            .oneshot(Request::get("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(no_header.status(), StatusCode::UNAUTHORIZED);

        let bad_token = app
            .oneshot(
                Request::get("/files")
                    .header(header::AUTHORIZATION, "Bearer not-a-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad_token.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upload_list_download() {
        let (app, state, _dir) = test_app().await;
        let token = state.tokens.issue(&Identity::new("alice").unwrap());

        let response = app
            .clone()
            .oneshot(multipart_upload(&token, "notes.txt", b"hello parley"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        let file_id = json["fileId"].as_str().unwrap().to_string();
        assert_eq!(json["fileUrl"], format!("/download/{file_id}"));

        let listed = app
            .clone()
            .oneshot(
                Request::get("/files")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(listed).await;
        assert_eq!(json["files"][0]["id"], file_id.as_str());
        assert_eq!(json["files"][0]["name"], "notes.txt");
        assert_eq!(json["files"][0]["uploader"], "alice");

        let info = app
            .clone()
            .oneshot(
                Request::get(format!("/file-info/{file_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(info).await;
        assert_eq!(json["fileInfo"]["name"], "notes.txt");
        assert_eq!(json["fileInfo"]["sizeBytes"], 12);

        let downloaded = app
            .oneshot(
                Request::get(format!("/download/{file_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(downloaded.status(), StatusCode::OK);
        assert_eq!(
            downloaded.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"notes.txt\""
        );
        let bytes = axum::body::to_bytes(downloaded.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello parley");
    }

    #[tokio::test]
    async fn test_upload_too_large() {
        let (app, state, _dir) = test_app().await;
        let token = state.tokens.issue(&Identity::new("alice").unwrap());

        let response = app
            .oneshot(multipart_upload(&token, "big.bin", &[0u8; 2048]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unbounded_upload_size_keeps_body_limit() {
        assert_eq!(body_limit(usize::MAX), usize::MAX);
        assert_eq!(body_limit(1024), 1024 + MULTIPART_OVERHEAD);

        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, usize::MAX, HubConfig::default()).await;
        let token = state.tokens.issue(&Identity::new("alice").unwrap());
        let app = build_router(state);

        let response = app
            .oneshot(multipart_upload(&token, "big.bin", &[7u8; 128 * 1024]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let (app, _state, _dir) = test_app().await;
        let id = Uuid::new_v4();

        let download = app
            .clone()
            .oneshot(
                Request::get(format!("/download/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(download.status(), StatusCode::NOT_FOUND);

        let info = app
            .oneshot(
                Request::get(format!("/file-info/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(info.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_verify_files() {
        let (app, state, _dir) = test_app().await;
        let token = state.tokens.issue(&Identity::new("alice").unwrap());
        let body = futures::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from_static(
            b"kept",
        ))]);
        let record = state
            .registry
            .register(&Identity::new("alice").unwrap(), "kept.txt", body)
            .await
            .unwrap();
        let known = record.id.to_string();

        let mut request = json_request(
            Method::POST,
            "/verify-files",
            serde_json::json!({ "fileIds": [known, "bogus"] }),
        );
        request.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["results"][known.as_str()]["exists"], true);
        assert_eq!(json["results"][known.as_str()]["name"], "kept.txt");
        assert_eq!(json["results"]["bogus"]["exists"], false);
    }

    #[tokio::test]
    async fn test_ws_rejects_before_upgrade() {
        let (app, _state, _dir) = test_app().await;
        let request = Request::get("/ws?token=forged")
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_content_disposition_is_ascii() {
        assert_eq!(
            content_disposition("résumé \"final\".pdf"),
            "attachment; filename=\"r_sum_ _final_.pdf\""
        );
    }
}
