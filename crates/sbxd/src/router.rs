//! HTTP routes for `sbxd`.
//!
//! Endpoints:
//!   POST     /api/v1/login  - register or log in, returns `{"token": ...}`
//!   GET/POST /api/v1/sync   - download / upload-and-merge the account archive
//!   GET      /healthz       - liveness check

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures::StreamExt;
use sbx_sync::protocol::{
    accept_encoding_supported, content_encoding_supported, LoginRequest, LoginResponse,
    HEALTH_PATH, JSON_CONTENT_TYPE, LOGIN_PATH, SYNC_PATH, TAR_CONTENT_TYPE,
};
use sbx_sync::ArchiveStore;
use std::collections::HashMap;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tokio_util::io::ReaderStream;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{debug, error, info};

use crate::accounts::AccountStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<dyn AccountStore>,
    pub archives: ArchiveStore,
    locks: AccountLocks,
}

impl AppState {
    pub fn new(accounts: Arc<dyn AccountStore>, archives: ArchiveStore) -> Self {
        Self {
            accounts,
            archives,
            locks: AccountLocks::default(),
        }
    }
}

/// One async mutex per account token, serializing uploads for the same
/// account inside this process. Separate server processes sharing an
/// archive directory are not coordinated.
#[derive(Clone, Default)]
struct AccountLocks(Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>);

impl AccountLocks {
    async fn acquire(&self, token: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(token.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Token of the authenticated caller, set by [`require_token`].
#[derive(Clone)]
struct Token(String);

pub fn build(state: AppState) -> Router {
    let sync = Router::new()
        .route(SYNC_PATH, get(download).post(upload))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(negotiate_encoding))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route(LOGIN_PATH, post(login))
        .merge(sync)
        .layer(middleware::from_fn(log_request))
        .route(HEALTH_PATH, get(healthz_handler))
        .with_state(state)
}

/// Liveness check: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn has_content_type(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(expected))
}

async fn login(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !has_content_type(&headers, JSON_CONTENT_TYPE) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    let request: LoginRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("malformed login body: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if request.username.is_empty() || request.password.is_empty() {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    }

    match state
        .accounts
        .register(&request.username, &request.password)
        .await
    {
        Ok(token) => (StatusCode::OK, Json(LoginResponse { token })).into_response(),
        Err(e) => {
            debug!(username = %request.username, "login failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn require_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if let Err(e) = state.accounts.check(&token).await {
        debug!(token = %mask_token(&token), "rejected: {e}");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    request.extensions_mut().insert(Token(token));
    next.run(request).await
}

/// Reject content codings we can neither produce nor undo.
async fn negotiate_encoding(request: Request, next: Next) -> Response {
    let headers = request.headers();
    let accept_ok = headers
        .get(header::ACCEPT_ENCODING)
        .map_or(true, |v| v.to_str().is_ok_and(accept_encoding_supported));
    let content_ok = headers
        .get(header::CONTENT_ENCODING)
        .map_or(true, |v| v.to_str().is_ok_and(content_encoding_supported));

    if !accept_ok || !content_ok {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    next.run(request).await
}

/// One line per request: masked token, method, path, status, elapsed.
async fn log_request(request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(mask_token)
        .unwrap_or_default();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        token = %token,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Replace the first half of a token with `*`.
pub fn mask_token(token: &str) -> String {
    let half = token.chars().count() / 2;
    token
        .chars()
        .enumerate()
        .map(|(i, c)| if i < half { '*' } else { c })
        .collect()
}

fn internal(context: &str, err: impl std::fmt::Display) -> Response {
    error!("{context}: {err}");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

fn tar_response(status: StatusCode, file: std::fs::File) -> Response {
    let stream = ReaderStream::new(tokio::io::BufReader::new(tokio::fs::File::from_std(file)));
    (
        status,
        [(header::CONTENT_TYPE, TAR_CONTENT_TYPE)],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn download(
    State(state): State<AppState>,
    Extension(Token(token)): Extension<Token>,
) -> Response {
    let path = match state.accounts.archive_path(&token).await {
        Ok(Some(path)) => path,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return internal("archive lookup", e),
    };
    match std::fs::File::open(&path) {
        Ok(file) => tar_response(StatusCode::OK, file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => internal("opening archive", e),
    }
}

enum Stored {
    Created(PathBuf),
    Merged(std::fs::File),
}

async fn upload(
    State(state): State<AppState>,
    Extension(Token(token)): Extension<Token>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if !has_content_type(&headers, TAR_CONTENT_TYPE) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    let spooled = match spool(body).await {
        Ok(file) => file,
        Err(SpoolError::Body(e)) => {
            debug!("reading upload body: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
        Err(SpoolError::Io(e)) => return internal("spooling upload", e),
    };

    let _guard = state.locks.acquire(&token).await;

    let existing = match state.accounts.archive_path(&token).await {
        Ok(existing) => existing,
        Err(e) => return internal("archive lookup", e),
    };

    let archives = state.archives.clone();
    let stored = tokio::task::spawn_blocking(move || -> sbx_sync::SyncResult<Stored> {
        let incoming = BufReader::new(spooled);
        match existing {
            Some(path) => {
                archives.merge(&path, incoming)?;
                Ok(Stored::Merged(std::fs::File::open(&path)?))
            }
            None => Ok(Stored::Created(archives.create(incoming)?)),
        }
    })
    .await;

    match stored {
        Ok(Ok(Stored::Created(path))) => {
            if let Err(e) = state.accounts.save_archive_path(&token, &path).await {
                return internal("saving archive path", e);
            }
            StatusCode::CREATED.into_response()
        }
        Ok(Ok(Stored::Merged(file))) => tar_response(StatusCode::OK, file),
        Ok(Err(e)) => internal("storing upload", e),
        Err(e) => internal("storing upload", e),
    }
}

enum SpoolError {
    Body(axum::Error),
    Io(std::io::Error),
}

impl From<std::io::Error> for SpoolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Write a request body to an anonymous temp file, rewound.
async fn spool(body: Body) -> Result<std::fs::File, SpoolError> {
    let mut out = tokio::fs::File::from_std(tempfile::tempfile()?);
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        out.write_all(&chunk.map_err(SpoolError::Body)?).await?;
    }
    out.flush().await?;
    let mut file = out.into_std().await;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::JsonAccountStore;
    use axum::http::Method;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use sbx_core::config::ClientConfig;
    use sbx_crypto::StaticPassphrase;
    use sbx_sync::{sync_vault, RemoteClient, SyncOutcome};
    use sbx_vault::archive::ArchiveReader;
    use sbx_vault::{Secret, Vault};
    use std::io::Read;
    use std::path::Path;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app(tmp: &TempDir) -> (Router, Arc<JsonAccountStore>) {
        let accounts = Arc::new(
            JsonAccountStore::open(tmp.path().join("accounts.json"))
                .await
                .unwrap(),
        );
        let archives = ArchiveStore::new(tmp.path().join("users")).unwrap();
        let state = AppState::new(accounts.clone(), archives);
        (build(state), accounts)
    }

    fn request(method: Method, uri: &str) -> axum::http::request::Builder {
        axum::http::Request::builder().method(method).uri(uri)
    }

    fn open_vault(dir: &Path, seed: u64) -> Vault {
        Vault::open_with_rng(
            dir,
            Box::new(StaticPassphrase::new("shared")),
            Box::new(StdRng::seed_from_u64(seed)),
        )
        .unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn mask_hides_first_half() {
        assert_eq!(mask_token("abcdef"), "***def");
        assert_eq!(mask_token("abcde"), "**cde");
        assert_eq!(mask_token(""), "");
    }

    #[tokio::test]
    async fn healthz_ok() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp).await;
        let resp = app
            .oneshot(request(Method::GET, "/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, b"ok");
    }

    #[tokio::test]
    async fn login_statuses() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp).await;

        let full = r#"{"username":"a","password":"b"}"#;
        let cases = [
            (Method::POST, "text/plain", full, StatusCode::UNSUPPORTED_MEDIA_TYPE),
            (Method::POST, JSON_CONTENT_TYPE, "{not json", StatusCode::BAD_REQUEST),
            (Method::POST, JSON_CONTENT_TYPE, r#"{"username":"a"}"#, StatusCode::UNPROCESSABLE_ENTITY),
            (Method::GET, JSON_CONTENT_TYPE, full, StatusCode::METHOD_NOT_ALLOWED),
        ];
        for (method, content_type, body, expected) in cases {
            let req = request(method.clone(), LOGIN_PATH)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), expected, "{method} {body}");
        }
    }

    #[tokio::test]
    async fn login_returns_token_and_rejects_wrong_password() {
        let tmp = TempDir::new().unwrap();
        let (app, accounts) = app(&tmp).await;

        let login = |password: &'static str| {
            request(Method::POST, LOGIN_PATH)
                .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(Body::from(format!(
                    r#"{{"username":"alice","password":"{password}"}}"#
                )))
                .unwrap()
        };

        let resp = app.clone().oneshot(login("pw")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let LoginResponse { token } = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        accounts.check(&token).await.unwrap();

        let resp = app.oneshot(login("wrong")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn sync_requires_known_token() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp).await;

        let resp = app
            .clone()
            .oneshot(request(Method::GET, SYNC_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                request(Method::GET, SYNC_PATH)
                    .header(header::AUTHORIZATION, "bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sync_rejections() {
        let tmp = TempDir::new().unwrap();
        let (app, accounts) = app(&tmp).await;
        let token = accounts.register("alice", "pw").await.unwrap();

        let send = |builder: axum::http::request::Builder| {
            let app = app.clone();
            let req = builder
                .header(header::AUTHORIZATION, token.as_str())
                .body(Body::empty())
                .unwrap();
            async move { app.oneshot(req).await.unwrap().status() }
        };

        assert_eq!(
            send(request(Method::GET, SYNC_PATH)).await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            send(request(Method::PUT, SYNC_PATH)).await,
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            send(request(Method::POST, SYNC_PATH).header(header::CONTENT_TYPE, JSON_CONTENT_TYPE))
                .await,
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            send(request(Method::GET, SYNC_PATH).header(header::ACCEPT_ENCODING, "br")).await,
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            send(
                request(Method::POST, SYNC_PATH)
                    .header(header::CONTENT_TYPE, TAR_CONTENT_TYPE)
                    .header(header::CONTENT_ENCODING, "deflate")
            )
            .await,
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[tokio::test]
    async fn first_upload_creates_then_merges() {
        let tmp = TempDir::new().unwrap();
        let (app, accounts) = app(&tmp).await;
        let token = accounts.register("alice", "pw").await.unwrap();

        let mut laptop = open_vault(&tmp.path().join("laptop"), 1);
        laptop.add("a", Secret::Binary(&mut &b"alpha"[..])).unwrap();
        let mut phone = open_vault(&tmp.path().join("phone"), 2);
        phone.add("b", Secret::Binary(&mut &b"beta"[..])).unwrap();

        let upload = |vault: &Vault| {
            let mut bytes = Vec::new();
            vault.pack().unwrap().read_to_end(&mut bytes).unwrap();
            request(Method::POST, SYNC_PATH)
                .header(header::AUTHORIZATION, token.as_str())
                .header(header::CONTENT_TYPE, TAR_CONTENT_TYPE)
                .body(Body::from(bytes))
                .unwrap()
        };

        let resp = app.clone().oneshot(upload(&laptop)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(body_bytes(resp).await.is_empty());
        assert!(accounts.archive_path(&token).await.unwrap().is_some());

        let resp = app.clone().oneshot(upload(&phone)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            TAR_CONTENT_TYPE
        );
        let merged = body_bytes(resp).await;
        let mut reader = ArchiveReader::new(merged.as_slice());
        let (catalog, _) = reader.open().unwrap();
        assert_eq!(catalog.live().count(), 2);

        let resp = app
            .oneshot(
                request(Method::GET, SYNC_PATH)
                    .header(header::AUTHORIZATION, token.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, merged);
    }

    #[tokio::test]
    async fn end_to_end_sync_over_tcp() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = ClientConfig::default();
        let base = format!("http://{addr}");
        let token = RemoteClient::new(&base, &config)
            .unwrap()
            .login("alice", "pw")
            .await
            .unwrap();
        let client = RemoteClient::new(&base, &config).unwrap().with_token(token);

        let mut laptop = open_vault(&tmp.path().join("laptop"), 3);
        let a = laptop.add("a", Secret::Binary(&mut &b"alpha"[..])).unwrap();
        assert_eq!(
            sync_vault(&mut laptop, &client).await.unwrap(),
            SyncOutcome::Uploaded
        );

        let mut phone = open_vault(&tmp.path().join("phone"), 4);
        assert_eq!(
            sync_vault(&mut phone, &client).await.unwrap(),
            SyncOutcome::Downloaded
        );
        let b = phone.add("b", Secret::Binary(&mut &b"beta"[..])).unwrap();
        assert_eq!(
            sync_vault(&mut phone, &client).await.unwrap(),
            SyncOutcome::Merged
        );
        assert_eq!(
            sync_vault(&mut laptop, &client).await.unwrap(),
            SyncOutcome::Merged
        );

        let mut out = Vec::new();
        laptop.get(&b).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"beta");
        assert_eq!(laptop.list().count(), 2);
        assert!(phone.catalog().get(&a).is_some());
    }
}
