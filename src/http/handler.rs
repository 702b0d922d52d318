//! Main axum router and HTTP request handlers for the mirror cache.
//!
//! Routes:
//! - `GET  /{repo...}/info/refs?service=git-upload-pack` - ref advertisement
//! - `POST /{repo...}/git-upload-pack`                   - negotiation / pack data
//! - `*    /{repo...}/git-receive-pack`                  - always rejected (403)
//! - `GET  /healthz`                                     - health check
//! - `GET  /metrics`                                     - Prometheus metrics

use std::io::Read;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, instrument, warn};

use crate::error::ProxyError;
use crate::metrics::Service;
use crate::protocol::pktline::{encode_pkt_line, FLUSH_PKT};
use crate::protocol::{GitProtocol, ProtocolRequest};
use crate::proxy::Served;
use crate::AppState;

const ADVERTISEMENT_CONTENT_TYPE: &str = "application/x-git-upload-pack-advertisement";
const RESULT_CONTENT_TYPE: &str = "application/x-git-upload-pack-result";
const STALE_WARNING: &str = "110 - \"Response is Stale\"";
const PUSH_REJECTED: &str = "Push (git-receive-pack) is not supported through the caching proxy.\n\
                             Please push directly to the upstream repository.\n";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.proxy.max_request_bytes;
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        // Smart HTTP endpoints; the repository path is any number of segments.
        .route("/{*path}", get(handle_get).post(handle_post))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /{repo...}/info/refs?service=git-upload-pack`
#[instrument(skip(state, query, headers))]
async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Some(repo) = path.strip_suffix("/info/refs") else {
        return Err(AppError::NotFound);
    };

    match query.service.as_deref() {
        Some("git-upload-pack") => {}
        Some("git-receive-pack") => {
            state.metrics.metrics.record_request(Service::ReceivePack);
            warn!(%repo, "rejected git-receive-pack advertisement (push)");
            return Err(AppError::Forbidden(PUSH_REJECTED));
        }
        Some(other) => {
            return Err(ProxyError::BadRequest(format!("unsupported service {other:?}")).into())
        }
        None => {
            return Err(
                ProxyError::BadRequest("dumb HTTP protocol is not supported".to_string()).into(),
            )
        }
    }

    state.metrics.metrics.record_request(Service::Advertise);
    let protocol = git_protocol(&headers);
    let v2 = protocol.is_v2();

    let served = serve(&state, repo, ProtocolRequest::Advertise { protocol }).await?;

    // git-http-backend announces the service for v0/v1; v2 starts with the
    // capability advertisement itself.
    let mut preamble = Vec::new();
    if !v2 {
        preamble.extend_from_slice(&encode_pkt_line(b"# service=git-upload-pack\n"));
        preamble.extend_from_slice(FLUSH_PKT);
    }

    Ok(git_response(ADVERTISEMENT_CONTENT_TYPE, preamble, served))
}

/// `POST /{repo...}/git-upload-pack` and `POST /{repo...}/git-receive-pack`
#[instrument(skip(state, headers, body), fields(body_len = body.len()))]
async fn handle_post(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if let Some(repo) = path.strip_suffix("/git-receive-pack") {
        state.metrics.metrics.record_request(Service::ReceivePack);
        warn!(%repo, "rejected git-receive-pack (push)");
        return Err(AppError::Forbidden(PUSH_REJECTED));
    }
    let Some(repo) = path.strip_suffix("/git-upload-pack") else {
        return Err(AppError::NotFound);
    };

    state.metrics.metrics.record_request(Service::UploadPack);
    let body = decode_body(&headers, body, state.config.proxy.max_request_bytes)?;
    let request = ProtocolRequest::UploadPack {
        protocol: git_protocol(&headers),
        body,
    };

    let served = serve(&state, repo, request).await?;
    Ok(git_response(RESULT_CONTENT_TYPE, Vec::new(), served))
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        data_root: Arc::from(FsPath::new(&state.config.storage.local.path)),
        vcs: Arc::clone(&state.vcs),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

async fn serve(state: &AppState, repo: &str, request: ProtocolRequest) -> Result<Served, AppError> {
    state
        .proxy
        .handle(repo, request)
        .await
        .inspect_err(|e| state.metrics.metrics.record_error(e.code()))
        .map_err(AppError::from)
}

fn git_protocol(headers: &HeaderMap) -> GitProtocol {
    GitProtocol::from_header(
        headers
            .get("git-protocol")
            .and_then(|v| v.to_str().ok()),
    )
}

/// Inflate a `Content-Encoding: gzip` body, refusing to expand past `limit`.
fn decode_body(headers: &HeaderMap, body: Bytes, limit: usize) -> Result<Bytes, AppError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());

    match encoding.as_deref() {
        None | Some("") | Some("identity") => Ok(body),
        Some("gzip") | Some("x-gzip") => {
            let mut inflated = Vec::new();
            Read::take(GzDecoder::new(body.as_ref()), limit as u64 + 1)
                .read_to_end(&mut inflated)
                .map_err(|e| ProxyError::BadRequest(format!("invalid gzip body: {e}")))?;
            if inflated.len() > limit {
                return Err(ProxyError::BadRequest(format!(
                    "inflated request body exceeds {limit} bytes"
                ))
                .into());
            }
            debug!(
                compressed = body.len(),
                inflated = inflated.len(),
                "inflated gzip request body"
            );
            Ok(Bytes::from(inflated))
        }
        Some(other) => Err(ProxyError::BadRequest(format!(
            "unsupported Content-Encoding {other:?}"
        ))
        .into()),
    }
}

/// Stream `preamble` followed by the upload-pack output with the headers
/// git-http-backend sends.
fn git_response(content_type: &'static str, preamble: Vec<u8>, served: Served) -> Response {
    let reader = AsyncReadExt::chain(std::io::Cursor::new(preamble), served.stream);
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT"),
            (header::PRAGMA, "no-cache"),
            (header::CACHE_CONTROL, "no-cache, max-age=0, must-revalidate"),
        ],
        body,
    )
        .into_response();

    if served.stale {
        response
            .headers_mut()
            .insert(header::WARNING, HeaderValue::from_static(STALE_WARNING));
    }
    response
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Failure from the mirror pipeline.
    Proxy(ProxyError),
    /// Operation the proxy never performs (pushes).
    Forbidden(&'static str),
    /// Path is not a smart-HTTP endpoint.
    NotFound,
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Proxy(err) => {
                let status = err.status_code();
                if status.is_server_error() {
                    error!(error = %err, code = err.code(), "request failed");
                } else {
                    debug!(error = %err, code = err.code(), "request rejected");
                }
                let retry_after = matches!(err, ProxyError::Timeout { .. })
                    .then_some([(header::RETRY_AFTER, "5")]);
                (status, retry_after, format!("{err}\n")).into_response()
            }
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found\n").into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}\n"),
                )
                    .into_response()
            }
        }
    }
}

impl From<ProxyError> for AppError {
    fn from(err: ProxyError) -> Self {
        AppError::Proxy(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::body::to_bytes;
    use axum::http::Request;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tower::ServiceExt;

    use super::*;
    use crate::config::parse_config;
    use crate::git::fake::FakeGit;

    struct TestApp {
        tmp: tempfile::TempDir,
        fake: Arc<FakeGit>,
        router: Router,
    }

    fn app(serve_stale: bool) -> TestApp {
        let tmp = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
proxy: {{ http_listen: "127.0.0.1:0", max_request_bytes: 4096 }}
namespaces:
  - {{ prefix: github.com, upstream: https://github.com }}
storage: {{ local: {{ path: "{}" }} }}
clone: {{ serve_stale_on_refresh_failure: {serve_stale} }}
"#,
            tmp.path().display()
        );
        let config = Arc::new(parse_config(&yaml).unwrap());
        let fake = Arc::new(FakeGit::new());
        let state = AppState::new(config, fake.clone()).unwrap();
        TestApp {
            tmp,
            fake,
            router: create_router(Arc::new(state)),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn ls_refs_body() -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_pkt_line(b"command=ls-refs\n"));
        wire.extend_from_slice(b"0001");
        wire.extend_from_slice(&encode_pkt_line(b"ref-prefix refs/heads/\n"));
        wire.extend_from_slice(FLUSH_PKT);
        wire
    }

    #[tokio::test]
    async fn v0_advertisement_has_service_preamble() {
        let t = app(false);
        let response = t
            .router
            .oneshot(get("/github.com/org/repo.git/info/refs?service=git-upload-pack"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            ADVERTISEMENT_CONTENT_TYPE
        );
        assert_eq!(response.headers()[header::PRAGMA], "no-cache");
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, max-age=0, must-revalidate"
        );
        assert!(response.headers().get(header::WARNING).is_none());

        let path = t.tmp.path().join("github.com/org/repo.git");
        assert_eq!(
            body_string(response).await,
            format!("001e# service=git-upload-pack\n0000advertise {}", path.display())
        );
        assert_eq!(t.fake.clone_count(), 1);
    }

    #[tokio::test]
    async fn v2_advertisement_has_no_preamble() {
        let t = app(false);
        let request = Request::builder()
            .uri("/github.com/org/repo/info/refs?service=git-upload-pack")
            .header("Git-Protocol", "version=2")
            .body(Body::empty())
            .unwrap();
        let response = t.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.starts_with("advertise "));
    }

    #[tokio::test]
    async fn push_is_forbidden() {
        let t = app(false);
        let response = t
            .router
            .clone()
            .oneshot(get("/github.com/org/repo.git/info/refs?service=git-receive-pack"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let request = Request::builder()
            .method("POST")
            .uri("/github.com/org/repo.git/git-receive-pack")
            .body(Body::from("0000"))
            .unwrap();
        let response = t.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(t.fake.clone_count(), 0);
    }

    #[tokio::test]
    async fn bad_service_and_paths() {
        let t = app(false);
        let cases = [
            ("/github.com/org/repo.git/info/refs?service=git-frobnicate", StatusCode::BAD_REQUEST),
            ("/github.com/org/repo.git/info/refs", StatusCode::BAD_REQUEST),
            ("/gitlab.com/org/repo.git/info/refs?service=git-upload-pack", StatusCode::NOT_FOUND),
            ("/github.com/../etc/info/refs?service=git-upload-pack", StatusCode::BAD_REQUEST),
            ("/github.com/org/repo.git/HEAD", StatusCode::NOT_FOUND),
        ];
        for (uri, expected) in cases {
            let response = t.router.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), expected, "{uri}");
        }
        assert_eq!(t.fake.clone_count(), 0);
    }

    #[tokio::test]
    async fn gzip_upload_pack_is_inflated() {
        let t = app(false);
        t.router
            .clone()
            .oneshot(get("/github.com/org/repo/info/refs?service=git-upload-pack"))
            .await
            .unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&ls_refs_body()).unwrap();
        let compressed = encoder.finish().unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/github.com/org/repo.git/git-upload-pack")
            .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
            .header(header::CONTENT_ENCODING, "gzip")
            .header("Git-Protocol", "version=2")
            .body(Body::from(compressed))
            .unwrap();
        let response = t.router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], RESULT_CONTENT_TYPE);
        assert!(body_string(response).await.starts_with("upload-pack "));

        let calls = t.fake.fetch_calls();
        assert_eq!(
            calls.last().unwrap().refspecs,
            vec!["+refs/heads/*:refs/heads/*".to_string()]
        );
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected() {
        let t = app(false);
        for (encoding, body) in [
            (Some("gzip"), b"not gzip".to_vec()),
            (None, b"zzzz".to_vec()),
            (Some("br"), ls_refs_body()),
        ] {
            let mut builder = Request::builder()
                .method("POST")
                .uri("/github.com/org/repo.git/git-upload-pack");
            if let Some(encoding) = encoding {
                builder = builder.header(header::CONTENT_ENCODING, encoding);
            }
            let response = t
                .router
                .clone()
                .oneshot(builder.body(Body::from(body)).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn gzip_bomb_is_rejected() {
        let t = app(false);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&vec![b'0'; 64 * 1024]).unwrap();
        let compressed = encoder.finish().unwrap();
        assert!(compressed.len() < 4096);

        let request = Request::builder()
            .method("POST")
            .uri("/github.com/org/repo.git/git-upload-pack")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from(compressed))
            .unwrap();
        let response = t.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stale_response_carries_warning() {
        let t = app(true);
        t.router
            .clone()
            .oneshot(get("/github.com/org/repo/info/refs?service=git-upload-pack"))
            .await
            .unwrap();
        t.fake.fail_fetches(true);

        let response = t
            .router
            .oneshot(get("/github.com/org/repo/info/refs?service=git-upload-pack"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::WARNING], STALE_WARNING);
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway() {
        let t = app(false);
        t.fake.fail_clones(true);
        let response = t
            .router
            .oneshot(get("/github.com/org/repo/info/refs?service=git-upload-pack"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn health_and_metrics() {
        let t = app(false);
        t.router
            .clone()
            .oneshot(get("/gitlab.com/x/info/refs?service=git-upload-pack"))
            .await
            .unwrap();

        let response = t.router.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(health["status"], "ok");

        let response = t.router.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_string(response).await;
        assert!(text.contains("mirrorcache_requests_total{service=\"Advertise\"} 1"));
        assert!(text.contains("mirrorcache_request_errors_total{code=\"not_found\"} 1"));
    }
}
