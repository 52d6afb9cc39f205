use crate::cache::get_cached_or_fetch;
use crate::engine::EngineError;
use crate::framing;
use crate::metrics::Metrics;
use crate::params::{self, OutputFormat};
use crate::sniff;
use crate::state::AppState;
use crate::throttle::ThrottleError;
use axum::Router;
use axum::body::Body;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::serve::IncomingStream;
use prometheus::Encoder;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::net::TcpListener;
use tower::Service;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, error, warn};

const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable";

pub fn router(state: Arc<AppState>) -> Router {
    let metrics_state = state.clone();
    let throttle_state = state.clone();
    Router::new()
        .route("/{signature}/media/{*media_path}", get(handle_transform))
        .route("/{signature}/metadata/{*media_path}", get(handle_metadata))
        .layer(middleware::from_fn(move |request, next| {
            let state = metrics_state.clone();
            async move { metrics_middleware(state, request, next).await }
        }))
        .layer(middleware::from_fn(move |request, next| {
            let state = throttle_state.clone();
            async move { throttle_middleware(state, request, next).await }
        }))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .with_state(state)
}

/// Router for the separate metrics listener.
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(metrics)
}

async fn serve_metrics(State(metrics): State<Arc<Metrics>>) -> Result<Response, ApiError> {
    let body = metrics.gather().map_err(ApiError::from)?;
    let encoder = prometheus::TextEncoder::new();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(body))
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))
}

async fn metrics_middleware(state: Arc<AppState>, request: Request, next: Next) -> Response {
    state.metrics.request_started();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let response = next.run(request).await;
    state.metrics.request_finished(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

async fn throttle_middleware(state: Arc<AppState>, request: Request, next: Next) -> Response {
    match state.throttle.acquire().await {
        Ok(_permit) => next.run(request).await,
        Err(err) => {
            let reason = match err {
                ThrottleError::CapacityExceeded => "capacity",
                ThrottleError::TimedOut => "timeout",
            };
            state.metrics.request_throttled(reason);
            (StatusCode::TOO_MANY_REQUESTS, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Media,
    Metadata,
}

impl RequestKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Media => "media",
            Self::Metadata => "metadata",
        }
    }
}

struct RequestInfo {
    media_path: String,
    pairs: Vec<(String, String)>,
    encoded_query: String,
}

/// Common handler prelude: signature check against the raw escaped path
/// and query, then trailing-slash strip and query split. Runs before any
/// cache or engine work.
fn request_info(state: &AppState, kind: RequestKind, uri: &Uri) -> Result<RequestInfo, ApiError> {
    let (signature, tail) = split_request_path(uri.path(), kind)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "invalid request path"))?;
    let raw_query = uri.query().unwrap_or("");
    if !state.config.enable_unsafe {
        let canonical = if raw_query.is_empty() {
            format!("{}/{}", kind.as_str(), tail)
        } else {
            format!("{}/{}?{}", kind.as_str(), tail, raw_query)
        };
        if !state.verifier.validate(signature, &canonical) {
            return Err(ApiError::new(StatusCode::FORBIDDEN, "Invalid signature"));
        }
    }
    let tail = tail.strip_suffix('/').unwrap_or(tail);
    let pairs = params::parse_query(raw_query);
    let encoded_query = params::encode_query(&pairs);
    Ok(RequestInfo {
        media_path: tail.to_string(),
        pairs,
        encoded_query,
    })
}

/// Splits `/{signature}/{kind}/{tail}` on the raw request path, keeping
/// the tail URL-escaped exactly as the client sent it.
fn split_request_path(path: &str, kind: RequestKind) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    let (signature, rest) = rest.split_once('/')?;
    let tail = rest.strip_prefix(kind.as_str())?.strip_prefix('/')?;
    if signature.is_empty() {
        return None;
    }
    Some((signature, tail))
}

async fn handle_transform(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let info = request_info(&state, RequestKind::Media, &uri)?;
    let opts = params::decode_transform(&info.pairs)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, format!("Failed to parse query: {err}")))?;
    debug!(media_path = %info.media_path, ?opts, "incoming transform request");

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    let cache_key = format!("{}?{}", info.media_path, info.encoded_query);
    let fetch_state = state.clone();
    let media_path = info.media_path.clone();
    let entry = get_cached_or_fetch(state.result_cache.as_ref(), &cache_key, || async move {
        let origin = origin_bytes(&fetch_state, &media_path).await?;
        let mut opts = opts;
        if opts.output_format == OutputFormat::Auto {
            opts.output_format = negotiate_output_format(&origin, &accept);
        }
        let (bytes, content_type) = fetch_state
            .engine
            .transform(origin, &opts)
            .await
            .map_err(ApiError::from)?;
        Ok::<_, ApiError>(framing::frame(&content_type, &bytes))
    })
    .await?;

    let (content_type, payload) = framing::unframe(&entry)
        .map_err(|err| ApiError::from(err.context("unframe cached transform result")))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, CACHE_CONTROL_IMMUTABLE)
        .header(header::CONTENT_LENGTH, payload.len())
        .body(Body::from(payload))
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))
}

async fn handle_metadata(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let info = request_info(&state, RequestKind::Metadata, &uri)?;
    let opts = params::decode_metadata(&info.pairs)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, format!("Failed to parse query: {err}")))?;
    debug!(media_path = %info.media_path, ?opts, "incoming metadata request");

    let cache_key = format!("{}?{}", info.media_path, info.encoded_query);
    let fetch_state = state.clone();
    let media_path = info.media_path.clone();
    let body = get_cached_or_fetch(state.metadata_cache.as_ref(), &cache_key, || async move {
        let origin = origin_bytes(&fetch_state, &media_path).await?;
        fetch_state
            .engine
            .metadata(origin, &opts)
            .await
            .map_err(ApiError::from)
    })
    .await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))
}

/// Origin bytes memoized under the media path alone, shared by transform
/// and metadata requests regardless of their query parameters.
async fn origin_bytes(state: &AppState, media_path: &str) -> Result<Vec<u8>, ApiError> {
    get_cached_or_fetch(state.loader_cache.as_ref(), media_path, || async {
        state.loader.get_media(media_path).await.map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch media from origin",
            )
            .with_log_detail(err.to_string())
        })
    })
    .await
}

/// Picks the output format when the client did not name one: the sniffed
/// origin content type, overridden by the first `image/*` entry of the
/// Accept header. AVIF is never chosen implicitly.
fn negotiate_output_format(origin: &[u8], accept: &str) -> OutputFormat {
    let mut content_type = sniff::detect(origin);
    for accepted in accept.split(',') {
        let accepted = accepted.trim();
        if accepted == "image/avif" {
            continue;
        }
        if accepted.starts_with("image/") {
            content_type = accepted;
            break;
        }
    }
    OutputFormat::from_content_type(content_type)
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub log_detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            log_detail: None,
        }
    }

    pub fn with_log_detail(mut self, detail: String) -> Self {
        if !detail.is_empty() {
            self.log_detail = Some(detail);
        }
        self
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "request failed")
            .with_log_detail(format!("{error:#}"))
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::UnsupportedOutputFormat(_) => {
                Self::new(StatusCode::BAD_REQUEST, error.to_string())
            }
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process media request",
            )
            .with_log_detail(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.log_detail.as_deref().unwrap_or(&self.message);
        if self.status.is_server_error() {
            error!(status = %self.status, detail, "request failed");
        } else {
            warn!(status = %self.status, detail, "request rejected");
        }
        (self.status, self.message).into_response()
    }
}

/// Counts open connections so the gauges track accepts and closes; the
/// Rust stand-in for a per-connection state callback. One guard is shared
/// by every per-request clone of the connection service and released when
/// the connection itself goes away.
#[derive(Clone)]
pub struct ConnectionCountedRouter {
    router: Router,
    metrics: Arc<Metrics>,
}

impl ConnectionCountedRouter {
    pub fn new(router: Router, metrics: Arc<Metrics>) -> Self {
        Self { router, metrics }
    }
}

impl<'a> Service<IncomingStream<'a, TcpListener>> for ConnectionCountedRouter {
    type Response = ConnectionService;
    type Error = Infallible;
    type Future = std::future::Ready<Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _stream: IncomingStream<'a, TcpListener>) -> Self::Future {
        std::future::ready(Ok(ConnectionService {
            router: self.router.clone(),
            _guard: Arc::new(ConnectionGuard::new(self.metrics.clone())),
        }))
    }
}

struct ConnectionGuard {
    metrics: Arc<Metrics>,
}

impl ConnectionGuard {
    fn new(metrics: Arc<Metrics>) -> Self {
        metrics.connection_opened();
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.connection_closed();
    }
}

#[derive(Clone)]
pub struct ConnectionService {
    router: Router,
    _guard: Arc<ConnectionGuard>,
}

impl Service<Request> for ConnectionService {
    type Response = Response;
    type Error = Infallible;
    type Future = <Router as Service<Request>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        <Router as Service<Request>>::poll_ready(&mut self.router, cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        self.router.call(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FsCache;
    use crate::config::Config;
    use crate::engine::{EngineConfig, MediaEngine};
    use crate::loader::HttpLoader;
    use crate::signature::sign;
    use crate::throttle::Throttle;
    use http_body_util::BodyExt;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use std::io::Cursor;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const SECRET: &str = "s";

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x * 9 % 256) as u8, (y * 5 % 256) as u8, 120, 255])
        }));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    struct Origin {
        addr: SocketAddr,
        hits: Arc<AtomicUsize>,
        body: Arc<Mutex<Vec<u8>>>,
    }

    async fn spawn_origin(initial_body: Vec<u8>) -> Origin {
        let hits = Arc::new(AtomicUsize::new(0));
        let body = Arc::new(Mutex::new(initial_body));
        let handler_hits = hits.clone();
        let handler_body = body.clone();
        let router = Router::new().fallback(move || {
            let hits = handler_hits.clone();
            let body = handler_body.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                body.lock().unwrap().clone()
            }
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Origin { addr, hits, body }
    }

    fn test_state(base_url: String, cache_dir: PathBuf, enable_unsafe: bool) -> Arc<AppState> {
        let config = Config {
            env: "test".to_string(),
            log_level: "error".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            metrics_port: 0,
            base_url: base_url.clone(),
            cache_dir: cache_dir.clone(),
            enable_loader_cache: true,
            enable_result_cache: true,
            enable_unsafe,
            secret: if enable_unsafe {
                String::new()
            } else {
                SECRET.to_string()
            },
            concurrency: 8,
        };
        let metrics = Arc::new(Metrics::new());
        let loader = HttpLoader::new(base_url, metrics.clone()).unwrap();
        let engine = MediaEngine::new(EngineConfig::default());
        let throttle = Throttle::new(config.concurrency, 200, Duration::from_secs(60));
        Arc::new(AppState::new(
            config,
            engine,
            loader,
            Arc::new(FsCache::new(cache_dir.join("original"))),
            Arc::new(FsCache::new(cache_dir.join("metadata"))),
            Arc::new(FsCache::new(cache_dir.join("result"))),
            throttle,
            metrics,
        ))
    }

    fn signed_uri(kind: &str, media_path: &str, query: &str) -> String {
        let canonical = if query.is_empty() {
            format!("{kind}/{media_path}")
        } else {
            format!("{kind}/{media_path}?{query}")
        };
        let signature = sign(SECRET, &canonical);
        if query.is_empty() {
            format!("/{signature}/{kind}/{media_path}")
        } else {
            format!("/{signature}/{kind}/{media_path}?{query}")
        }
    }

    async fn get_response(app: &Router, uri: &str) -> Response {
        get_response_with_accept(app, uri, None).await
    }

    async fn get_response_with_accept(app: &Router, uri: &str, accept: Option<&str>) -> Response {
        let mut builder = Request::builder().uri(uri);
        if let Some(accept) = accept {
            builder = builder.header(header::ACCEPT, accept);
        }
        app.clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn transform_end_to_end() {
        let origin = spawn_origin(png_bytes(100, 50)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let uri = signed_uri("media", "cat.jpg", "resize.width=64&outputFormat=webp");
        let response = get_response(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/webp"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            CACHE_CONTROL_IMMUTABLE
        );
        let content_length: usize = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_bytes(response).await;
        assert_eq!(body.len(), content_length);
        assert_eq!(&body[..4], b"RIFF");
    }

    #[tokio::test]
    async fn invalid_signature_is_forbidden() {
        let origin = spawn_origin(png_bytes(4, 4)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let response = get_response(&app, "/BAD/media/cat.jpg").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        // The origin was never contacted.
        assert_eq!(origin.hits.load(Ordering::SeqCst), 0);

        // A valid signature for a different query does not transfer.
        let signature = sign(SECRET, "media/cat.jpg?resize.width=64");
        let response =
            get_response(&app, &format!("/{signature}/media/cat.jpg?resize.width=65")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unsafe_mode_bypasses_signatures() {
        let origin = spawn_origin(png_bytes(4, 4)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            true,
        );
        let app = router(state);

        let response = get_response(&app, "/anything/media/cat.jpg?outputFormat=png").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_query_is_a_400() {
        let origin = spawn_origin(png_bytes(4, 4)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let uri = signed_uri("media", "cat.jpg", "resize.crop=bogus");
        let response = get_response(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(origin.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn apng_reaching_the_engine_is_a_400() {
        let origin = spawn_origin(png_bytes(4, 4)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let uri = signed_uri("media", "cat.png", "outputFormat=apng");
        let response = get_response(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn raw_returns_origin_bytes_with_sniffed_type() {
        let origin_body = png_bytes(6, 6);
        let origin = spawn_origin(origin_body.clone()).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let uri = signed_uri("media", "cat.png", "raw=true");
        let response = get_response(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
        assert_eq!(body_bytes(response).await, origin_body);
    }

    #[tokio::test]
    async fn results_are_memoized_across_origin_changes() {
        let origin = spawn_origin(png_bytes(100, 50)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let uri = signed_uri("media", "cat.jpg", "resize.width=32&outputFormat=png");
        let first = body_bytes(get_response(&app, &uri).await).await;
        // The origin now serves a different image; the cached transform
        // must not change.
        *origin.body.lock().unwrap() = png_bytes(10, 10);
        let second = body_bytes(get_response(&app, &uri).await).await;
        assert_eq!(first, second);
        assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn media_and_metadata_share_one_origin_fetch() {
        let origin = spawn_origin(png_bytes(100, 50)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let uri = signed_uri("media", "shared.png", "resize.width=100&outputFormat=png");
        assert_eq!(get_response(&app, &uri).await.status(), StatusCode::OK);
        let uri = signed_uri("metadata", "shared.png", "thumbhash=true");
        let response = get_response(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn metadata_reports_json_document() {
        let origin = spawn_origin(png_bytes(100, 50)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let uri = signed_uri("metadata", "cat.png", "thumbhash=true");
        let response = get_response(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let value: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(value["width"], 100);
        assert_eq!(value["height"], 50);
        assert_eq!(value["noOfPages"], 1);
        assert!(!value["thumbhash"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn accept_header_steers_auto_format() {
        let origin = spawn_origin(png_bytes(20, 20)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state);

        let uri = signed_uri("media", "first.png", "");
        let response =
            get_response_with_accept(&app, &uri, Some("image/webp,image/avif,*/*")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/webp"
        );

        // AVIF alone is skipped; the sniffed origin type (png) wins.
        let uri = signed_uri("media", "second.png", "");
        let response = get_response_with_accept(&app, &uri, Some("image/avif")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
    }

    #[tokio::test]
    async fn origin_failure_is_a_500() {
        let dir = tempdir().unwrap();
        // Nothing listens on port 1.
        let state = test_state("http://127.0.0.1:1/".to_string(), dir.path().to_path_buf(), false);
        let app = router(state);

        let uri = signed_uri("media", "cat.jpg", "outputFormat=png");
        let response = get_response(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn trailing_slash_is_stripped_after_signing() {
        let origin = spawn_origin(png_bytes(8, 8)).await;
        let dir = tempdir().unwrap();
        let state = test_state(
            format!("http://{}/", origin.addr),
            dir.path().to_path_buf(),
            false,
        );
        let app = router(state.clone());

        // The signature covers the tail as sent, slash included.
        let uri = signed_uri("media", "cat.png/", "outputFormat=png");
        let response = get_response(&app, &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        // The loader tier is keyed by the stripped path.
        assert!(
            state
                .loader_cache
                .get("cat.png")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_exposition_format() {
        let metrics = Arc::new(Metrics::new());
        metrics.request_started();
        metrics.request_finished("GET", "/{signature}/media/{*media_path}", 200, 0.01);
        let app = metrics_router(metrics);
        let response = get_response(&app, "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(body.contains("media_proxy_request_duration_seconds"));
    }

    #[test]
    fn request_path_splitting() {
        assert_eq!(
            split_request_path("/sig/media/a/b.png", RequestKind::Media),
            Some(("sig", "a/b.png"))
        );
        assert_eq!(
            split_request_path("/sig/metadata/a.png", RequestKind::Metadata),
            Some(("sig", "a.png"))
        );
        assert_eq!(split_request_path("/sig/media/a.png", RequestKind::Metadata), None);
        assert_eq!(split_request_path("/media/a.png", RequestKind::Media), None);
    }

    #[test]
    fn negotiation_prefers_first_acceptable_image_type() {
        let png = png_bytes(2, 2);
        assert_eq!(
            negotiate_output_format(&png, "image/webp,image/avif,*/*"),
            OutputFormat::Webp
        );
        assert_eq!(negotiate_output_format(&png, "image/avif"), OutputFormat::Png);
        assert_eq!(
            negotiate_output_format(&png, "text/html,application/xhtml+xml"),
            OutputFormat::Png
        );
        assert_eq!(
            negotiate_output_format(&png, "image/avif,image/jpeg"),
            OutputFormat::Jpeg
        );
        assert_eq!(negotiate_output_format(&png, ""), OutputFormat::Png);
    }
}
