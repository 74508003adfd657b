use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use savetube::{
    config::{self, RuntimeConfig, RuntimeOverrides, StoreBackend},
    formats::{QualityOption, quality_options},
    media::{DownloadPipeline, Ffmpeg, MediaProducer, Muxer, YtDlp},
    retention::{RetentionStore, SweepReport, SystemClock, is_plain_file_name},
    security::ensure_not_root,
    tools::{
        FFMPEG_ENV, FFMPEG_PROGRAM, YTDLP_ENV, YTDLP_PROGRAM, ensure_program_available,
        locate_program,
    },
};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    signal, task,
    time::{self, MissedTickBehavior},
};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DOWNLOAD_ROUTE_PREFIX: &str = "/api/download/video";
const SERVED_FILE_NAME: &str = "video.mp4";
const SERVED_CONTENT_TYPE: &str = "video/mp4";

#[derive(Parser, Debug)]
#[command(name = "backend", about = "Savetube download API server")]
struct Cli {
    /// Path to the KEY="value" config file (optional).
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
    /// Record store backend (`json` or `sqlite`).
    #[arg(long, value_parser = parse_store_backend)]
    store: Option<StoreBackend>,
    /// Permit running as root.
    #[arg(long)]
    allow_root: bool,
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            downloads_dir: self.downloads_dir.clone(),
            host: self.host.clone(),
            port: self.port,
            store_backend: self.store,
        }
    }
}

fn parse_store_backend(value: &str) -> Result<StoreBackend, String> {
    StoreBackend::parse(value).ok_or_else(|| format!("unknown store `{value}`; use json or sqlite"))
}

#[derive(Clone)]
struct AppState {
    retention: Arc<RetentionStore>,
    pipeline: Arc<DownloadPipeline>,
    sweep_on_request: bool,
    delete_after_serve: bool,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct FormatsRequest {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatsResponse {
    quality_options: Vec<QualityOption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    format_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    download_url: String,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    status: &'static str,
    deleted: usize,
    failed: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if !cli.allow_root {
        ensure_not_root("backend")?;
    }

    let runtime = config::load_runtime_config_from(&cli.config, cli.overrides())
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let state = build_state(&runtime)?;

    if let Some(every) = runtime.sweep_interval {
        spawn_periodic_sweep(state.retention.clone(), every);
    }

    let host: IpAddr = runtime
        .host
        .parse()
        .with_context(|| format!("parsing listen address {}", runtime.host))?;
    let addr = SocketAddr::new(host, runtime.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, downloads_dir = %runtime.downloads_dir.display(), "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_state(runtime: &RuntimeConfig) -> Result<AppState> {
    std::fs::create_dir_all(&runtime.downloads_dir)
        .with_context(|| format!("creating {}", runtime.downloads_dir.display()))?;

    let ytdlp = resolve_tool(
        YTDLP_PROGRAM,
        runtime.ytdlp_path.as_deref(),
        YTDLP_ENV,
        "--version",
    );
    let ffmpeg = resolve_tool(
        FFMPEG_PROGRAM,
        runtime.ffmpeg_path.as_deref(),
        FFMPEG_ENV,
        "-version",
    );

    let storage = runtime
        .store_backend
        .open(&runtime.downloads_dir)
        .context("opening artifact records")?;
    let retention = Arc::new(RetentionStore::new(
        storage,
        Arc::new(SystemClock),
        &runtime.downloads_dir,
    ));

    let producer: Arc<dyn MediaProducer> = Arc::new(YtDlp::new(ytdlp));
    let muxer: Arc<dyn Muxer> = Arc::new(Ffmpeg::new(ffmpeg));
    let pipeline = Arc::new(DownloadPipeline::new(
        producer,
        muxer,
        &runtime.downloads_dir,
    ));

    Ok(AppState {
        retention,
        pipeline,
        sweep_on_request: runtime.sweep_on_request,
        delete_after_serve: runtime.delete_after_serve,
    })
}

/// Locates and probes a tool, falling back to its bare name so the server
/// still starts and can serve files that already exist.
fn resolve_tool(name: &str, configured: Option<&Path>, env_key: &str, version_flag: &str) -> PathBuf {
    let program = match locate_program(name, configured, env_key) {
        Ok(path) => path,
        Err(err) => {
            warn!(program = name, error = %err, "tool not found; downloads will fail");
            return PathBuf::from(name);
        }
    };
    if let Err(err) = ensure_program_available(&program, version_flag) {
        warn!(program = name, error = %err, "tool failed its version probe");
    }
    info!(program = name, path = %program.display(), "using tool");
    program
}

fn router(state: AppState) -> Router {
    let downloads = Router::new()
        .route("/api/download/formats", post(list_formats))
        .route("/api/download", post(start_download))
        .route("/api/download/video/{filename}", get(serve_video))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            sweep_before_download,
        ));

    Router::new()
        .merge(downloads)
        .route("/api/cleanup", get(cleanup))
        .route("/api/health", get(health))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

fn spawn_periodic_sweep(retention: Arc<RetentionStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = run_sweep(retention.clone()).await {
                warn!(error = %err.message, "periodic sweep failed");
            }
        }
    });
}

async fn run_blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))
}

async fn run_sweep(retention: Arc<RetentionStore>) -> ApiResult<SweepReport> {
    let report = run_blocking(move || retention.sweep()).await?;
    if report.expired > 0 || report.aborted {
        info!(%report, "sweep finished");
    }
    Ok(report)
}

async fn sweep_before_download(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.sweep_on_request
        && let Err(err) = run_sweep(state.retention.clone()).await
    {
        warn!(error = %err.message, "request sweep failed");
    }
    next.run(request).await
}

fn required_url(url: Option<String>) -> ApiResult<String> {
    url.map(|url| url.trim().to_owned())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("Video URL is required"))
}

async fn list_formats(
    State(state): State<AppState>,
    Json(request): Json<FormatsRequest>,
) -> ApiResult<Json<FormatsResponse>> {
    let url = required_url(request.url)?;
    let pipeline = state.pipeline.clone();
    let info = run_blocking(move || pipeline.probe(&url))
        .await?
        .map_err(|err| {
            warn!(error = %err, "format probe failed");
            ApiError::internal(format!("Error fetching formats: {err:#}"))
        })?;

    Ok(Json(FormatsResponse {
        quality_options: quality_options(&info),
    }))
}

async fn start_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let url = required_url(request.url)?;
    let pipeline = state.pipeline.clone();
    let format_id = request.format_id;
    let filename = run_blocking(move || pipeline.produce(&url, format_id.as_deref()))
        .await?
        .map_err(|err| {
            warn!(error = %err, "download failed");
            ApiError::internal(format!("Error processing video: {err:#}"))
        })?;

    let retention = state.retention.clone();
    let tracked = filename.clone();
    run_blocking(move || retention.register(&tracked)).await?;

    Ok(Json(DownloadResponse {
        download_url: format!("{DOWNLOAD_ROUTE_PREFIX}/{filename}"),
    }))
}

async fn serve_video(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    // Hidden names cover the record store files kept beside the artifacts.
    if !is_plain_file_name(&filename) || filename.starts_with('.') {
        return Err(ApiError::not_found("File not found"));
    }

    let path = state.pipeline.downloads_dir().join(&filename);
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal(format!("reading {filename}: {err}")))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    let retention = state.retention.clone();
    let name = filename.clone();
    let delete_after_serve = state.delete_after_serve;
    run_blocking(move || {
        retention.mark_accessed(&name);
        // The open handle keeps the bytes readable once the entry is unlinked.
        if delete_after_serve {
            retention.discard(&name);
        }
    })
    .await?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(SERVED_CONTENT_TYPE),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{SERVED_FILE_NAME}\""))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

async fn cleanup(State(state): State<AppState>) -> ApiResult<Json<CleanupResponse>> {
    let report = run_sweep(state.retention.clone()).await?;
    if report.aborted {
        return Err(ApiError::internal(
            "Error during cleanup: artifact records are unreadable",
        ));
    }
    Ok(Json(CleanupResponse {
        status: "Cleanup completed successfully",
        deleted: report.deleted,
        failed: report.failed,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "API route is working" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use axum::body::to_bytes;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use savetube::{
        formats::{FormatInfo, VideoInfo},
        retention::{Clock, ManualClock, RETENTION_WINDOW_MS},
        storage::{ArtifactRecord, JsonFileStorage, MemoryStorage, RecordStorage},
    };
    use serde_json::Value;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct FakeProducer {
        fail: bool,
        selectors: Mutex<Vec<String>>,
    }

    impl MediaProducer for FakeProducer {
        fn probe(&self, url: &str) -> Result<VideoInfo> {
            if self.fail {
                bail!("unsupported url {url}");
            }
            Ok(VideoInfo {
                title: Some("clip".into()),
                duration: Some(10.0),
                formats: vec![FormatInfo {
                    format_id: "137".into(),
                    ext: Some("mp4".into()),
                    vcodec: Some("avc1.640028".into()),
                    acodec: Some("none".into()),
                    height: Some(1080),
                    fps: Some(30.0),
                    filesize: Some(5 * 1024 * 1024),
                    ..FormatInfo::default()
                }],
            })
        }

        fn fetch_video(&self, _url: &str, selector: &str, output: &Path) -> Result<()> {
            if self.fail {
                bail!("video fetch failed");
            }
            self.selectors.lock().push(selector.to_owned());
            fs::write(output, b"video")?;
            Ok(())
        }

        fn fetch_audio(&self, _url: &str, output: &Path) -> Result<()> {
            fs::write(output, b"audio")?;
            Ok(())
        }
    }

    struct ConcatMuxer;

    impl Muxer for ConcatMuxer {
        fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
            let mut bytes = fs::read(video)?;
            bytes.extend(fs::read(audio)?);
            fs::write(output, bytes)?;
            Ok(())
        }
    }

    struct TestContext {
        dir: TempDir,
        clock: Arc<ManualClock>,
        storage: Arc<dyn RecordStorage>,
        producer: Arc<FakeProducer>,
        state: AppState,
    }

    impl TestContext {
        fn new() -> Self {
            Self::with(FakeProducer::default(), Arc::new(MemoryStorage::new()), false)
        }

        fn with(producer: FakeProducer, storage: Arc<dyn RecordStorage>, delete_after_serve: bool) -> Self {
            let dir = tempdir().unwrap();
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            ));
            let producer = Arc::new(producer);
            let retention = Arc::new(RetentionStore::new(
                storage.clone(),
                clock.clone(),
                dir.path(),
            ));
            let dyn_producer: Arc<dyn MediaProducer> = producer.clone();
            let muxer: Arc<dyn Muxer> = Arc::new(ConcatMuxer);
            let pipeline = Arc::new(DownloadPipeline::new(dyn_producer, muxer, dir.path()));
            let state = AppState {
                retention,
                pipeline,
                sweep_on_request: true,
                delete_after_serve,
            };
            Self {
                dir,
                clock,
                storage,
                producer,
                state,
            }
        }

        fn track(&self, name: &str, created_at: i64) {
            fs::write(self.dir.path().join(name), b"payload").unwrap();
            let mut map = self.storage.load().unwrap();
            map.insert(name.to_owned(), ArtifactRecord::new(created_at));
            self.storage.save(&map).unwrap();
        }
    }

    async fn error_of(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn formats_requires_url() {
        let ctx = TestContext::new();
        let err = list_formats(
            State(ctx.state.clone()),
            Json(FormatsRequest {
                url: Some("   ".into()),
            }),
        )
        .await
        .unwrap_err();
        let (status, body) = error_of(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Video URL is required");
    }

    #[tokio::test]
    async fn formats_returns_quality_options() {
        let ctx = TestContext::new();
        let Json(response) = list_formats(
            State(ctx.state.clone()),
            Json(FormatsRequest {
                url: Some("https://example.com/watch?v=1".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.quality_options.len(), 1);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["qualityOptions"][0]["format_id"], "137");
    }

    #[tokio::test]
    async fn formats_failure_is_internal_error() {
        let ctx = TestContext::with(
            FakeProducer {
                fail: true,
                ..FakeProducer::default()
            },
            Arc::new(MemoryStorage::new()),
            false,
        );
        let err = list_formats(
            State(ctx.state.clone()),
            Json(FormatsRequest {
                url: Some("https://example.com/x".into()),
            }),
        )
        .await
        .unwrap_err();
        let (status, body) = error_of(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .starts_with("Error fetching formats: ")
        );
    }

    #[tokio::test]
    async fn download_registers_artifact() {
        let ctx = TestContext::new();
        let Json(response) = start_download(
            State(ctx.state.clone()),
            Json(DownloadRequest {
                url: Some("https://example.com/watch?v=1".into()),
                format_id: Some("137".into()),
            }),
        )
        .await
        .unwrap();

        let filename = response
            .download_url
            .strip_prefix("/api/download/video/")
            .unwrap()
            .to_owned();
        assert!(filename.ends_with(".mp4"));
        assert_eq!(
            fs::read(ctx.dir.path().join(&filename)).unwrap(),
            b"videoaudio"
        );
        assert_eq!(ctx.producer.selectors.lock().as_slice(), ["137"]);

        let records = ctx.state.retention.records().unwrap();
        let record = &records[&filename];
        assert_eq!(record.created_at, ctx.clock.now_millis());
        assert!(!record.accessed);
    }

    #[tokio::test]
    async fn download_requires_url() {
        let ctx = TestContext::new();
        let err = start_download(
            State(ctx.state.clone()),
            Json(DownloadRequest {
                url: None,
                format_id: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn download_failure_registers_nothing() {
        let ctx = TestContext::with(
            FakeProducer {
                fail: true,
                ..FakeProducer::default()
            },
            Arc::new(MemoryStorage::new()),
            false,
        );
        let err = start_download(
            State(ctx.state.clone()),
            Json(DownloadRequest {
                url: Some("https://example.com/x".into()),
                format_id: None,
            }),
        )
        .await
        .unwrap_err();
        let (status, body) = error_of(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .starts_with("Error processing video: ")
        );
        assert!(ctx.state.retention.records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn serve_streams_and_marks_accessed() {
        let ctx = TestContext::new();
        ctx.track("clip.mp4", ctx.clock.now_millis());

        let response = serve_video(State(ctx.state.clone()), AxumPath("clip.mp4".into()))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"video.mp4\""
        );
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "7");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"payload");

        assert!(ctx.state.retention.records().unwrap()["clip.mp4"].accessed);
        assert!(ctx.dir.path().join("clip.mp4").exists());
    }

    #[tokio::test]
    async fn serve_always_labels_content_as_mp4() {
        let ctx = TestContext::new();
        ctx.track("clip.webm", ctx.clock.now_millis());

        let response = serve_video(State(ctx.state.clone()), AxumPath("clip.webm".into()))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    }

    #[tokio::test]
    async fn serve_rejects_unsafe_and_missing_names() {
        let ctx = TestContext::new();
        fs::write(ctx.dir.path().join(".metadata.json"), b"{}").unwrap();
        for name in ["../secret", ".metadata.json", "missing.mp4", ".."] {
            let err = serve_video(State(ctx.state.clone()), AxumPath(name.into()))
                .await
                .unwrap_err();
            assert_eq!(err.status, StatusCode::NOT_FOUND, "{name}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serve_can_delete_after_streaming() {
        let ctx = TestContext::with(
            FakeProducer::default(),
            Arc::new(MemoryStorage::new()),
            true,
        );
        ctx.track("clip.mp4", ctx.clock.now_millis());

        let response = serve_video(State(ctx.state.clone()), AxumPath("clip.mp4".into()))
            .await
            .unwrap();
        assert!(!ctx.dir.path().join("clip.mp4").exists());
        assert!(ctx.state.retention.records().unwrap().is_empty());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn cleanup_reports_counts() {
        let records_dir = tempdir().unwrap();
        let ctx = TestContext::with(
            FakeProducer::default(),
            Arc::new(JsonFileStorage::in_dir(records_dir.path())),
            false,
        );
        let now = ctx.clock.now_millis();
        ctx.track("old.mp4", now - RETENTION_WINDOW_MS);
        ctx.track("fresh.mp4", now - 1_000);

        let Json(response) = cleanup(State(ctx.state.clone())).await.unwrap();
        assert_eq!(response.status, "Cleanup completed successfully");
        assert_eq!(response.deleted, 1);
        assert_eq!(response.failed, 0);
        assert!(!ctx.dir.path().join("old.mp4").exists());
        assert!(ctx.dir.path().join("fresh.mp4").exists());
        assert!(ctx.state.retention.records().unwrap().contains_key("fresh.mp4"));
    }

    #[tokio::test]
    async fn cleanup_with_unreadable_records_is_an_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_corrupt(true);
        let ctx = TestContext::with(FakeProducer::default(), storage, false);
        let err = cleanup(State(ctx.state.clone())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn sweep_middleware_runs_before_download_routes() {
        let ctx = TestContext::new();
        let now = ctx.clock.now_millis();
        ctx.track("stale.mp4", now - RETENTION_WINDOW_MS - 1);

        let app = router(ctx.state.clone());
        let request = axum::http::Request::builder()
            .uri("/api/download/video/missing.mp4")
            .body(Body::empty())
            .unwrap();
        let response = tower_oneshot(app, request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!ctx.dir.path().join("stale.mp4").exists());
    }

    #[tokio::test]
    async fn health_route_responds() {
        let app = router(TestContext::new().state);
        let request = axum::http::Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let response = tower_oneshot(app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "API route is working");
    }

    async fn tower_oneshot(app: Router, request: axum::http::Request<Body>) -> Response {
        use tower::ServiceExt;
        app.oneshot(request).await.unwrap()
    }

    #[test]
    fn cli_maps_overrides() {
        let cli = Cli::try_parse_from([
            "backend",
            "--port",
            "9000",
            "--store",
            "sqlite",
            "--downloads-dir",
            "/tmp/dl",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.store_backend, Some(StoreBackend::Sqlite));
        assert_eq!(overrides.downloads_dir, Some(PathBuf::from("/tmp/dl")));
        assert!(!cli.allow_root);
        assert!(Cli::try_parse_from(["backend", "--store", "redis"]).is_err());
    }
}
