use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, patch, post},
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, instrument};

use crate::config::{self, FilterAdjustments};
use crate::dither::DitherType;
use crate::processor::{ProcessOutput, Processor};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Clone)]
pub struct AppState {
    pub cfg: config::SharedConfig,
    pub processor: Arc<Processor>,
}

#[derive(Deserialize)]
pub struct ProcessRequest {
    pub source: String,
    #[serde(default)]
    pub adjustments: Option<FilterAdjustments>,
    /// Absent, `null` or `true`: use the configured default. `false` or `"off"`:
    /// no dithering. Otherwise any spelling accepted by `DitherType::from_str`.
    #[serde(default)]
    pub dither: Option<JsonValue>,
}

/// What a request asked for in its `dither` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DitherChoice {
    Default,
    Off,
    Use(DitherType),
}

impl DitherChoice {
    fn from_json(value: Option<&JsonValue>) -> Result<Self, StatusCode> {
        match value {
            None | Some(JsonValue::Null) | Some(JsonValue::Bool(true)) => Ok(Self::Default),
            Some(JsonValue::Bool(false)) => Ok(Self::Off),
            Some(JsonValue::String(name)) if name.trim().eq_ignore_ascii_case("off") => Ok(Self::Off),
            Some(JsonValue::String(name)) => parse_dither(name).map(Self::Use),
            Some(_) => Err(StatusCode::BAD_REQUEST),
        }
    }
}

// Logs all 4xx/5xx responses with method, URI, status and latency.
async fn log_error_responses(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let res = next.run(req).await;
    let status = res.status();
    if status.is_server_error() {
        tracing::error!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 5xx");
    } else if status.is_client_error() {
        tracing::warn!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 4xx");
    }
    res
}

fn parse_dither(name: &str) -> Result<DitherType, StatusCode> {
    DitherType::from_str(name).map_err(|e| {
        tracing::debug!(error = %e, accepted = ?DitherType::ALL, "rejecting request");
        StatusCode::BAD_REQUEST
    })
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<config::Config>, StatusCode> {
    config::ConfigManager::to_struct(&state.cfg)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Process one image. Processing failures come back as `outcome: fallback`, never as an error status.
pub async fn process_image(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> Result<Json<ProcessOutput>, StatusCode> {
    let choice = DitherChoice::from_json(req.dither.as_ref())?;
    let defaults = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .defaults
        .unwrap_or_default();
    let adjustments = req.adjustments.unwrap_or(defaults.adjustments);
    let dither = match choice {
        DitherChoice::Default => defaults.dither,
        DitherChoice::Off => None,
        DitherChoice::Use(kind) => Some(kind),
    };
    let out = state
        .processor
        .process(&req.source, &adjustments, dither)
        .await;
    Ok(Json(out))
}

/// Update and persist `[defaults]`. The dither name is validated before anything is written;
/// `false` or `"off"` removes the default algorithm.
#[instrument(err, skip_all)]
pub async fn patch_defaults(
    State(state): State<AppState>,
    Json(mut payload): Json<JsonValue>,
) -> Result<Json<config::Config>, StatusCode> {
    let JsonValue::Object(map) = &mut payload else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let choice = match map.remove("dither") {
        Some(JsonValue::Bool(true)) => return Err(StatusCode::BAD_REQUEST),
        other => DitherChoice::from_json(other.as_ref())?,
    };
    let mut update: config::DefaultsUpdate =
        serde_json::from_value(payload).map_err(|_| StatusCode::BAD_REQUEST)?;
    match choice {
        DitherChoice::Default => {}
        DitherChoice::Off => update.clear_dither = true,
        DitherChoice::Use(kind) => update.dither = Some(kind),
    }

    config::ConfigManager::update_defaults(&state.cfg, &update)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    config::ConfigManager::save(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    get_config(State(state)).await
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    // Build API router and mount it under /api
    let api = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/config/defaults", patch(patch_defaults))
        .route("/process", post(process_image))
        .with_state(state)
        .layer(cors)
        .layer(trace)
        .layer(middleware::from_fn(log_error_responses));

    Router::new().nest("/api", api)
}

/// Serve the HTTP API. If `bind` is Some it is parsed as a socket address, otherwise
/// defaults to 0.0.0.0:8080.
pub async fn serve(app: Router, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!(addr=%addr, "starting http server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, RasterFormat, RasterImage};
    use crate::config::ConfigManager;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
[cache]
enabled = false

[defaults]
dither = "none"
luminance_threshold = 128.0
"#;

    async fn app(dir: &Path) -> Router {
        let path = dir.join("halftone.toml");
        std::fs::write(&path, CONFIG).unwrap();
        let cfg = ConfigManager::load(Some(path)).await.unwrap();
        let typed = ConfigManager::to_struct(&cfg).await.unwrap();
        let processor = Processor::from_config(&typed);
        assert!(matches!(typed.cache.and_then(|c| c.enabled), Some(false)));
        router(AppState {
            cfg,
            processor: Arc::new(processor),
        })
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let body = res.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn png_uri(rgba: [u8; 4]) -> String {
        let bytes = codec::encode(&RasterImage::filled(3, 2, rgba), RasterFormat::Png, 90).unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(bytes))
    }

    #[tokio::test]
    async fn health_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let req = Request::get("/api/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn process_uses_configured_default_dither() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let req = json_request("POST", "/api/process", serde_json::json!({ "source": png_uri([200, 200, 200, 255]) }));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let out: JsonValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(out["outcome"], "processed");

        let uri = out["output"].as_str().unwrap();
        let payload = uri.strip_prefix("data:image/png;base64,").unwrap();
        let img = codec::decode(&STANDARD.decode(payload).unwrap(), RasterFormat::Png).unwrap();
        assert!(img.pixels.chunks_exact(4).all(|p| p[..3] == [255, 255, 255]));
    }

    #[tokio::test]
    async fn process_failure_is_a_fallback_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let req = json_request(
            "POST",
            "/api/process",
            serde_json::json!({ "source": "/no/such/file.png", "dither": "bayer-4x4" }),
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let out: JsonValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(out["outcome"], "fallback");
        assert_eq!(out["output"], "/no/such/file.png");
    }

    #[tokio::test]
    async fn unknown_dither_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let req = json_request(
            "POST",
            "/api/process",
            serde_json::json!({ "source": png_uri([0, 0, 0, 255]), "dither": "sierra" }),
        );
        assert_eq!(send(&app, req).await.0, StatusCode::BAD_REQUEST);

        let req = json_request("PATCH", "/api/config/defaults", serde_json::json!({ "dither": "sierra" }));
        assert_eq!(send(&app, req).await.0, StatusCode::BAD_REQUEST);
    }

    fn decode_output(body: &[u8]) -> RasterImage {
        let out: JsonValue = serde_json::from_slice(body).unwrap();
        assert_eq!(out["outcome"], "processed", "{out}");
        let payload = out["output"]
            .as_str()
            .unwrap()
            .strip_prefix("data:image/png;base64,")
            .unwrap();
        codec::decode(&STANDARD.decode(payload).unwrap(), RasterFormat::Png).unwrap()
    }

    #[tokio::test]
    async fn dither_can_be_turned_off_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let gray = [100, 100, 100, 255];
        for dither in [serde_json::json!(false), serde_json::json!("off"), serde_json::json!(" OFF ")] {
            let req = json_request(
                "POST",
                "/api/process",
                serde_json::json!({ "source": png_uri(gray), "dither": dither }),
            );
            let (status, body) = send(&app, req).await;
            assert_eq!(status, StatusCode::OK, "{dither}");
            let img = decode_output(&body);
            assert!(img.pixels.chunks_exact(4).all(|p| p == gray), "{dither}");
        }

        // null still means "use the default", which thresholds 100 to black.
        let req = json_request(
            "POST",
            "/api/process",
            serde_json::json!({ "source": png_uri(gray), "dither": null }),
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(decode_output(&body).pixels.chunks_exact(4).all(|p| p[..3] == [0, 0, 0]));

        let req = json_request(
            "POST",
            "/api/process",
            serde_json::json!({ "source": png_uri(gray), "dither": 3 }),
        );
        assert_eq!(send(&app, req).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_can_clear_default_dither() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let req = json_request("PATCH", "/api/config/defaults", serde_json::json!({ "dither": "off" }));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let cfg: JsonValue = serde_json::from_slice(&body).unwrap();
        assert!(cfg["defaults"]["dither"].is_null(), "{cfg}");
        assert_eq!(cfg["defaults"]["luminance_threshold"], 128.0);

        let gray = [100, 100, 100, 255];
        let req = json_request("POST", "/api/process", serde_json::json!({ "source": png_uri(gray) }));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(decode_output(&body).pixels.chunks_exact(4).all(|p| p == gray));
    }

    #[tokio::test]
    async fn patch_defaults_persists() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let req = json_request(
            "PATCH",
            "/api/config/defaults",
            serde_json::json!({ "dither": "Floyd-Steinberg", "luminanceThreshold": 90.5, "invert": true }),
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let cfg: JsonValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(cfg["defaults"]["dither"], "floyd_steinberg");
        assert_eq!(cfg["defaults"]["luminance_threshold"], 90.5);

        let on_disk = std::fs::read_to_string(dir.path().join("halftone.toml")).unwrap();
        assert!(on_disk.contains("dither = \"floyd_steinberg\""), "{on_disk}");
        assert!(on_disk.contains("invert = true"), "{on_disk}");

        let req = Request::get("/api/config").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let cfg: JsonValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(cfg["defaults"]["invert"], true);
    }
}
