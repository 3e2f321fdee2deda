use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use portraitcore::{PredictionInput, PredictionRequest, RunId};
use portraitengine::{ensure_weights, ComfyEngine, EngineProcess};
use portraitruntime::{PortraitRuntime, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<PortraitRuntime>,
    /// One prediction at a time
    run_lock: Mutex<()>,
    results_dir: PathBuf,
}

/// Request body for a prediction
#[derive(Debug, Deserialize)]
struct PredictionBody {
    input: PredictionInput,
}

#[derive(Debug, Serialize, Deserialize)]
struct PredictionResponse {
    id: Option<RunId>,
    status: String,
    output: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PredictionResponse {
    fn succeeded(id: RunId, output: Vec<PathBuf>) -> Self {
        Self {
            id: Some(id),
            status: "succeeded".to_string(),
            output,
            error: None,
        }
    }

    fn failed(id: Option<RunId>, error: impl ToString) -> Self {
        Self {
            id,
            status: "failed".to_string(),
            output: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Health check endpoint
#[get("/health-check")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    match data.runtime.health().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "READY",
            "version": env!("CARGO_PKG_VERSION"),
        })),
        Err(e) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "UNHEALTHY",
            "error": e.to_string(),
        })),
    }
}

/// Run a prediction
#[post("/predictions")]
async fn create_prediction(
    data: web::Data<AppState>,
    body: web::Json<PredictionBody>,
) -> ActixResult<impl Responder> {
    // Validation happens before any staging
    let request = match PredictionRequest::try_from(body.into_inner().input) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected prediction request: {}", e);
            return Ok(HttpResponse::UnprocessableEntity().json(PredictionResponse::failed(None, e)));
        }
    };

    let _guard = data.run_lock.lock().await;

    let prediction = match data.runtime.predict(&request).await {
        Ok(prediction) => prediction,
        Err(e) if e.is_input_error() => {
            warn!("Prediction rejected: {}", e);
            return Ok(HttpResponse::UnprocessableEntity().json(PredictionResponse::failed(None, e)));
        }
        Err(e) => {
            error!("Prediction failed: {}", e);
            return Ok(HttpResponse::InternalServerError().json(PredictionResponse::failed(None, e)));
        }
    };

    let run_id = prediction.run_id();
    match prediction.persist_to(&data.results_dir).await {
        Ok(output) => {
            info!(run_id = %run_id, "Prediction succeeded with {} output(s)", output.len());
            Ok(HttpResponse::Ok().json(PredictionResponse::succeeded(run_id, output)))
        }
        Err(e) => {
            error!(run_id = %run_id, "Failed to persist outputs: {}", e);
            Ok(HttpResponse::InternalServerError().json(PredictionResponse::failed(Some(run_id), e)))
        }
    }
}

/// WebSocket endpoint for real-time run events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// Where persisted outputs go when `PORTRAIT_RESULTS_DIR` is unset
fn default_results_dir() -> PathBuf {
    std::env::temp_dir().join("portrait-results")
}

fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(create_prediction)
        .service(websocket_events);
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting LivePortrait prediction server");

    let config_path = std::env::var("PORTRAIT_CONFIG").ok().map(PathBuf::from);
    let config = RuntimeConfig::load(config_path.as_deref())?;

    let results_dir = std::env::var("PORTRAIT_RESULTS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_results_dir());
    if let Some(launch) = &config.engine_launch {
        if results_dir.starts_with(&launch.output_dir) || launch.output_dir.starts_with(&results_dir) {
            anyhow::bail!(
                "results directory {} overlaps the engine output directory {}",
                results_dir.display(),
                launch.output_dir.display()
            );
        }
    }

    let mut engine = ComfyEngine::new(config.engine_address.clone()).with_poll_interval(config.poll_interval());
    if let Some(launch) = &config.engine_launch {
        engine = engine.with_local_dirs(launch);
    }
    let runtime = PortraitRuntime::new(config, Arc::new(engine));

    let downloaded = ensure_weights(
        runtime.weights(),
        &runtime.config().weights_dir,
        runtime.config().weights_url.as_deref(),
    )
    .await?;
    if !downloaded.is_empty() {
        info!("Downloaded {} weight file(s)", downloaded.len());
    }

    // Held for the lifetime of the server; dropping it stops the engine
    let _engine_process = match &runtime.config().engine_launch {
        Some(launch) => Some(EngineProcess::start(launch, &runtime.config().engine_address).await?),
        None => None,
    };

    info!("✅ Runtime initialized against engine at {}", runtime.config().engine_address);

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
        run_lock: Mutex::new(()),
        results_dir,
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};
    use async_trait::async_trait;
    use portraitcore::EngineError;
    use portraitruntime::{Engine, EngineJob};

    struct StubEngine {
        fail: bool,
    }

    #[async_trait]
    impl Engine for StubEngine {
        fn name(&self) -> &str {
            "stub"
        }

        async fn submit(&self, job: EngineJob<'_>) -> Result<(), EngineError> {
            if self.fail {
                return Err(EngineError::ExecutionFailed("boom".to_string()));
            }
            tokio::fs::write(job.workspace.output_dir().join("out.mp4"), b"video")
                .await
                .map_err(|e| EngineError::Protocol(e.to_string()))
        }
    }

    fn state(dir: &std::path::Path, fail: bool) -> web::Data<AppState> {
        let config = RuntimeConfig {
            template_path: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../../workflow_api.json")),
            staging_root: dir.join("staging"),
            ..Default::default()
        };
        web::Data::new(AppState {
            runtime: Arc::new(PortraitRuntime::new(config, Arc::new(StubEngine { fail }))),
            run_lock: Mutex::new(()),
            results_dir: dir.join("results"),
        })
    }

    fn inputs(dir: &std::path::Path) -> (PathBuf, PathBuf) {
        let face = dir.join("face.png");
        let video = dir.join("clip.mp4");
        std::fs::write(&face, b"png").unwrap();
        std::fs::write(&video, b"mp4").unwrap();
        (face, video)
    }

    #[::core::prelude::v1::test]
    fn test_default_results_dir_is_not_engine_output() {
        let launch = portraitruntime::EngineLaunch::default();
        assert!(!default_results_dir().starts_with(&launch.output_dir));
        assert!(!launch.output_dir.starts_with(default_results_dir()));
    }

    #[actix_web::test]
    async fn test_prediction_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (face, video) = inputs(dir.path());
        let app = test::init_service(App::new().app_data(state(dir.path(), false)).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/predictions")
            .set_json(serde_json::json!({
                "input": {"face_image": face, "driving_video": video, "live_portrait_scale": 2.0}
            }))
            .to_request();
        let resp: PredictionResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp.status, "succeeded");
        assert_eq!(resp.output.len(), 1);
        assert!(resp.output[0].starts_with(dir.path().join("results")));
        assert_eq!(std::fs::read(&resp.output[0]).unwrap(), b"video");
    }

    #[actix_web::test]
    async fn test_out_of_range_rejected_before_staging() {
        let dir = tempfile::tempdir().unwrap();
        let (face, video) = inputs(dir.path());
        let app = test::init_service(App::new().app_data(state(dir.path(), false)).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/predictions")
            .set_json(serde_json::json!({
                "input": {"face_image": face, "driving_video": video, "live_portrait_dsize": 10}
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!dir.path().join("staging").exists());
    }

    #[actix_web::test]
    async fn test_engine_failure_returns_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let (face, video) = inputs(dir.path());
        let app = test::init_service(App::new().app_data(state(dir.path(), true)).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/predictions")
            .set_json(serde_json::json!({
                "input": {"face_image": face, "driving_video": video}
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: PredictionResponse = test::read_body_json(resp).await;
        assert_eq!(body.status, "failed");
        assert!(body.output.is_empty());
        assert!(body.error.unwrap().contains("boom"));
        assert!(!dir.path().join("results").exists());
    }
}
