mod progress;

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine as _};
use clap::Parser;
use dexpert_core::catalog::{self, ModelEntry, ScheduleEntry};
use dexpert_core::settings::ModelDirectories;
use dexpert_core::{
    CandleFactory, Engine, EngineOptions, ErrorKind, ExtraInputs, GenerationOutcome, GenerationRequest, RequestState,
    Settings,
};
use image::DynamicImage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tracing::Level;

use progress::{ProgressBoard, ProgressSnapshot};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stable Diffusion generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Data directory holding models/, lora/, vae/ and configs/
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// JSON file with the initial settings
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Keep unfused checkpoints in memory so adapter changes skip disk reads
    #[arg(long)]
    keep_in_memory: bool,

    /// Never download missing components
    #[arg(long)]
    offline: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

struct AppState {
    engine: Mutex<Engine<CandleFactory>>,
    board: Arc<ProgressBoard>,
    /// Snapshot of the engine's directories so listings never wait on a generation.
    dirs: RwLock<ModelDirectories>,
}

type SharedState = Arc<AppState>;

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Body {
            error: String,
        }
        (self.0, Json(Body { error: self.1 })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ModelNotFound | ErrorKind::AdapterNotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput | ErrorKind::IncompatibleModelMode | ErrorKind::AdapterLayerMismatch => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::CorruptArchive | ErrorKind::UnsupportedFormat | ErrorKind::UnrecognizedArchitecture => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::DeviceOutOfMemory => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Deserialize)]
struct GenerationBody {
    #[serde(flatten)]
    request: GenerationRequest,
    /// Base64-encoded source image for img2img and inpainting.
    init_image: Option<String>,
    /// Base64-encoded mask, white where the image is repainted.
    mask: Option<String>,
    strength: Option<f64>,
}

#[derive(Serialize)]
struct GenerationResponse {
    #[serde(flatten)]
    outcome: GenerationOutcome,
    /// Base64-encoded PNGs.
    images: Vec<String>,
}

fn decode_image(field: &str, data: &str) -> Result<DynamicImage, ApiError> {
    let bytes = BASE64_STANDARD
        .decode(data)
        .map_err(|err| ApiError(StatusCode::BAD_REQUEST, format!("{field} is not base64: {err}")))?;
    image::load_from_memory(&bytes)
        .map_err(|err| ApiError(StatusCode::BAD_REQUEST, format!("{field} is not an image: {err}")))
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("encoding png")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

fn extra_inputs(body: &GenerationBody) -> Result<ExtraInputs, ApiError> {
    let mut inputs = ExtraInputs::default();
    if let Some(data) = &body.init_image {
        inputs.init_image = Some(decode_image("init_image", data)?);
    }
    if let Some(data) = &body.mask {
        inputs.mask = Some(decode_image("mask", data)?);
    }
    if let Some(strength) = body.strength {
        inputs.strength = strength;
    }
    Ok(inputs)
}

async fn generate_image_handler(
    State(state): State<SharedState>,
    Json(body): Json<GenerationBody>,
) -> Result<Response, ApiError> {
    let inputs = extra_inputs(&body)?;
    let busy = state
        .board
        .begin()
        .ok_or_else(|| ApiError(StatusCode::CONFLICT, "a generation is already running".to_string()))?;

    let worker_state = Arc::clone(&state);
    let outcome = tokio::task::spawn_blocking(move || {
        let _busy = busy;
        let mut engine = worker_state.engine.lock();
        engine.generate(&body.request, &inputs, worker_state.board.as_ref())
    })
    .await
    .context("generation task panicked")?;

    let status = match (&outcome.state, &outcome.error) {
        (RequestState::Failed, Some(error)) => status_for(error.kind),
        _ => StatusCode::OK,
    };
    let images = outcome
        .images
        .iter()
        .map(image_to_base64_png)
        .collect::<Result<Vec<_>>>()?;
    Ok((status, Json(GenerationResponse { outcome, images })).into_response())
}

async fn progress_handler(State(state): State<SharedState>) -> Json<ProgressSnapshot> {
    Json(state.board.snapshot())
}

async fn cancel_handler(State(state): State<SharedState>) -> StatusCode {
    if state.board.is_busy() {
        state.board.cancel();
        StatusCode::ACCEPTED
    } else {
        StatusCode::NO_CONTENT
    }
}

#[derive(Serialize)]
struct SettingsResponse {
    changed: bool,
    epoch: u64,
}

async fn settings_handler(
    State(state): State<SharedState>,
    Json(updates): Json<Map<String, Value>>,
) -> Result<Json<SettingsResponse>, ApiError> {
    if state.board.is_busy() {
        return Err(ApiError(
            StatusCode::CONFLICT,
            "settings cannot change during a generation".to_string(),
        ));
    }
    let worker_state = Arc::clone(&state);
    let response = tokio::task::spawn_blocking(move || -> Result<SettingsResponse, ApiError> {
        let mut engine = worker_state.engine.lock();
        let changed = engine
            .apply_settings(updates)
            .map_err(|err| ApiError(status_for(err.kind()), err.to_string()))?;
        *worker_state.dirs.write() = engine.cache().directories().clone();
        Ok(SettingsResponse {
            changed,
            epoch: engine.settings().epoch(),
        })
    })
    .await
    .context("settings task panicked")??;
    Ok(Json(response))
}

async fn models_handler(State(state): State<SharedState>) -> Json<Vec<ModelEntry>> {
    Json(catalog::list_models(&state.dirs.read()))
}

async fn adapters_handler(State(state): State<SharedState>) -> Json<Vec<String>> {
    Json(catalog::list_adapters(&state.dirs.read()))
}

async fn schedules_handler() -> Json<Vec<ScheduleEntry>> {
    Json(catalog::list_schedules())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut settings = match &args.settings {
        Some(path) => Settings::from_file(path).with_context(|| format!("reading settings {}", path.display()))?,
        None => Settings::default(),
    };
    if args.cpu {
        settings.set(dexpert_core::settings::DEVICE, Value::from("cpu"));
    }

    let factory = CandleFactory::new(ModelDirectories::new(&args.root)).offline(args.offline);
    let options = EngineOptions {
        keep_in_memory: args.keep_in_memory,
        ..EngineOptions::default()
    };
    let engine = Engine::new(factory, &args.root, settings, options).context("starting engine")?;
    let dirs = engine.cache().directories().clone();

    let state = Arc::new(AppState {
        engine: Mutex::new(engine),
        board: Arc::new(ProgressBoard::default()),
        dirs: RwLock::new(dirs),
    });

    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/progress", get(progress_handler))
        .route("/v1/cancel", post(cancel_handler))
        .route("/v1/settings", put(settings_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/adapters", get(adapters_handler))
        .route("/v1/schedules", get(schedules_handler))
        .with_state(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
