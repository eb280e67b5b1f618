use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Router,
};
use chrono::Local;
use futures_util::{Stream, StreamExt};
use log::{LevelFilter, Log, Metadata, Record};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    convert::Infallible,
    env,
    fs::OpenOptions,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::signal;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, CorsLayer};

use stationcast_server::models::{StationPipelineConfig, SupervisorSettings};
use stationcast_server::services::{
    apply_env_overrides, prune_logs, read_recent_logs, EventBus, JsonStationStore, PipelineSupervisor,
    SettingsManager, StationStore, SupervisorOptions,
};

// ============================================================================
// Constants
// ============================================================================

const ENV_DATA_DIR: &str = "STATIONCAST_DATA_DIR";
const ENV_LOG_DIR: &str = "STATIONCAST_LOG_DIR";
const ENV_CORS_ORIGINS: &str = "STATIONCAST_CORS_ORIGINS";
const LOG_FILE_NAME: &str = "stationcast.log";
const DEFAULT_RECENT_LOG_LINES: usize = 200;

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
struct AppState {
    supervisor: PipelineSupervisor,
    store: Arc<JsonStationStore>,
    settings_manager: Arc<SettingsManager>,
    event_bus: EventBus,
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct InvokeResponse {
    ok: bool,
    data: Option<Value>,
    error: Option<String>,
}

// ============================================================================
// Logging
// ============================================================================

struct ServerLogger {
    file: Mutex<std::fs::File>,
    level: LevelFilter,
}

impl ServerLogger {
    fn new(log_dir: &std::path::Path, level: LevelFilter) -> Result<Self, Box<dyn std::error::Error>> {
        let log_path = log_dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        Ok(Self {
            file: Mutex::new(file),
            level,
        })
    }
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        let line = format!("[{date}][{time}][{target}][{level}] {}", record.args());

        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
        eprintln!("{line}");
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse().ok()
}

fn init_logger(log_dir: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let level = env::var("STATIONCAST_LOG_LEVEL")
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(LevelFilter::Info);
    let logger = ServerLogger::new(log_dir, level)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    Ok(())
}

// ============================================================================
// CORS Configuration
// ============================================================================

fn build_cors_layer() -> CorsLayer {
    let cors_origins = env::var(ENV_CORS_ORIGINS)
        .unwrap_or_else(|_| "http://localhost:*,http://127.0.0.1:*".to_string());

    let allowed_origins: Vec<String> = cors_origins
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let origin_str = match origin.to_str() {
                Ok(s) => s,
                Err(_) => return false,
            };

            allowed_origins.iter().any(|allowed| {
                if allowed.ends_with(":*") {
                    let prefix = allowed.trim_end_matches(":*");
                    origin_str.starts_with(prefix) && origin_str[prefix.len()..].starts_with(':')
                } else {
                    origin_str == allowed
                }
            })
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

// ============================================================================
// Request Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    station_id: Option<String>,
}

/// Server-Sent Events stream of pipeline events, optionally for one station
async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.event_bus.subscribe()).filter_map(move |result| {
        let station_filter = query.station_id.clone();
        async move {
            // Lagged receivers skip what they missed
            let event = result.ok()?;
            if let Some(station_id) = station_filter.as_deref() {
                if event.station_id() != station_id {
                    return None;
                }
            }
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok(Event::default().event(event.name()).data(data)))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn invoke(
    Path(command): Path<String>,
    State(state): State<AppState>,
    payload: Option<Json<Value>>,
) -> impl IntoResponse {
    let payload = payload.map(|Json(value)| value).unwrap_or_else(|| json!({}));

    match invoke_command(&state, &command, payload).await {
        Ok(data) => {
            let response = InvokeResponse {
                ok: true,
                data: Some(data),
                error: None,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(error) => {
            log::debug!("Command {command} failed: {error}");
            let response = InvokeResponse {
                ok: false,
                data: None,
                error: Some(error),
            };
            (StatusCode::BAD_REQUEST, Json(response)).into_response()
        }
    }
}

// ============================================================================
// Command Handler
// ============================================================================

async fn invoke_command(state: &AppState, command: &str, payload: Value) -> Result<Value, String> {
    let supervisor = &state.supervisor;

    match command {
        // Station configuration
        "list_stations" => {
            let ids = state.store.list()?;
            Ok(json!(ids))
        }
        "get_station" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            let config = state
                .store
                .load_config(&station_id)?
                .ok_or_else(|| format!("Station not found: {station_id}"))?;
            Ok(json!(config))
        }
        "save_station" => {
            let config: StationPipelineConfig = get_arg(&payload, "config")?;
            state.store.save(&config)?;
            log::info!("[{}] Station configuration saved", config.id);

            // Live pipelines pick up the new configuration; stopped ones only refresh the manifest
            let status = match supervisor.apply_config(&config.id).await {
                Ok(status) => status,
                Err(e) => {
                    log::warn!("[{}] Saved configuration not applied: {e}", config.id);
                    supervisor.get_status(&config.id).await
                }
            };
            Ok(json!(status))
        }
        "delete_station" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            supervisor.remove_station(&station_id).await.map_err(|e| e.to_string())?;
            let deleted = state.store.delete(&station_id)?;
            Ok(json!(deleted))
        }

        // Pipeline lifecycle
        "start_station" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            let status = supervisor.start(&station_id).await.map_err(|e| e.to_string())?;
            Ok(json!(status))
        }
        "stop_station" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            let status = supervisor.stop(&station_id).await.map_err(|e| e.to_string())?;
            Ok(json!(status))
        }
        "restart_station" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            let status = supervisor.restart(&station_id).await.map_err(|e| e.to_string())?;
            Ok(json!(status))
        }
        "apply_config" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            let status = supervisor.apply_config(&station_id).await.map_err(|e| e.to_string())?;
            Ok(json!(status))
        }
        "get_status" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            Ok(json!(supervisor.get_status(&station_id).await))
        }
        "get_all_statuses" => Ok(json!(supervisor.get_all_statuses().await)),

        // Station assets
        "materialize_playlist" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            let playlist = supervisor
                .materialize_playlist(&station_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!(playlist))
        }
        "generate_snapshot" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            let path = supervisor
                .generate_snapshot(&station_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({ "path": path }))
        }
        "test_now_playing" => {
            let station_id: String = get_arg(&payload, "stationId")?;
            let probe = supervisor
                .test_now_playing(&station_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!(probe))
        }

        // Diagnostics
        "get_recent_logs" => {
            let max_lines: Option<usize> = get_opt_arg(&payload, "maxLines")?;
            let station_id: Option<String> = get_opt_arg(&payload, "stationId")?;
            let lines = read_recent_logs(
                &state.log_dir,
                max_lines.unwrap_or(DEFAULT_RECENT_LOG_LINES),
                station_id.as_deref(),
            )?;
            Ok(json!(lines))
        }
        "get_settings" => {
            let settings = state.settings_manager.load()?;
            Ok(json!(settings))
        }
        "save_settings" => {
            let settings: SupervisorSettings = get_arg(&payload, "settings")?;
            state.settings_manager.save(&settings)?;
            log::info!("Settings saved, supervisor options apply on next server start");
            Ok(Value::Null)
        }

        _ => Err(format!("Unknown command: {command}")),
    }
}

// ============================================================================
// Argument Parsing
// ============================================================================

fn get_arg<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<T, String> {
    let obj = payload
        .as_object()
        .ok_or_else(|| "Invalid payload".to_string())?;
    let value = obj
        .get(key)
        .ok_or_else(|| format!("Missing argument: {key}"))?;
    serde_json::from_value(value.clone()).map_err(|e| format!("Invalid {key}: {e}"))
}

fn get_opt_arg<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<Option<T>, String> {
    let obj = payload
        .as_object()
        .ok_or_else(|| "Invalid payload".to_string())?;
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| format!("Invalid {key}: {e}")),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn parse_host(host: &str) -> IpAddr {
    host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Configured binary, else the first `ffmpeg` on PATH
fn resolve_ffmpeg_path(configured: &str) -> String {
    let configured = configured.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    match which::which("ffmpeg") {
        Ok(path) => path.to_string_lossy().to_string(),
        Err(e) => {
            log::warn!("FFmpeg not found on PATH ({e}); pipelines will fail to start");
            "ffmpeg".to_string()
        }
    }
}

/// Graceful shutdown signal handler
/// Waits for Ctrl+C or SIGTERM, then stops every pipeline
async fn shutdown_signal(supervisor: PipelineSupervisor) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received, stopping pipelines...");
    supervisor.shutdown().await;
    log::info!("All pipelines stopped, server shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from environment
    let data_dir = PathBuf::from(env::var(ENV_DATA_DIR).unwrap_or_else(|_| "data".to_string()));
    let log_dir = env::var(ENV_LOG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("logs"));

    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(&log_dir)?;
    init_logger(&log_dir)?;

    let settings_manager = Arc::new(SettingsManager::new(data_dir.clone()));
    let mut settings = settings_manager.load().unwrap_or_else(|e| {
        log::warn!("Failed to load settings, using defaults: {e}");
        SupervisorSettings::default()
    });
    apply_env_overrides(&mut settings);

    match prune_logs(&log_dir, settings.log_retention_days) {
        Ok(removed) if removed > 0 => log::info!("Removed {removed} expired log file(s)"),
        Ok(_) => {}
        Err(e) => log::warn!("Log retention cleanup failed: {e}"),
    }

    let ffmpeg_path = resolve_ffmpeg_path(&settings.ffmpeg_path);
    log::info!("Using FFmpeg at {ffmpeg_path}");

    let store = Arc::new(JsonStationStore::new(data_dir.join("stations")));
    let options = SupervisorOptions::from_settings(&settings, ffmpeg_path, data_dir.join("runtime"));
    let supervisor = PipelineSupervisor::new(store.clone(), options);

    let event_bus = EventBus::new();
    supervisor.subscribe(Arc::new(event_bus.clone()));

    let state = AppState {
        supervisor: supervisor.clone(),
        store,
        settings_manager,
        event_bus,
        log_dir,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/events", get(events))
        .route("/api/invoke/:command", post(invoke))
        .with_state(state)
        .layer(build_cors_layer());

    let address = SocketAddr::new(parse_host(&settings.backend_host), settings.backend_port);
    log::info!("StationCast backend listening on http://{address}");

    let listener = tokio::net::TcpListener::bind(address).await?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await?;

    log::logger().flush();
    Ok(())
}
