use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json as JsonResponse, Response},
    routing::{get, post},
};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use application::{
    ApplicationError, FindAllRequest, FindRequest, ListTablesResponse, StatsService, StoreProvider,
    SystemClock, TableResponse, TableService, UpdateBatch,
};
use domain::{RecordInput, TableSchema};
use infrastructure::{InMemoryWorkbook, JsonFileStoreProvider};

#[derive(Clone)]
struct AppState {
    table_service: Arc<TableService>,
    stats_service: Arc<StatsService>,
}

#[derive(Error, Debug)]
enum StartupError {
    #[error("Failed to bind to address {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

const DEFAULT_PORT: u16 = 3000;

fn port_from_env() -> u16 {
    match env::var("PORT") {
        Ok(port_str) => match u16::from_str(&port_str) {
            Ok(port_num) => {
                info!("Using port {} from environment variable PORT.", port_num);
                port_num
            }
            Err(_) => {
                warn!(
                    "Invalid PORT value '{}' in environment variable. Using default port {}.",
                    port_str, DEFAULT_PORT
                );
                DEFAULT_PORT
            }
        },
        Err(_) => {
            info!(
                "PORT environment variable not set. Using default port {}.",
                DEFAULT_PORT
            );
            DEFAULT_PORT
        }
    }
}

/// `DATA_DIR` selects the JSON file store; without it tables live in memory only.
fn store_provider_from_env() -> Arc<dyn StoreProvider> {
    match env::var("DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            info!(data_dir = %dir, "Using JSON file table store");
            Arc::new(JsonFileStoreProvider::new(PathBuf::from(dir)))
        }
        _ => {
            info!("DATA_DIR not set. Using in-memory table store.");
            Arc::new(InMemoryWorkbook::new())
        }
    }
}

// Application entry point
#[tokio::main]
async fn main() {
    // --- Logger Initialization ---
    let filter: EnvFilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    info!("Logger initialized successfully.");

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let port = port_from_env();

    // --- Dependency Injection ---
    let provider = store_provider_from_env();
    let table_service = Arc::new(TableService::new(provider, Arc::new(SystemClock)));
    let stats_service = Arc::new(StatsService::new(table_service.clone()));
    let app_state = AppState {
        table_service,
        stats_service,
    };
    info!("Application services initialized.");

    // --- API Router Definition ---
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats_handler))
        .route("/tables", post(create_table_handler).get(list_tables_handler))
        .route("/tables/:name", get(get_table_handler))
        .route("/tables/:name/records", get(list_records_handler))
        .route("/tables/:name/find", post(find_handler))
        .route("/tables/:name/find_all", post(find_all_handler))
        .route("/tables/:name/update", post(update_handler))
        .route("/tables/:name/reload", post(reload_handler))
        .with_state(app_state);
    info!("API routes configured.");

    // --- Server Startup ---
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server starting on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    info!("Server listening on {}", addr);
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(StartupError::Serve)
}

// --- API Handlers ---

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Handler for creating and loading a table (POST /tables).
async fn create_table_handler(
    State(state): State<AppState>,
    Json(payload): Json<TableSchema>,
) -> Response {
    info!(table = %payload.name, "Received request to create table");
    match state.table_service.create_table(payload).await {
        Ok(schema) => (StatusCode::CREATED, JsonResponse(TableResponse { name: schema.name })).into_response(),
        Err(e) => {
            error!("Failed to create table via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for listing all tables (GET /tables).
async fn list_tables_handler(State(state): State<AppState>) -> Response {
    let tables = state
        .table_service
        .list_tables()
        .await
        .into_iter()
        .map(|name| TableResponse { name })
        .collect();
    (StatusCode::OK, JsonResponse(ListTablesResponse { tables })).into_response()
}

/// Handler for getting a table schema (GET /tables/:name).
async fn get_table_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.table_service.get_schema(&name).await {
        Ok(schema) => (StatusCode::OK, JsonResponse(schema)).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for listing every record of a table (GET /tables/:name/records).
async fn list_records_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.table_service.records(&name).await {
        Ok(response) => (StatusCode::OK, JsonResponse(response)).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for a single key lookup (POST /tables/:name/find).
async fn find_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<FindRequest>,
) -> Response {
    match state.table_service.find(&name, &request.key).await {
        Ok(record) => (StatusCode::OK, JsonResponse(record)).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for a batch key lookup (POST /tables/:name/find_all).
async fn find_all_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<FindAllRequest>,
) -> Response {
    info!(table = %name, count = request.keys.len(), "Received batch lookup");
    match state.table_service.find_all(&name, &request.keys).await {
        Ok(response) => (StatusCode::OK, JsonResponse(response)).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for inserting and updating records (POST /tables/:name/update).
async fn update_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<UpdateBatch>,
) -> Response {
    let batch: Vec<RecordInput> = body.into();
    info!(table = %name, batch_size = batch.len(), "Received update batch");
    match state.table_service.update(&name, batch).await {
        Ok(outcome) => (StatusCode::OK, JsonResponse(outcome)).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for resynchronizing a table from its store (POST /tables/:name/reload).
async fn reload_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.table_service.reload(&name).await {
        Ok(rows) => {
            info!(table = %name, rows, "Table reloaded via handler");
            (StatusCode::OK, JsonResponse(serde_json::json!({ "rows": rows }))).into_response()
        }
        Err(e) => map_application_error_to_response(e),
    }
}

async fn get_stats_handler(State(state): State<AppState>) -> Response {
    match state.stats_service.get_stats().await {
        Ok(stats_response) => (StatusCode::OK, JsonResponse(stats_response)).into_response(),
        Err(e) => {
            error!("Failed to get statistics via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Maps ApplicationError to HTTP status codes and a response body.
fn map_application_error_to_response(err: ApplicationError) -> Response {
    let status = match &err {
        ApplicationError::TableNotFound(_) | ApplicationError::NotFound { .. } => StatusCode::NOT_FOUND,
        ApplicationError::TableAlreadyExists(_) | ApplicationError::Conflict { .. } => StatusCode::CONFLICT,
        ApplicationError::DuplicateKey { .. }
        | ApplicationError::SchemaViolation(_) => {
            warn!("Rejected request: {}", err);
            StatusCode::BAD_REQUEST
        }
        ApplicationError::NotLoaded(_) => StatusCode::SERVICE_UNAVAILABLE,
        ApplicationError::MissingColumn { .. }
        | ApplicationError::InvalidRow { .. }
        | ApplicationError::StoreFailure { .. }
        | ApplicationError::InfrastructureError(_) => {
            error!("Underlying store error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string()).into_response()
}
