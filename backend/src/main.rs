use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use property_valuation_backend::collaborators::csv_provider::CsvDataProvider;
use property_valuation_backend::collaborators::indexer::ProvenanceLogIndexer;
use property_valuation_backend::collaborators::model_runner::{HeuristicModelRunner, HttpModelRunner};
use property_valuation_backend::collaborators::pg_provider::PgDataProvider;
use property_valuation_backend::collaborators::registry::InMemoryDatasetRegistry;
use property_valuation_backend::collaborators::{
    DataProvider, DatasetRegistry, ModelRunner, RegistryAction, RegistryError, RegistryRecord,
};
use property_valuation_backend::config::ValuationConfig;
use property_valuation_backend::valuation::error::ValuationError;
use property_valuation_backend::valuation::pipeline::{ValuationPipeline, ValuationRequest};
use property_valuation_backend::valuation::FinalReport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Registry name of the dataset the local comparables come from
const REFERENCE_DATASET: &str = "local_comparables";

#[derive(Clone)]
struct AppState {
    pipeline: Arc<ValuationPipeline>,
    provider: Option<Arc<dyn DataProvider>>,
    registry: Arc<InMemoryDatasetRegistry>,
}

#[derive(Serialize, Deserialize)]
struct ApiResponse {
    message: String,
    status: String,
}

#[derive(Deserialize)]
struct DatasetRequest {
    action: RegistryAction,
    name: String,
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    version: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Starting property valuation API server");

    dotenvy::dotenv().ok();
    let config = ValuationConfig::from_env().context("Invalid configuration")?;

    let provider: Option<Arc<dyn DataProvider>> = if let Some(url) = &config.database_url {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .context("Failed to connect to database")?;
        info!("Database connected");
        Some(Arc::new(PgDataProvider::new(pool, "postgres")))
    } else if let Some(path) = &config.comps_csv {
        info!("Using comparables file {}", path);
        Some(Arc::new(CsvDataProvider::new(path, "comps_csv")))
    } else {
        warn!("No data provider configured; requests must supply records inline");
        None
    };

    let model_runner: Option<Arc<dyn ModelRunner>> = match &config.model_url {
        Some(url) => Some(Arc::new(
            HttpModelRunner::new(url, config.retry.timeout).context("Failed to build model client")?,
        )),
        None if config.model_heuristic => Some(Arc::new(HeuristicModelRunner)),
        None => None,
    };

    let registry = Arc::new(InMemoryDatasetRegistry::new());
    let source = match (&config.database_url, &config.comps_csv) {
        (Some(_), _) => "postgres",
        (None, Some(_)) => "comps_csv",
        (None, None) => "inline",
    };
    registry
        .apply(RegistryAction::Register, REFERENCE_DATASET, None, Some(source.to_string()))
        .await
        .context("Failed to register reference dataset")?;

    let mut pipeline = ValuationPipeline::new(config.clone())
        .with_registry(registry.clone(), REFERENCE_DATASET)
        .with_indexer(Arc::new(ProvenanceLogIndexer::new()));
    if let Some(runner) = model_runner {
        pipeline = pipeline.with_model_runner(runner);
    }

    let state = AppState {
        pipeline: Arc::new(pipeline),
        provider,
        registry,
    };

    let app = Router::new()
        .route("/", get(health_check))
        .route("/api/health", get(health_check))
        .route("/api/valuations", post(create_valuation))
        .route("/api/datasets", post(apply_dataset_action))
        .route("/api/datasets/:name", get(get_dataset))
        .route("/api/datasets/:name/history", get(get_dataset_history))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Server running on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> Json<ApiResponse> {
    Json(ApiResponse {
        message: "Property valuation API is running!".to_string(),
        status: "ok".to_string(),
    })
}

async fn create_valuation(
    State(state): State<AppState>,
    Json(request): Json<ValuationRequest>,
) -> Result<Json<FinalReport>, ApiError> {
    // Dropping the handler (client gone) cancels the request
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let report = state
        .pipeline
        .run(request, state.provider.as_deref(), cancel)
        .await?;
    Ok(Json(report))
}

async fn apply_dataset_action(
    State(state): State<AppState>,
    Json(request): Json<DatasetRequest>,
) -> Result<Json<RegistryRecord>, ApiError> {
    let record = state
        .registry
        .apply(request.action, &request.name, request.schema, request.version)
        .await?;
    Ok(Json(record))
}

async fn get_dataset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RegistryRecord>, ApiError> {
    Ok(Json(state.registry.info(&name).await?))
}

async fn get_dataset_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<RegistryRecord>>, ApiError> {
    Ok(Json(state.registry.history(&name).await?))
}

enum ApiError {
    Valuation(ValuationError),
    Registry(RegistryError),
}

impl From<ValuationError> for ApiError {
    fn from(err: ValuationError) -> Self {
        ApiError::Valuation(err)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ApiError::Registry(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Valuation(err) => {
                let status = match &err {
                    ValuationError::MalformedInput { .. }
                    | ValuationError::NoMethodAvailable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    ValuationError::DataUnavailable { .. } => StatusCode::BAD_GATEWAY,
                    ValuationError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    ValuationError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, json!({ "stage": err.stage(), "error": err.to_string() }))
            }
            ApiError::Registry(err) => {
                let status = match &err {
                    RegistryError::AlreadyRegistered(_) => StatusCode::CONFLICT,
                    RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                    RegistryError::EmptyName => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, json!({ "stage": "DatasetRegistry", "error": err.to_string() }))
            }
        };
        (status, Json(body)).into_response()
    }
}
