use std::env;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{serve, Json, Router};
use dotenv::dotenv;
use ethers::signers::LocalWallet;
use ethers::types::H256;
use eyre::WrapErr;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use rollup_da_defender::{
    ApiState, CelestiaClient, Config, DatumKind, Defender, DefenderOpts, Error, ErrorClass,
    EthereumL1, EthereumL2, JsonFileStore, Rollup, WalletSigner,
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!("Starting Rollup DA Defender");

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    // Signer for defense transactions
    let key = env::var("SIGNER_KEY").wrap_err("missing required environment variable SIGNER_KEY")?;
    let wallet: LocalWallet = key
        .trim_start_matches("0x")
        .parse()
        .wrap_err("invalid SIGNER_KEY")?;
    let signer = Arc::new(WalletSigner::new(wallet, config.l1.chain_id));

    // Chain and DA adapters
    let l1 = Arc::new(EthereumL1::new(&config.l1, signer)?);
    let l2 = Arc::new(EthereumL2::new(&config.l2.rpc_url)?);
    let da = Arc::new(CelestiaClient::new(&config.da)?);
    let store = Arc::new(JsonFileStore::new(&config.store.path));
    tracing::info!(
        namespace = %config.da.namespace,
        store = %config.store.path.display(),
        "Adapters ready"
    );

    let rollup = Arc::new(
        Rollup::open(
            l1.clone(),
            l2.clone(),
            da.clone(),
            store,
            config.rollup.clone(),
            config.retry.clone(),
        )
        .await?,
    );
    let defender = Arc::new(Defender::new(
        l1,
        l2,
        da,
        config.retry.clone(),
        DefenderOpts {
            dry_run: env::var("DEFENDER_DRY_RUN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        },
    ));

    // Spawn the L1 commitment poller
    let l1_rollup = rollup.clone();
    let l1_cancel = cancel_token.child_token();
    let l1_task = tokio::spawn(async move {
        if let Err(e) = l1_rollup.run_l1_loop(&l1_cancel).await {
            tracing::error!(loop_name = "l1", error = %e, "L1 poller stopped");
        }
    });

    // Spawn the L2 bundler
    let l2_rollup = rollup.clone();
    let l2_cancel = cancel_token.child_token();
    let l2_task = tokio::spawn(async move {
        if let Err(e) = l2_rollup.run_l2_loop(&l2_cancel).await {
            tracing::error!(loop_name = "l2", error = %e, "L2 bundler stopped");
        }
    });

    let api_state = ApiState {
        rollup,
        defender,
        cancel_token: cancel_token.clone(),
    };

    // CORS configuration for cross-origin requests from frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    // Build Axum routes
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(service_health))
        .route("/info", get(get_info))
        .route("/blocks/{hash}", get(get_block_by_hash))
        .route("/blocks/index/{index}", get(get_block_by_index))
        .route("/defend", post(defend))
        .layer(cors)
        .with_state(api_state);

    // Parse socket address
    let addr: std::net::SocketAddr = config
        .server
        .addr()
        .parse()
        .map_err(|e| eyre::eyre!("Invalid server address '{}': {}", config.server.addr(), e))?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "API server starting"
    );
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /                     - Root");
    tracing::info!("  GET  /health               - Service health check");
    tracing::info!("  GET  /info                 - Sync cursors");
    tracing::info!("  GET  /blocks/{{hash}}        - Committed header by hash");
    tracing::info!("  GET  /blocks/index/{{n}}     - Committed header by L1 index");
    tracing::info!("  POST /defend               - Defend a datum on L1");

    let listener = TcpListener::bind(addr).await?;

    // Setup graceful shutdown
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal, initiating graceful shutdown");
                shutdown_token.cancel();
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to listen for shutdown signal");
            }
        }
    });

    // Run server with graceful shutdown
    let server_token = cancel_token.clone();
    serve(listener, app)
        .with_graceful_shutdown(async move {
            server_token.cancelled().await;
            tracing::info!("Shutting down HTTP server");
        })
        .await?;

    // Let both loops reach a suspension point and persist
    cancel_token.cancel();
    let (l1_done, l2_done) = futures_util::future::join(l1_task, l2_task).await;
    for (name, done) in [("l1", l1_done), ("l2", l2_done)] {
        if let Err(e) = done {
            tracing::error!(loop_name = name, error = ?e, "Loop task panicked");
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

// ------------------------------------------
// Errors
// ------------------------------------------

enum ApiError {
    BadRequest(String),
    Engine(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Engine(e) => {
                let status = match e.class() {
                    ErrorClass::NotFound => StatusCode::NOT_FOUND,
                    ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorClass::Submission => StatusCode::BAD_GATEWAY,
                    ErrorClass::Fatal => StatusCode::UNPROCESSABLE_ENTITY,
                    ErrorClass::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn parse_hash(raw: &str) -> Result<H256, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid hash '{raw}'")))
}

// ------------------------------------------
// REST Endpoints
// ------------------------------------------

async fn root() -> &'static str {
    "Rollup DA Defender API - Keep rollup data available and defend it on L1"
}

async fn service_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "rollup-da-defender"
    }))
}

async fn get_info(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.rollup.get_info())
}

async fn get_block_by_hash(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let hash = parse_hash(&hash)?;
    Ok(Json(state.rollup.get_block_info(hash).await?))
}

async fn get_block_by_index(
    State(state): State<ApiState>,
    Path(index): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.rollup.get_block_info_by_index(index).await?))
}

#[derive(Debug, Deserialize)]
struct DefendRequest {
    bundle_hash: String,
    /// A 32 byte hash, or an L2 block number whose header is defended.
    datum: String,
    #[serde(default)]
    kind: DatumKind,
}

async fn defend(
    State(state): State<ApiState>,
    Json(request): Json<DefendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle_hash = parse_hash(&request.bundle_hash)?;
    let cancel_token = state.cancel_token.child_token();

    let (datum, kind) = if request.datum.starts_with("0x") {
        (parse_hash(&request.datum)?, request.kind)
    } else {
        let number: u64 = request
            .datum
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid datum '{}'", request.datum)))?;
        let datum = state
            .defender
            .resolve_block_datum(number, &cancel_token)
            .await?;
        (datum, DatumKind::Header)
    };

    let outcome = state
        .defender
        .defend(bundle_hash, datum, kind, &cancel_token)
        .await?;
    Ok(Json(outcome))
}
