mod llm_supplier;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use practice_engine::{
    CandidateSupplier, EngineConfig, EngineError, EngineResult, NoSupplier, PracticeEngine,
};
use practice_utils::api::{
    CloseOutcome, CloseSessionRequest, CreateChallengeRequest, CreatePracticeStopRequest,
    CreateSimulationRequest, CreatedSession, DiagnosticReport, LivesByArea, SyncReport,
    SyncRequest, UnlockedLevels,
};
use practice_utils::{Actor, Role};
use serde::{Deserialize, Serialize};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::llm_supplier::LlmSupplier;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,  // subject (user id)
    exp: usize, // expiry
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    institution: Option<String>,
}

struct AppState {
    engine: Arc<PracticeEngine>,
    jwt_secret: String,
}

type SharedState = Arc<AppState>;

fn verify_jwt(secret: &str, token: &str) -> Result<Claims, StatusCode> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&["authenticated"]);

    let decoding_key = DecodingKey::from_secret(secret.as_ref());

    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(token_data) => Ok(token_data.claims),
        Err(_) => Err(StatusCode::UNAUTHORIZED),
    }
}

impl AppState {
    fn authenticate(&self, token: &str) -> Result<Actor, StatusCode> {
        let claims = verify_jwt(&self.jwt_secret, token)?;
        let role = match claims.role.as_deref() {
            Some(role) => role.parse::<Role>().map_err(|e| {
                log::warn!("Rejecting token for {}: {e}", claims.sub);
                StatusCode::FORBIDDEN
            })?,
            None => Role::default(),
        };
        Ok(Actor {
            user_id: claims.sub,
            role,
            institution: claims.institution,
        })
    }
}

fn status_for(error: EngineError) -> StatusCode {
    let status = match &error {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::SessionClosed(_) => StatusCode::CONFLICT,
        EngineError::WriteConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Storage(_) if error.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::ContentExhausted { .. }
        | EngineError::Storage(_)
        | EngineError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        log::error!("Request failed ({status}): {error:?}");
    } else {
        log::debug!("Request rejected ({status}): {error}");
    }
    status
}

/// Run a synchronous engine call off the async runtime.
async fn blocking<T, F>(state: &SharedState, call: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce(&PracticeEngine) -> EngineResult<T> + Send + 'static,
{
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || call(&engine))
        .await
        .map_err(|e| {
            log::error!("Engine task panicked: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(status_for)
}

async fn create_practice_stop(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<CreatePracticeStopRequest>,
) -> Result<Json<CreatedSession>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let created = state
        .engine
        .create_practice_stop(&actor, request.area, &request.subtopic, request.level)
        .await
        .map_err(status_for)?;
    Ok(Json(created))
}

async fn close_practice_stop(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CloseSessionRequest>,
) -> Result<Json<CloseOutcome>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let outcome = blocking(&state, move |engine| {
        engine.close_practice_stop(&actor, session_id, &request.answers)
    })
    .await?;
    Ok(Json(outcome))
}

async fn create_simulation(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<CreateSimulationRequest>,
) -> Result<Json<CreatedSession>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let created = state
        .engine
        .create_simulation(&actor, request.area, &request.subtopics)
        .await
        .map_err(status_for)?;
    Ok(Json(created))
}

async fn close_simulation(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CloseSessionRequest>,
) -> Result<Json<CloseOutcome>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let outcome = blocking(&state, move |engine| {
        engine.close_simulation(&actor, session_id, &request.answers)
    })
    .await?;
    Ok(Json(outcome))
}

async fn create_diagnostic(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<CreatedSession>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let created = state
        .engine
        .create_diagnostic(&actor)
        .await
        .map_err(status_for)?;
    Ok(Json(created))
}

async fn close_diagnostic(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CloseSessionRequest>,
) -> Result<Json<DiagnosticReport>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let report = blocking(&state, move |engine| {
        engine.close_diagnostic(&actor, session_id, &request.answers)
    })
    .await?;
    Ok(Json(report))
}

async fn create_challenge(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<CreateChallengeRequest>,
) -> Result<Json<CreatedSession>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let created = state
        .engine
        .create_challenge(&actor, request.area)
        .await
        .map_err(status_for)?;
    Ok(Json(created))
}

async fn close_challenge(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CloseSessionRequest>,
) -> Result<Json<CloseOutcome>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let outcome = blocking(&state, move |engine| {
        engine.close_challenge(&actor, session_id, &request.answers)
    })
    .await?;
    Ok(Json(outcome))
}

async fn get_unlocked_levels(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<UnlockedLevels>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let levels = blocking(&state, move |engine| engine.get_unlocked_levels(&actor)).await?;
    Ok(Json(levels))
}

async fn get_lives(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<LivesByArea>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let lives = blocking(&state, move |engine| engine.get_lives(&actor)).await?;
    Ok(Json(lives))
}

async fn report_sync(
    State(state): State<SharedState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncReport>, StatusCode> {
    let actor = state.authenticate(auth.token())?;
    let report = blocking(&state, move |engine| engine.report_sync(&actor, &request)).await?;
    Ok(Json(report))
}

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(|| async { "Practice backend is up" }))
        .route("/practice-stops", post(create_practice_stop))
        .route("/practice-stops/{id}/close", post(close_practice_stop))
        .route("/simulations", post(create_simulation))
        .route("/simulations/{id}/close", post(close_simulation))
        .route("/diagnostics", post(create_diagnostic))
        .route("/diagnostics/{id}/close", post(close_diagnostic))
        .route("/challenges", post(create_challenge))
        .route("/challenges/{id}/close", post(close_challenge))
        .route("/levels", get(get_unlocked_levels))
        .route("/lives", get(get_lives))
        .route("/sync", post(report_sync))
        .with_state(state)
}

fn supplier_from_env() -> anyhow::Result<Arc<dyn CandidateSupplier>> {
    match std::env::var("PRACTICE_SUPPLIER_MODEL") {
        Ok(model) => {
            let url = std::env::var("PRACTICE_SUPPLIER_URL").ok();
            log::info!("Generating questions with {model}");
            Ok(Arc::new(LlmSupplier::from_env(&model, url)?))
        }
        Err(_) => {
            log::info!("PRACTICE_SUPPLIER_MODEL not set; serving questions from the bank only");
            Ok(Arc::new(NoSupplier))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let jwt_secret =
        std::env::var("SUPABASE_JWT_SECRET").context("SUPABASE_JWT_SECRET must be set")?;
    let database_path =
        std::env::var("PRACTICE_DATABASE_PATH").unwrap_or_else(|_| "practice.db".to_string());
    let bind_addr =
        std::env::var("PRACTICE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let config = EngineConfig::from_env()?;
    let engine = PracticeEngine::open(&database_path, supplier_from_env()?, config)
        .with_context(|| format!("failed to open {database_path}"))?;

    let state = Arc::new(AppState {
        engine: Arc::new(engine),
        jwt_secret,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let app = router(state)
        .layer(CompressionLayer::new())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    log::info!("Listening on {bind_addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
