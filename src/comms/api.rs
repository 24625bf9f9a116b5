use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, FromRequestParts, Multipart, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::inference::{Category, ClassLabel, InferenceEngine, PredictionResult, ProbabilityDistribution};
use crate::security::audit_log::AuditLogger;
use crate::security::{AccessGuard, AuthError, CallerIdentity, FirebaseVerifier};

type SharedState = Arc<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub guard: AccessGuard,
    pub engine: InferenceEngine,
    pub audit: AuditLogger,
}

impl AppState {
    pub fn new(config: Arc<Config>, guard: AccessGuard, engine: InferenceEngine) -> Self {
        Self {
            config,
            guard,
            engine,
            audit: AuditLogger::new(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

#[derive(Serialize)]
pub struct PredictionResponse {
    pub prediction: ClassLabel,
    #[serde(rename = "type")]
    pub category: Category,
    pub probabilities: ProbabilityDistribution,
}

impl From<PredictionResult> for PredictionResponse {
    fn from(result: PredictionResult) -> Self {
        Self {
            prediction: result.label,
            category: result.category,
            probabilities: result.distribution,
        }
    }
}

/// Error leaving the API as `{"detail": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredential => ApiError::unauthorized("Not authenticated"),
            other => ApiError::unauthorized(format!("Invalid token: {other}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { detail: self.detail })).into_response()
    }
}

/// Authenticated caller plus the id used to correlate its log events.
#[derive(Debug, Clone)]
pub struct Caller {
    pub identity: CallerIdentity,
    pub request_id: String,
}

impl FromRequestParts<SharedState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let authorization = match parts.headers.get(AUTHORIZATION) {
            Some(value) => Some(value.to_str().map_err(|_| {
                ApiError::from(AuthError::Malformed("authorization header is not valid text".to_string()))
            })?),
            None => None,
        };

        let identity = state.guard.authorize(authorization, &request_id).await?;
        Ok(Caller { identity, request_id })
    }
}

async fn root() -> impl IntoResponse {
    Json(json!({"message": "Welcome to FindOutMole API"}))
}

// Plain preflight answer for clients that send OPTIONS without CORS headers.
async fn predict_options() -> impl IntoResponse {
    StatusCode::OK
}

async fn read_upload(multipart: &mut Multipart) -> Result<Bytes, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), format!("Invalid multipart body: {}", e.body_text())))?
    {
        if field.name() != Some("file") {
            continue;
        }
        debug!(
            content_type = field.content_type().unwrap_or(""),
            file_name = field.file_name().unwrap_or(""),
            "Received upload"
        );
        return field
            .bytes()
            .await
            .map_err(|e| ApiError::new(e.status(), format!("Invalid multipart body: {}", e.body_text())));
    }
    Err(ApiError::unprocessable("Missing upload field 'file'"))
}

async fn predict(
    State(state): State<SharedState>,
    caller: Caller,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::unprocessable(e.body_text()))?;
    let bytes = read_upload(&mut multipart).await?;

    let engine = state.engine.clone();
    let outcome = tokio::task::spawn_blocking(move || engine.classify(&bytes))
        .await
        .map_err(|e| {
            error!(request_id = %caller.request_id, "classification task failed: {}", e);
            ApiError::internal(format!("Error processing image: {e}"))
        })?;

    match outcome {
        Ok(result) => {
            state.audit.prediction_served(
                &caller.identity.uid,
                &caller.request_id,
                result.label.as_str(),
                result.category.as_str(),
            );
            Ok(Json(PredictionResponse::from(result)))
        }
        Err(e) => {
            state
                .audit
                .inference_failed(&caller.identity.uid, &caller.request_id, e.stage(), &e.to_string());
            Err(ApiError::internal(format!("Error processing image: {e}")))
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

/// Build the API. An empty origin list leaves CORS handling off, in which
/// case `OPTIONS /predict` is answered by its own route.
pub fn create_router(state: SharedState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    let mut router = Router::new()
        .route("/", get(root))
        .route("/predict", post(predict).options(predict_options))
        .layer(DefaultBodyLimit::max(body_limit));

    if !state.config.allowed_origins.is_empty() {
        router = router.layer(cors_layer(&state.config.allowed_origins));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Load the model and identity provider, then serve until the process ends.
pub async fn serve(config: Config, addr: SocketAddr) -> Result<()> {
    let config = Arc::new(config);

    let engine = InferenceEngine::from_weights(&config.model_path)
        .with_context(|| format!("loading model from '{}'", config.model_path.display()))?;
    let verifier = FirebaseVerifier::from_config(&config).context("initialising identity provider")?;
    let guard = AccessGuard::new(Arc::new(verifier));

    let state = Arc::new(AppState::new(config, guard, engine));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}
