use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, Request, State,
    },
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use funnel_core::clock::Clock;
use funnel_core::config::{AppConfig, ExperimentsConfig};
use funnel_core::conversions::{
    ConversionRate, ConversionRateCalculator, ConversionTracker, TrackConversion,
    TrackedConversion, TrendGranularity, TrendPoint,
};
use funnel_core::domain::clinic::{ClinicSlug, Tier};
use funnel_core::domain::experiment::{
    NewVariantTest, PrimaryMetric, Variant, VariantId, VariantResult, VariantTest, VariantTestId,
};
use funnel_core::domain::forecast::{ForecastId, ForecastMode, ForecastOutcome, UpgradeForecast};
use funnel_core::errors::{ApplicationError, DomainError, InterfaceError};
use funnel_core::experiments::{
    ExperimentManager, RandomSource, TestAction, VariantAssigner, VariantAssignment,
};
use funnel_core::forecast::{ForecastSources, UpgradeForecastEngine};
use funnel_core::store::{
    AssignmentStore, ClinicDirectory, ContactStore, ConversionCounterStore, ConversionEventStore,
    ForecastStore, SessionStore, VariantTestStore,
};

pub const CORRELATION_HEADER: &str = "x-correlation-id";
const DEFAULT_RATE_WINDOW_DAYS: i64 = 30;
const DEFAULT_DAILY_PERIODS: u32 = 30;
const DEFAULT_WEEKLY_PERIODS: u32 = 12;
const MAX_TREND_PERIODS: u32 = 366;

/// Store handles the engines are wired from.
pub struct Ports {
    pub clinics: Arc<dyn ClinicDirectory>,
    pub contacts: Arc<dyn ContactStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub tests: Arc<dyn VariantTestStore>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub events: Arc<dyn ConversionEventStore>,
    pub counters: Arc<dyn ConversionCounterStore>,
    pub forecasts: Arc<dyn ForecastStore>,
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ExperimentManager>,
    pub assigner: Arc<VariantAssigner>,
    pub tracker: Arc<ConversionTracker>,
    pub rates: Arc<ConversionRateCalculator>,
    pub forecasts: Arc<UpgradeForecastEngine>,
    pub experiment_defaults: ExperimentsConfig,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        ports: Ports,
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let manager = ExperimentManager::new(ports.tests.clone(), clock.clone());
        let assigner =
            VariantAssigner::new(ports.tests.clone(), ports.assignments.clone(), random);
        let tracker = ConversionTracker::new(
            ports.events.clone(),
            ports.counters,
            ports.tests,
            ports.assignments,
            ports.sessions.clone(),
            config.conversion_values.clone(),
            clock.clone(),
        );
        let rates = ConversionRateCalculator::new(
            ports.clinics.clone(),
            ports.events.clone(),
            clock.clone(),
        );
        let forecasts = UpgradeForecastEngine::new(
            ForecastSources {
                clinics: ports.clinics,
                contacts: ports.contacts,
                sessions: ports.sessions,
                events: ports.events,
                forecasts: ports.forecasts,
            },
            clock.clone(),
        )
        .with_settings(config.forecast.settings());

        Self {
            manager: Arc::new(manager),
            assigner: Arc::new(assigner),
            tracker: Arc::new(tracker),
            rates: Arc::new(rates),
            forecasts: Arc::new(forecasts),
            experiment_defaults: config.experiments.clone(),
            clock,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/experiments", post(create_experiment))
        .route("/api/v1/experiments/{id}/transition", post(transition_experiment))
        .route("/api/v1/experiments/{id}/results", get(experiment_results))
        .route("/api/v1/experiments/{id}/exposures", post(record_exposure))
        .route("/api/v1/assignments", post(assign_variant))
        .route("/api/v1/conversions", post(track_conversion))
        .route("/api/v1/clinics/{slug}/conversion-rate", get(conversion_rate))
        .route("/api/v1/clinics/{slug}/conversion-trend", get(conversion_trend))
        .route("/api/v1/clinics/{slug}/forecast", post(forecast))
        .route("/api/v1/clinics/{slug}/forecasts/{id}/outcome", post(record_outcome))
        .with_state(state)
        .layer(middleware::from_fn(correlate))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub String);

/// Reuses the caller's correlation id when present and echoes it on the response.
pub async fn correlate(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    request.extensions_mut().insert(CorrelationId(correlation_id.clone()));
    let mut response = next.run(request).await;

    debug!(
        event_name = "api.request.completed",
        correlation_id = %correlation_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "request completed"
    );
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn new(error: ApplicationError, correlation: &CorrelationId) -> Self {
        Self(error.into_interface(correlation.0.clone()))
    }

    fn bad_request(message: impl Into<String>, correlation: &CorrelationId) -> Self {
        Self::new(DomainError::validation(message).into(), correlation)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    correlation_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let (status, detail) = match &error {
            InterfaceError::BadRequest { message, .. } => {
                (StatusCode::BAD_REQUEST, Some(message.clone()))
            }
            InterfaceError::NotFound { message, .. } => {
                (StatusCode::NOT_FOUND, Some(message.clone()))
            }
            InterfaceError::ServiceUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %error.correlation_id(),
                error = %error,
                "request failed"
            );
        } else {
            warn!(
                event_name = "api.request.rejected",
                correlation_id = %error.correlation_id(),
                error = %error,
                "request rejected"
            );
        }

        let body = ErrorBody {
            error: error.user_message(),
            detail,
            correlation_id: error.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Unwraps a JSON body, answering malformed payloads with the JSON error body.
fn json_body<T>(
    payload: Result<Json<T>, JsonRejection>,
    correlation: &CorrelationId,
) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text(), correlation))
}

fn query_params<T>(
    query: Result<Query<T>, QueryRejection>,
    correlation: &CorrelationId,
) -> ApiResult<T> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text(), correlation))
}

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub clinic_slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub traffic_allocation: Option<u8>,
    #[serde(default)]
    pub target_sample_size: Option<u32>,
    #[serde(default)]
    pub confidence_level: Option<f64>,
    #[serde(default)]
    pub primary_metric: Option<PrimaryMetric>,
}

impl CreateExperimentRequest {
    fn into_new_test(self, defaults: &ExperimentsConfig) -> NewVariantTest {
        NewVariantTest {
            clinic_slug: ClinicSlug(self.clinic_slug),
            name: self.name,
            description: self.description,
            variants: self.variants,
            traffic_allocation: self
                .traffic_allocation
                .unwrap_or(defaults.default_traffic_allocation),
            target_sample_size: self
                .target_sample_size
                .unwrap_or(defaults.default_target_sample_size),
            confidence_level: self.confidence_level.unwrap_or(defaults.default_confidence_level),
            primary_metric: self.primary_metric.unwrap_or_default(),
        }
    }
}

async fn create_experiment(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    request: Result<Json<CreateExperimentRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<VariantTest>)> {
    let request = json_body(request, &correlation)?;
    let input = request.into_new_test(&state.experiment_defaults);
    let test =
        state.manager.create_test(input).await.map_err(|error| ApiError::new(error, &correlation))?;
    Ok((StatusCode::CREATED, Json(test)))
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub action: String,
}

async fn transition_experiment(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
    request: Result<Json<TransitionRequest>, JsonRejection>,
) -> ApiResult<Json<VariantTest>> {
    let request = json_body(request, &correlation)?;
    let action = request
        .action
        .parse::<TestAction>()
        .map_err(|error| ApiError::new(error.into(), &correlation))?;
    let test = state
        .manager
        .transition(&VariantTestId(id), action)
        .await
        .map_err(|error| ApiError::new(error, &correlation))?;
    Ok(Json(test))
}

async fn experiment_results(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<VariantResult>>> {
    let results = state
        .manager
        .results(&VariantTestId(id))
        .await
        .map_err(|error| ApiError::new(error, &correlation))?;
    Ok(Json(results))
}

#[derive(Debug, Deserialize)]
pub struct ExposureRequest {
    pub variant_id: String,
}

async fn record_exposure(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
    request: Result<Json<ExposureRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let request = json_body(request, &correlation)?;
    state
        .assigner
        .record_exposure(&VariantTestId(id), &VariantId(request.variant_id))
        .await
        .map_err(|error| ApiError::new(error, &correlation))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub clinic_slug: String,
    pub visitor_id: String,
}

async fn assign_variant(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    request: Result<Json<AssignRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(request, &correlation)?;
    if request.clinic_slug.trim().is_empty() {
        return Err(ApiError::bad_request("clinic_slug is required", &correlation));
    }
    let assignment: Option<VariantAssignment> = state
        .assigner
        .assign(&request.visitor_id, &ClinicSlug(request.clinic_slug))
        .await
        .map_err(|error| ApiError::new(error, &correlation))?;

    Ok(match assignment {
        Some(assignment) => Json(assignment).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn track_conversion(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    request: Result<Json<TrackConversion>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TrackedConversion>)> {
    let request = json_body(request, &correlation)?;
    let tracked =
        state.tracker.track(request).await.map_err(|error| ApiError::new(error, &correlation))?;
    Ok((StatusCode::CREATED, Json(tracked)))
}

#[derive(Debug, Default, Deserialize)]
pub struct RateQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

async fn conversion_rate(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(slug): Path<String>,
    query: Result<Query<RateQuery>, QueryRejection>,
) -> ApiResult<Json<ConversionRate>> {
    let query = query_params(query, &correlation)?;
    let end = query.end.unwrap_or_else(|| state.clock.now());
    let start = query.start.unwrap_or(end - Duration::days(DEFAULT_RATE_WINDOW_DAYS));
    let rate = state
        .rates
        .calculate(&ClinicSlug(slug), start, end)
        .await
        .map_err(|error| ApiError::new(error, &correlation))?;
    Ok(Json(rate))
}

#[derive(Debug, Default, Deserialize)]
pub struct TrendQuery {
    pub granularity: Option<String>,
    pub periods: Option<u32>,
}

async fn conversion_trend(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(slug): Path<String>,
    query: Result<Query<TrendQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<TrendPoint>>> {
    let query = query_params(query, &correlation)?;
    let granularity = match query.granularity.as_deref() {
        Some(raw) => raw
            .parse::<TrendGranularity>()
            .map_err(|error| ApiError::new(error.into(), &correlation))?,
        None => TrendGranularity::Daily,
    };
    let periods = query.periods.unwrap_or(match granularity {
        TrendGranularity::Daily => DEFAULT_DAILY_PERIODS,
        TrendGranularity::Weekly => DEFAULT_WEEKLY_PERIODS,
    });
    if periods == 0 || periods > MAX_TREND_PERIODS {
        return Err(ApiError::bad_request(
            format!("periods must be in range 1..={MAX_TREND_PERIODS}"),
            &correlation,
        ));
    }

    let points = state
        .rates
        .trend_by(&ClinicSlug(slug), granularity, periods)
        .await
        .map_err(|error| ApiError::new(error, &correlation))?;
    Ok(Json(points))
}

#[derive(Debug, Default, Deserialize)]
pub struct ForecastQuery {
    pub mode: Option<ForecastMode>,
}

async fn forecast(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(slug): Path<String>,
    query: Result<Query<ForecastQuery>, QueryRejection>,
) -> ApiResult<Json<UpgradeForecast>> {
    let query = query_params(query, &correlation)?;
    let forecast = state
        .forecasts
        .current_or_generate(&ClinicSlug(slug), query.mode.unwrap_or_default())
        .await
        .map_err(|error| ApiError::new(error, &correlation))?;
    Ok(Json(forecast))
}

#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    pub converted: bool,
    #[serde(default)]
    pub observed_tier: Option<Tier>,
}

async fn record_outcome(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path((slug, id)): Path<(String, String)>,
    request: Result<Json<OutcomeRequest>, JsonRejection>,
) -> ApiResult<Json<ForecastOutcome>> {
    let request = json_body(request, &correlation)?;
    let outcome = state
        .forecasts
        .record_outcome(
            &ClinicSlug(slug),
            &ForecastId(id),
            request.converted,
            request.observed_tier,
        )
        .await
        .map_err(|error| ApiError::new(error, &correlation))?;
    Ok(Json(outcome))
}
