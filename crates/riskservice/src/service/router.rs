use std::sync::Arc;

use axum::{
    extract::{FromRequest, Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::repository::{AssessmentPublisher, ClinicalRecordSource, PieStore};
use super::{RiskService, RiskServiceError};
use crate::fhir::FhirDateTime;
use crate::pie::PieId;
use crate::scheduler::{CoalesceRequest, DelayOutcome, FunctionDelayer};

/// Shared handler state: the service, the debouncer in front of it, and the default upstream
/// used when a trigger does not name one.
pub struct RiskRouterState<S, P, A> {
    pub service: Arc<RiskService<S, P, A>>,
    pub delayer: FunctionDelayer,
    pub upstream: String,
}

impl<S, P, A> Clone for RiskRouterState<S, P, A> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            delayer: self.delayer.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

/// Recalculation trigger body, posted as JSON or as form fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculateRequest {
    pub patient_id: String,
    #[serde(default)]
    pub fhir_endpoint_url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<FhirDateTime>,
}

/// Router exposing stored pies and the debounced recalculation trigger.
pub fn risk_router<S, P, A>(state: RiskRouterState<S, P, A>) -> Router
where
    S: ClinicalRecordSource + 'static,
    P: PieStore + 'static,
    A: AssessmentPublisher + 'static,
{
    Router::new()
        .route("/pies/:id", get(pie_handler::<S, P, A>))
        .route("/calculate", post(calculate_handler::<S, P, A>))
        .with_state(state)
}

pub(crate) async fn pie_handler<S, P, A>(
    State(state): State<RiskRouterState<S, P, A>>,
    Path(id): Path<String>,
) -> Response
where
    S: ClinicalRecordSource + 'static,
    P: PieStore + 'static,
    A: AssessmentPublisher + 'static,
{
    let Ok(id) = id.parse::<PieId>() else {
        let payload = json!({
            "error": format!("'{id}' is not a valid pie id"),
        });
        return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
    };

    match state.service.pie(&id) {
        Ok(pie) => (StatusCode::OK, Json(pie)).into_response(),
        Err(err @ RiskServiceError::PieNotFound(_)) => {
            let payload = json!({
                "error": err.to_string(),
            });
            (StatusCode::NOT_FOUND, Json(payload)).into_response()
        }
        Err(other) => {
            let payload = json!({
                "error": other.to_string(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
        }
    }
}

pub(crate) async fn calculate_handler<S, P, A>(
    State(state): State<RiskRouterState<S, P, A>>,
    request: Request,
) -> Response
where
    S: ClinicalRecordSource + 'static,
    P: PieStore + 'static,
    A: AssessmentPublisher + 'static,
{
    let request = match decode_trigger(request).await {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    let patient_id = request.patient_id.trim();
    if patient_id.is_empty() {
        let payload = json!({
            "error": "patientId is required",
        });
        return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
    }

    let source = request
        .fhir_endpoint_url
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| state.upstream.clone());
    let trigger = CoalesceRequest::new(
        patient_id,
        source,
        request.timestamp.map(FhirDateTime::instant),
    );
    let key = trigger.key();

    let outcome = state
        .delayer
        .delay(key.clone(), recalculate(Arc::clone(&state.service), trigger));

    match outcome {
        DelayOutcome::Scheduled | DelayOutcome::Extended => {
            let payload = json!({
                "key": key,
                "status": outcome.as_str(),
            });
            (StatusCode::ACCEPTED, Json(payload)).into_response()
        }
        DelayOutcome::Rejected => {
            warn!(%key, "recalculation rejected during shutdown");
            let payload = json!({
                "error": "service is shutting down",
            });
            (StatusCode::SERVICE_UNAVAILABLE, Json(payload)).into_response()
        }
    }
}

async fn decode_trigger(request: Request) -> Result<CalculateRequest, Response> {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        Form::<CalculateRequest>::from_request(request, &())
            .await
            .map(|Form(body)| body)
            .map_err(IntoResponse::into_response)
    } else {
        Json::<CalculateRequest>::from_request(request, &())
            .await
            .map(|Json(body)| body)
            .map_err(IntoResponse::into_response)
    }
}

/// Debounced work item: run the synchronous pipeline on the blocking pool and log the result.
pub(crate) async fn recalculate<S, P, A>(
    service: Arc<RiskService<S, P, A>>,
    trigger: CoalesceRequest,
) where
    S: ClinicalRecordSource + 'static,
    P: PieStore + 'static,
    A: AssessmentPublisher + 'static,
{
    let patient_id = trigger.patient_id.clone();
    let joined = tokio::task::spawn_blocking(move || service.calculate(&patient_id)).await;

    match joined {
        Ok(Ok(summary)) => info!(
            patient_id = %trigger.patient_id,
            source = %trigger.source,
            as_of = %trigger.as_of,
            plugins = summary.outcomes.len(),
            "recalculation complete"
        ),
        Ok(Err(err)) => error!(
            patient_id = %trigger.patient_id,
            source = %trigger.source,
            error = %err,
            "recalculation failed"
        ),
        Err(join_error) => error!(
            patient_id = %trigger.patient_id,
            error = %join_error,
            "recalculation task aborted"
        ),
    }
}
