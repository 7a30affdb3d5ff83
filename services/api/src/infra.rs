use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use riskservice::error::AppError;
use riskservice::fhir::{Bundle, Resource, ResourceKind, RiskAssessment};
use riskservice::pie::{Pie, PieId};
use riskservice::plugins::MethodKey;
use riskservice::service::{
    AssessmentBatch, AssessmentPublisher, ClinicalRecordSource, PieStore, PublishError,
    SourceError, StoreError, StoredPie,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

const FHIR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryPieStore {
    pies: Arc<Mutex<HashMap<PieId, StoredPie>>>,
}

impl InMemoryPieStore {
    pub(crate) fn len(&self) -> usize {
        self.pies.lock().expect("pie store mutex poisoned").len()
    }
}

impl PieStore for InMemoryPieStore {
    fn insert(&self, pie: StoredPie) -> Result<(), StoreError> {
        let mut guard = self.pies.lock().expect("pie store mutex poisoned");
        if guard.contains_key(&pie.pie.id) {
            return Err(StoreError::Conflict(pie.pie.id));
        }
        guard.insert(pie.pie.id, pie);
        Ok(())
    }

    fn remove(&self, id: &PieId) -> Result<(), StoreError> {
        self.pies.lock().expect("pie store mutex poisoned").remove(id);
        Ok(())
    }

    fn remove_scope_except(
        &self,
        patient_id: &str,
        method: &MethodKey,
        keep: &[PieId],
    ) -> Result<usize, StoreError> {
        let mut guard = self.pies.lock().expect("pie store mutex poisoned");
        let before = guard.len();
        guard.retain(|id, stored| !stored.in_scope(patient_id, method) || keep.contains(id));
        Ok(before - guard.len())
    }

    fn fetch(&self, id: &PieId) -> Result<Option<Pie>, StoreError> {
        let guard = self.pies.lock().expect("pie store mutex poisoned");
        Ok(guard.get(id).map(|stored| stored.pie.clone()))
    }
}

/// Publisher that applies each batch to a local map the way a FHIR server applies the
/// transaction: the conditional delete clears the scope, then every assessment is created.
#[derive(Default, Clone)]
pub(crate) struct InMemoryAssessmentPublisher {
    assessments: Arc<Mutex<HashMap<(String, MethodKey), Vec<RiskAssessment>>>>,
}

impl InMemoryAssessmentPublisher {
    pub(crate) fn assessments(&self, patient_id: &str, method: &MethodKey) -> Vec<RiskAssessment> {
        let guard = self.assessments.lock().expect("assessment mutex poisoned");
        guard
            .get(&(patient_id.to_string(), method.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

impl AssessmentPublisher for InMemoryAssessmentPublisher {
    fn publish(&self, batch: &AssessmentBatch) -> Result<(), PublishError> {
        let scope = (batch.patient_id.clone(), MethodKey::from(&batch.method));
        let mut guard = self.assessments.lock().expect("assessment mutex poisoned");
        guard.remove(&scope);
        if !batch.assessments.is_empty() {
            guard.insert(scope, batch.assessments.clone());
        }
        Ok(())
    }
}

/// Async reqwest client driven from the blocking pool through a runtime handle.
#[derive(Clone)]
pub(crate) struct FhirHttpClient {
    client: reqwest::Client,
    handle: Handle,
    endpoint: String,
}

impl FhirHttpClient {
    pub(crate) fn new(endpoint: &str, handle: Handle) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(FHIR_TIMEOUT)
            .build()
            .map_err(|err| AppError::Io(std::io::Error::other(err)))?;

        Ok(Self {
            client,
            handle,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

/// Reads a patient and the records referencing it with one `_revinclude` search.
pub(crate) struct FhirHttpSource {
    http: FhirHttpClient,
}

impl FhirHttpSource {
    pub(crate) fn new(http: FhirHttpClient) -> Self {
        Self { http }
    }
}

pub(crate) fn patient_search_query(
    patient_id: &str,
    kinds: &[ResourceKind],
) -> Vec<(String, String)> {
    let mut query = vec![("_id".to_string(), patient_id.to_string())];
    query.extend(
        kinds
            .iter()
            .filter(|kind| **kind != ResourceKind::Patient)
            .map(|kind| ("_revinclude".to_string(), format!("{kind}:patient"))),
    );
    query
}

impl ClinicalRecordSource for FhirHttpSource {
    fn fetch(
        &self,
        patient_id: &str,
        kinds: &[ResourceKind],
    ) -> Result<Vec<Resource>, SourceError> {
        let url = format!("{}/Patient", self.http.endpoint);
        let query = patient_search_query(patient_id, kinds);
        debug!(%url, patient_id, "fetching clinical records");

        let bundle = self.http.handle.block_on(async {
            let response = self
                .http
                .client
                .get(&url)
                .query(&query)
                .send()
                .await
                .map_err(|err| SourceError::Transport(err.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::Transport(format!(
                    "search returned status {status}"
                )));
            }

            response
                .json::<Bundle>()
                .await
                .map_err(|err| SourceError::Decode(err.to_string()))
        })?;

        let records = bundle.into_resources();
        if !records
            .iter()
            .any(|record| matches!(record, Resource::Patient(patient) if patient.id == patient_id))
        {
            return Err(SourceError::PatientNotFound(patient_id.to_string()));
        }
        Ok(records)
    }
}

/// Posts each batch as one FHIR transaction bundle to the server base URL.
pub(crate) struct FhirHttpPublisher {
    http: FhirHttpClient,
}

impl FhirHttpPublisher {
    pub(crate) fn new(http: FhirHttpClient) -> Self {
        Self { http }
    }
}

impl AssessmentPublisher for FhirHttpPublisher {
    fn publish(&self, batch: &AssessmentBatch) -> Result<(), PublishError> {
        let bundle = batch.to_transaction_bundle();
        debug!(
            patient_id = %batch.patient_id,
            entries = bundle.entry.len(),
            "posting risk assessment transaction"
        );

        self.http.handle.block_on(async {
            let response = self
                .http
                .client
                .post(&self.http.endpoint)
                .json(&bundle)
                .send()
                .await
                .map_err(|err| PublishError::Transport(err.to_string()))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(PublishError::Rejected {
                    status: status.as_u16(),
                })
            }
        })
    }
}

/// Serves the records of one bundle file, restricted to the requested kinds.
pub(crate) struct BundleFileSource {
    records: Vec<Resource>,
}

impl BundleFileSource {
    pub(crate) fn from_path(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub(crate) fn from_json(raw: &str) -> Result<Self, AppError> {
        let bundle: Bundle = serde_json::from_str(raw)?;
        Ok(Self {
            records: bundle.into_resources(),
        })
    }

    pub(crate) fn patient_id(&self) -> Option<&str> {
        self.records.iter().find_map(|record| match record {
            Resource::Patient(patient) => Some(patient.id.as_str()),
            _ => None,
        })
    }
}

impl ClinicalRecordSource for BundleFileSource {
    fn fetch(
        &self,
        patient_id: &str,
        kinds: &[ResourceKind],
    ) -> Result<Vec<Resource>, SourceError> {
        if self.patient_id() != Some(patient_id) {
            return Err(SourceError::PatientNotFound(patient_id.to_string()));
        }

        Ok(self
            .records
            .iter()
            .filter(|record| match record {
                Resource::Patient(_) => true,
                other => ResourceKind::from_name(other.kind_name())
                    .is_some_and(|kind| kinds.contains(&kind)),
            })
            .cloned()
            .collect())
    }
}

pub(crate) fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|err| format!("failed to parse '{raw}' as an RFC 3339 timestamp ({err})"))
}
