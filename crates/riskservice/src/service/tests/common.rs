use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::fhir::{
    AdministrativeGender, CodeableConcept, Coding, Condition, FhirDateTime, MedicationStatement,
    Patient, Resource, ResourceKind, ICD9_SYSTEM,
};
use crate::pie::{Pie, PieId};
use crate::plugins::{MethodKey, PluginRegistry};
use crate::scheduler::FunctionDelayer;
use crate::service::repository::{
    AssessmentBatch, AssessmentPublisher, ClinicalRecordSource, PieStore, PublishError,
    SourceError, StoreError, StoredPie,
};
use crate::service::{risk_router, RiskRouterState, RiskService};

pub(super) const BASIS_PIE_URL: &str = "http://localhost:9000/pies";
pub(super) const PATIENT_ID: &str = "1223";

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

pub(super) fn at(year: i32, month: u32, day: u32) -> FhirDateTime {
    Utc.with_ymd_and_hms(year, month, day, 15, 0, 0).unwrap().into()
}

pub(super) fn patient() -> Resource {
    Resource::Patient(Patient {
        id: PATIENT_ID.to_string(),
        gender: Some(AdministrativeGender::Female),
        birth_date: Some(FhirDateTime::parse("1940-07-01").expect("birth date")),
    })
}

pub(super) fn condition(id: &str, code: &str, onset: FhirDateTime) -> Resource {
    Resource::Condition(Condition {
        id: id.to_string(),
        code: Some(CodeableConcept::coded(Coding::new(ICD9_SYSTEM, code), id)),
        verification_status: Some("confirmed".to_string()),
        onset_date_time: Some(onset),
        ..Condition::default()
    })
}

pub(super) fn medication(id: &str, code: &str, effective: FhirDateTime) -> Resource {
    Resource::MedicationStatement(MedicationStatement {
        id: id.to_string(),
        status: Some("active".to_string()),
        medication_codeable_concept: Some(CodeableConcept::coded(
            Coding::new("http://www.nlm.nih.gov/research/umls/rxnorm/", code),
            id,
        )),
        effective_date_time: Some(effective),
        ..MedicationStatement::default()
    })
}

/// Female patient with atrial fibrillation and every CHA2DS2-VASc factor.
pub(super) fn atrial_fibrillation_history() -> Vec<Resource> {
    vec![
        patient(),
        condition("afib", "427.31", at(1990, 2, 15)),
        condition("chf", "428.0", at(1993, 3, 15)),
        condition("htn", "401.0", at(1997, 4, 15)),
        condition("dm", "250.0", at(2000, 5, 15)),
        condition("stroke", "434.91", at(2004, 6, 15)),
        condition("vasc", "443.9", at(2007, 7, 15)),
        medication("warfarin", "855332", at(1990, 3, 1)),
    ]
}

#[derive(Default)]
pub(super) struct StaticSource {
    records: Mutex<Vec<Resource>>,
    requested: Mutex<Vec<Vec<ResourceKind>>>,
}

impl StaticSource {
    pub(super) fn with_records(records: Vec<Resource>) -> Self {
        Self {
            records: Mutex::new(records),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn replace(&self, records: Vec<Resource>) {
        *self.records.lock().expect("source mutex poisoned") = records;
    }

    pub(super) fn requested(&self) -> Vec<Vec<ResourceKind>> {
        self.requested.lock().expect("source mutex poisoned").clone()
    }
}

impl ClinicalRecordSource for StaticSource {
    fn fetch(
        &self,
        _patient_id: &str,
        kinds: &[ResourceKind],
    ) -> Result<Vec<Resource>, SourceError> {
        self.requested
            .lock()
            .expect("source mutex poisoned")
            .push(kinds.to_vec());
        Ok(self.records.lock().expect("source mutex poisoned").clone())
    }
}

pub(super) struct UnavailableSource;

impl ClinicalRecordSource for UnavailableSource {
    fn fetch(
        &self,
        _patient_id: &str,
        _kinds: &[ResourceKind],
    ) -> Result<Vec<Resource>, SourceError> {
        Err(SourceError::Transport("connection refused".to_string()))
    }
}

#[derive(Default)]
pub(super) struct MemoryPieStore {
    pub(super) pies: Mutex<HashMap<PieId, StoredPie>>,
}

impl MemoryPieStore {
    pub(super) fn scope(&self, method_code: &str) -> Vec<StoredPie> {
        let mut pies: Vec<StoredPie> = self
            .pies
            .lock()
            .expect("pie mutex poisoned")
            .values()
            .filter(|stored| stored.method.code == method_code)
            .cloned()
            .collect();
        pies.sort_by_key(|stored| stored.pie.total_values());
        pies
    }

    pub(super) fn len(&self) -> usize {
        self.pies.lock().expect("pie mutex poisoned").len()
    }
}

impl PieStore for MemoryPieStore {
    fn insert(&self, pie: StoredPie) -> Result<(), StoreError> {
        let mut guard = self.pies.lock().expect("pie mutex poisoned");
        if guard.contains_key(&pie.pie.id) {
            return Err(StoreError::Conflict(pie.pie.id));
        }
        guard.insert(pie.pie.id, pie);
        Ok(())
    }

    fn remove(&self, id: &PieId) -> Result<(), StoreError> {
        self.pies.lock().expect("pie mutex poisoned").remove(id);
        Ok(())
    }

    fn remove_scope_except(
        &self,
        patient_id: &str,
        method: &MethodKey,
        keep: &[PieId],
    ) -> Result<usize, StoreError> {
        let mut guard = self.pies.lock().expect("pie mutex poisoned");
        let before = guard.len();
        guard.retain(|id, stored| !stored.in_scope(patient_id, method) || keep.contains(id));
        Ok(before - guard.len())
    }

    fn fetch(&self, id: &PieId) -> Result<Option<Pie>, StoreError> {
        let guard = self.pies.lock().expect("pie mutex poisoned");
        Ok(guard.get(id).map(|stored| stored.pie.clone()))
    }
}

#[derive(Default)]
pub(super) struct MemoryPublisher {
    batches: Mutex<Vec<AssessmentBatch>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub(super) fn batches(&self) -> Vec<AssessmentBatch> {
        self.batches.lock().expect("publisher mutex poisoned").clone()
    }

    pub(super) fn fail_next(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl AssessmentPublisher for MemoryPublisher {
    fn publish(&self, batch: &AssessmentBatch) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected { status: 500 });
        }
        self.batches
            .lock()
            .expect("publisher mutex poisoned")
            .push(batch.clone());
        Ok(())
    }
}

pub(super) type TestService = RiskService<StaticSource, MemoryPieStore, MemoryPublisher>;

pub(super) fn build_service(
    records: Vec<Resource>,
) -> (
    TestService,
    Arc<StaticSource>,
    Arc<MemoryPieStore>,
    Arc<MemoryPublisher>,
) {
    let source = Arc::new(StaticSource::with_records(records));
    let pies = Arc::new(MemoryPieStore::default());
    let publisher = Arc::new(MemoryPublisher::default());
    let service = RiskService::new(
        source.clone(),
        pies.clone(),
        publisher.clone(),
        PluginRegistry::standard().expect("standard registry"),
        BASIS_PIE_URL,
    );
    (service, source, pies, publisher)
}

pub(super) fn router_with_service<S, P, A>(
    service: RiskService<S, P, A>,
    debounce: Duration,
) -> (axum::Router, FunctionDelayer)
where
    S: ClinicalRecordSource + 'static,
    P: PieStore + 'static,
    A: AssessmentPublisher + 'static,
{
    let delayer = FunctionDelayer::new(debounce);
    let router = risk_router(RiskRouterState {
        service: Arc::new(service),
        delayer: delayer.clone(),
        upstream: "http://localhost:3001".to_string(),
    });
    (router, delayer)
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
