use serde::{Deserialize, Serialize};

use crate::fhir::{
    risk_assessment_delete_url, Coding, Resource, ResourceKind, RiskAssessment, TransactionBundle,
};
use crate::pie::{Pie, PieId};
use crate::plugins::MethodKey;

/// Pie persisted together with the scope it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPie {
    pub pie: Pie,
    pub patient_id: String,
    pub method: MethodKey,
}

impl StoredPie {
    pub fn in_scope(&self, patient_id: &str, method: &MethodKey) -> bool {
        self.patient_id == patient_id && &self.method == method
    }
}

/// Pie storage so the service can be exercised against any backend.
pub trait PieStore: Send + Sync {
    fn insert(&self, pie: StoredPie) -> Result<(), StoreError>;
    fn remove(&self, id: &PieId) -> Result<(), StoreError>;
    /// Remove every pie of (`patient_id`, `method`) whose id is not in `keep`, returning the
    /// number removed.
    fn remove_scope_except(
        &self,
        patient_id: &str,
        method: &MethodKey,
        keep: &[PieId],
    ) -> Result<usize, StoreError>;
    fn fetch(&self, id: &PieId) -> Result<Option<Pie>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("pie {0} already exists")]
    Conflict(PieId),
    #[error("pie store unavailable: {0}")]
    Unavailable(String),
}

/// One atomic replacement of a patient's assessments for one method.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentBatch {
    pub patient_id: String,
    pub method: Coding,
    pub assessments: Vec<RiskAssessment>,
}

impl AssessmentBatch {
    pub fn delete_url(&self) -> String {
        risk_assessment_delete_url(&self.method, &self.patient_id)
    }

    /// FHIR transaction: the conditional delete first, then one create per assessment.
    pub fn to_transaction_bundle(&self) -> TransactionBundle {
        let mut bundle = TransactionBundle::new();
        bundle.delete(self.delete_url());
        for assessment in &self.assessments {
            bundle.create(assessment.clone());
        }
        bundle
    }
}

/// Outbound assessment sink. A batch either applies completely or not at all.
pub trait AssessmentPublisher: Send + Sync {
    fn publish(&self, batch: &AssessmentBatch) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("assessment batch rejected with status {status}")]
    Rejected { status: u16 },
    #[error("assessment transport failed: {0}")]
    Transport(String),
}

/// Clinical record lookup for one patient.
pub trait ClinicalRecordSource: Send + Sync {
    /// Return the patient record plus every record of the requested kinds.
    fn fetch(
        &self,
        patient_id: &str,
        kinds: &[ResourceKind],
    ) -> Result<Vec<Resource>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("patient {0} not found")]
    PatientNotFound(String),
    #[error("record source request failed: {0}")]
    Transport(String),
    #[error("record source returned an unreadable bundle: {0}")]
    Decode(String),
}
