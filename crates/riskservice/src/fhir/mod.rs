//! FHIR record model: the clinical resources the scorers consume and the RiskAssessment
//! resources the service publishes.

mod datetime;
mod resources;
mod risk_assessment;

pub use datetime::{DateParseError, FhirDateTime};
pub use resources::{
    AdministrativeGender, Bundle, BundleEntry, CodeableConcept, Coding, Condition,
    MedicationStatement, Observation, Patient, Period, Quantity, Resource, ResourceKind,
};
pub use risk_assessment::{
    risk_assessment_delete_url, BundleRequest, Meta, Reference, RiskAssessment,
    RiskAssessmentPrediction, TransactionBundle, TransactionEntry, MOST_RECENT_TAG_CODE,
    MOST_RECENT_TAG_SYSTEM,
};

/// ICD-9-CM code system used by the diagnosis-driven scorers.
pub const ICD9_SYSTEM: &str = "http://hl7.org/fhir/sid/icd-9";

/// Code system identifying the risk assessment methods this service publishes.
pub const RISK_ASSESSMENT_METHOD_SYSTEM: &str = "http://interventionengine.org/risk-assessments";
