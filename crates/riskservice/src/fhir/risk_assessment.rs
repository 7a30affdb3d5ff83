use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use super::datetime::FhirDateTime;
use super::resources::{CodeableConcept, Coding};

pub const MOST_RECENT_TAG_SYSTEM: &str = "http://interventionengine.org/tags/";
pub const MOST_RECENT_TAG_CODE: &str = "MOST_RECENT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub tag: Vec<Coding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessmentPrediction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability_decimal: Option<f64>,
    pub outcome: CodeableConcept,
}

/// FHIR RiskAssessment published for each calculated score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType", rename = "RiskAssessment", rename_all = "camelCase")]
pub struct RiskAssessment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    pub subject: Reference,
    pub method: CodeableConcept,
    pub date: FhirDateTime,
    pub prediction: Vec<RiskAssessmentPrediction>,
    pub basis: Vec<Reference>,
}

impl RiskAssessment {
    pub fn tag_most_recent(&mut self) {
        let meta = self.meta.get_or_insert_with(Meta::default);
        meta.tag
            .push(Coding::new(MOST_RECENT_TAG_SYSTEM, MOST_RECENT_TAG_CODE));
    }

    pub fn is_most_recent(&self) -> bool {
        self.meta.as_ref().is_some_and(|meta| {
            meta.tag.iter().any(|tag| {
                tag.system == MOST_RECENT_TAG_SYSTEM && tag.code == MOST_RECENT_TAG_CODE
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleRequest {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<RiskAssessment>,
    pub request: BundleRequest,
}

/// Transaction bundle submitted to the FHIR server in one round trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "resourceType", rename = "Bundle")]
pub struct TransactionBundle {
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub entry: Vec<TransactionEntry>,
}

impl TransactionBundle {
    pub fn new() -> Self {
        Self {
            bundle_type: "transaction".to_string(),
            entry: Vec::new(),
        }
    }

    pub fn delete(&mut self, url: impl Into<String>) {
        self.entry.push(TransactionEntry {
            resource: None,
            request: BundleRequest {
                method: "DELETE".to_string(),
                url: url.into(),
            },
        });
    }

    pub fn create(&mut self, assessment: RiskAssessment) {
        self.entry.push(TransactionEntry {
            resource: Some(assessment),
            request: BundleRequest {
                method: "POST".to_string(),
                url: "RiskAssessment".to_string(),
            },
        });
    }
}

impl Default for TransactionBundle {
    fn default() -> Self {
        Self::new()
    }
}

/// Conditional delete URL matching every assessment of one method for one patient.
pub fn risk_assessment_delete_url(method: &Coding, patient_id: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("method", &format!("{}|{}", method.system, method.code))
        .append_pair("patient", patient_id)
        .finish();
    format!("RiskAssessment?{query}")
}
