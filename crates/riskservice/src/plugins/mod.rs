//! Scoring plugin contract, the two reference scorers, and the registry that owns them.

mod cha2ds2_vasc;
mod registry;
mod simple;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::EventStream;
use crate::fhir::{
    CodeableConcept, Coding, Reference, ResourceKind, RiskAssessment, RiskAssessmentPrediction,
};
use crate::pie::{Pie, Slice};

pub use cha2ds2_vasc::{Cha2ds2VascPlugin, ProbabilityTable};
pub use registry::{PluginRegistry, RegistryError};
pub use simple::SimplePlugin;

/// Static description of a scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    /// Identifies the scorer on published assessments and scopes its stored pies.
    pub method: CodeableConcept,
    pub predicted_outcome: CodeableConcept,
    pub default_slices: Vec<Slice>,
    pub required_kinds: Vec<ResourceKind>,
    pub significant_ages: Vec<u32>,
}

impl PluginConfig {
    pub fn method_coding(&self) -> Option<&Coding> {
        self.method.first_coding()
    }

    pub fn method_key(&self) -> Option<MethodKey> {
        self.method_coding().map(MethodKey::from)
    }

    /// Fresh pie holding the default slices, all values zero.
    pub fn seed_pie(&self, patient: impl Into<String>, created: DateTime<Utc>) -> Pie {
        Pie::new(patient, created).with_slices(self.default_slices.clone())
    }
}

/// `system|code` pair identifying a scoring method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey {
    pub system: String,
    pub code: String,
}

impl From<&Coding> for MethodKey {
    fn from(coding: &Coding) -> Self {
        Self {
            system: coding.system.clone(),
            code: coding.code.clone(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.system, self.code)
    }
}

/// Score at one instant, with the pie explaining it.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationResult {
    pub as_of: DateTime<Utc>,
    pub score: u32,
    pub probability: Option<f64>,
    pub pie: Pie,
}

impl CalculationResult {
    /// Published prediction value: the probability when the scorer has one, else the score.
    pub fn probability_or_score(&self) -> f64 {
        self.probability.unwrap_or(f64::from(self.score))
    }

    pub fn to_risk_assessment(
        &self,
        patient_id: &str,
        basis_pie_url: &str,
        config: &PluginConfig,
    ) -> RiskAssessment {
        RiskAssessment {
            meta: None,
            subject: Reference {
                reference: format!("Patient/{patient_id}"),
            },
            method: config.method.clone(),
            date: self.as_of.into(),
            prediction: vec![RiskAssessmentPrediction {
                probability_decimal: Some(self.probability_or_score()),
                outcome: config.predicted_outcome.clone(),
            }],
            basis: vec![Reference {
                reference: format!("{}/{}", basis_pie_url.trim_end_matches('/'), self.pie.id),
            }],
        }
    }
}

/// Raised when a scorer does not apply to the patient at all. Not a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not applicable: {reason}")]
pub struct NotApplicable {
    pub reason: String,
}

impl NotApplicable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A risk scorer. Implementations are pure: identical streams and `now` give identical
/// scores.
pub trait RiskPlugin: Send + Sync {
    fn config(&self) -> &PluginConfig;

    fn calculate(
        &self,
        stream: &EventStream,
        now: DateTime<Utc>,
    ) -> Result<Vec<CalculationResult>, NotApplicable>;
}
