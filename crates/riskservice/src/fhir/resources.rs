use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::datetime::FhirDateTime;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Coding {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub system: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            code: code.into(),
            display: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeableConcept {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            coding: Vec::new(),
            text: Some(text.into()),
        }
    }

    pub fn coded(coding: Coding, text: impl Into<String>) -> Self {
        Self {
            coding: vec![coding],
            text: Some(text.into()),
        }
    }

    pub fn first_coding(&self) -> Option<&Coding> {
        self.coding.first()
    }

    /// True when any coding in `system` has a code starting with `prefix`.
    pub fn has_code_prefix(&self, system: &str, prefix: &str) -> bool {
        self.coding
            .iter()
            .any(|coding| coding.system == system && coding.code.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Period {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<FhirDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<FhirDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quantity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdministrativeGender {
    Male,
    Female,
    Other,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<AdministrativeGender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<FhirDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Condition {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeableConcept>,
    #[serde(
        deserialize_with = "status_code",
        skip_serializing_if = "Option::is_none"
    )]
    pub verification_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onset_date_time: Option<FhirDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onset_period: Option<Period>,
    #[serde(
        alias = "assertedDate",
        alias = "recordedDate",
        skip_serializing_if = "Option::is_none"
    )]
    pub date_recorded: Option<FhirDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abatement_date_time: Option<FhirDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abatement_period: Option<Period>,
}

impl Condition {
    pub fn is_confirmed(&self) -> bool {
        self.verification_status.as_deref() == Some("confirmed")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MedicationStatement {
    pub id: String,
    #[serde(
        deserialize_with = "status_code",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medication_codeable_concept: Option<CodeableConcept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date_time: Option<FhirDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_period: Option<Period>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_asserted: Option<FhirDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Observation {
    pub id: String,
    #[serde(
        deserialize_with = "status_code",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeableConcept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date_time: Option<FhirDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_period: Option<Period>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued: Option<FhirDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
}

/// Record kinds the service knows how to turn into events or query for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Patient,
    Condition,
    MedicationStatement,
    Observation,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Patient => "Patient",
            ResourceKind::Condition => "Condition",
            ResourceKind::MedicationStatement => "MedicationStatement",
            ResourceKind::Observation => "Observation",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Patient" => Some(ResourceKind::Patient),
            "Condition" => Some(ResourceKind::Condition),
            "MedicationStatement" => Some(ResourceKind::MedicationStatement),
            "Observation" => Some(ResourceKind::Observation),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded clinical record. Kinds outside the supported set keep their name so callers can
/// report exactly what they could not handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Patient(Patient),
    Condition(Condition),
    MedicationStatement(MedicationStatement),
    Observation(Observation),
    Unsupported { kind: String },
}

impl Resource {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let resource = match ResourceKind::from_name(&kind) {
            Some(ResourceKind::Patient) => Resource::Patient(serde_json::from_value(value)?),
            Some(ResourceKind::Condition) => Resource::Condition(serde_json::from_value(value)?),
            Some(ResourceKind::MedicationStatement) => {
                Resource::MedicationStatement(serde_json::from_value(value)?)
            }
            Some(ResourceKind::Observation) => {
                Resource::Observation(serde_json::from_value(value)?)
            }
            None => Resource::Unsupported { kind },
        };

        Ok(resource)
    }

    pub fn kind_name(&self) -> &str {
        match self {
            Resource::Patient(_) => ResourceKind::Patient.as_str(),
            Resource::Condition(_) => ResourceKind::Condition.as_str(),
            Resource::MedicationStatement(_) => ResourceKind::MedicationStatement.as_str(),
            Resource::Observation(_) => ResourceKind::Observation.as_str(),
            Resource::Unsupported { kind } => kind,
        }
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Resource::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Search or batch bundle as returned by a FHIR server.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Bundle {
    #[serde(rename = "type")]
    pub bundle_type: Option<String>,
    pub entry: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BundleEntry {
    pub resource: Option<Resource>,
}

impl Bundle {
    pub fn into_resources(self) -> Vec<Resource> {
        self.entry
            .into_iter()
            .filter_map(|entry| entry.resource)
            .collect()
    }
}

// Status elements are plain codes in older FHIR releases and CodeableConcepts in newer ones.
fn status_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(code)) => Some(code),
        Some(Value::Object(concept)) => concept
            .get("coding")
            .and_then(Value::as_array)
            .and_then(|codings| codings.first())
            .and_then(|coding| coding.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    })
}
