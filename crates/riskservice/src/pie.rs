use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a stored pie snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PieId(pub Uuid);

impl PieId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PieId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PieId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

/// One weighted factor of a score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    pub name: String,
    pub weight: u32,
    pub value: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<u32>,
}

impl Slice {
    pub fn new(name: impl Into<String>, weight: u32, max_value: Option<u32>) -> Self {
        Self {
            name: name.into(),
            weight,
            value: 0,
            max_value,
        }
    }
}

/// Weighted-factor snapshot behind one calculated score. The sum of the slice values is the
/// score; clones never share slice storage with the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pie {
    pub id: PieId,
    pub slices: Vec<Slice>,
    pub patient: String,
    pub created: DateTime<Utc>,
}

impl Pie {
    pub fn new(patient: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            id: PieId::new(),
            slices: Vec::new(),
            patient: patient.into(),
            created,
        }
    }

    pub fn with_slices(mut self, slices: Vec<Slice>) -> Self {
        self.slices = slices;
        self
    }

    pub fn add_slice(
        &mut self,
        name: impl Into<String>,
        weight: u32,
        value: u32,
        max_value: Option<u32>,
    ) {
        self.slices.push(Slice {
            name: name.into(),
            weight,
            value,
            max_value,
        });
    }

    /// Set the value of the first slice named `name`. Unknown names are ignored.
    pub fn update_slice_value(&mut self, name: &str, value: u32) {
        if let Some(slice) = self.slices.iter_mut().find(|slice| slice.name == name) {
            slice.value = value;
        }
    }

    pub fn slice_value(&self, name: &str) -> Option<u32> {
        self.slices
            .iter()
            .find(|slice| slice.name == name)
            .map(|slice| slice.value)
    }

    pub fn total_values(&self) -> u32 {
        self.slices.iter().map(|slice| slice.value).sum()
    }

    pub fn clone_with_new_id(&self) -> Self {
        let mut cloned = self.clone();
        cloned.id = PieId::new();
        cloned
    }
}
