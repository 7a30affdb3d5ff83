use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// FHIR `date`, `dateTime`, or `instant` value resolved to a UTC instant.
///
/// Partial dates (`YYYY`, `YYYY-MM`, `YYYY-MM-DD`) resolve to the first instant of the period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhirDateTime(pub DateTime<Utc>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{value}' is not a FHIR date or dateTime")]
pub struct DateParseError {
    pub value: String,
}

impl FhirDateTime {
    pub fn parse(raw: &str) -> Result<Self, DateParseError> {
        let raw = raw.trim();

        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Self(parsed.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
            return Ok(Self(Utc.from_utc_datetime(&naive)));
        }

        let date = match raw.len() {
            4 => raw
                .parse::<i32>()
                .ok()
                .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1)),
            7 => raw.split_once('-').and_then(|(year, month)| {
                NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
            }),
            _ => NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok(),
        };

        date.and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Self(Utc.from_utc_datetime(&naive)))
            .ok_or_else(|| DateParseError {
                value: raw.to_string(),
            })
    }

    pub fn instant(self) -> DateTime<Utc> {
        self.0
    }

    pub fn date_naive(self) -> NaiveDate {
        self.0.date_naive()
    }
}

impl From<DateTime<Utc>> for FhirDateTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl fmt::Display for FhirDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

impl Serialize for FhirDateTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FhirDateTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        FhirDateTime::parse(&raw).map_err(serde::de::Error::custom)
    }
}
