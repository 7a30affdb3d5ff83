use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{CalculationResult, NotApplicable, PluginConfig, RiskPlugin};
use crate::events::{EventPayload, EventStream};
use crate::fhir::{
    AdministrativeGender, CodeableConcept, Coding, Condition, ResourceKind, ICD9_SYSTEM,
    RISK_ASSESSMENT_METHOD_SYSTEM,
};
use crate::pie::{Pie, Slice};

const NAME: &str = "CHA2DS2–VASc score";
const ATRIAL_FIBRILLATION: &str = "427.31";

const CONGESTIVE_HEART_FAILURE: &str = "Congestive Heart Failure";
const HYPERTENSION: &str = "Hypertension";
const DIABETES: &str = "Diabetes";
const STROKE: &str = "Stroke";
const VASCULAR_DISEASE: &str = "Vascular Disease";
const AGE: &str = "Age";
const GENDER: &str = "Gender";

// ICD-9 prefix, slice, value. Checked in order; the first match wins.
const CONDITION_FACTORS: [(&str, &str, u32); 5] = [
    ("428", CONGESTIVE_HEART_FAILURE, 1),
    ("401", HYPERTENSION, 1),
    ("250", DIABETES, 1),
    ("434", STROKE, 2),
    ("443", VASCULAR_DISEASE, 1),
];

/// Score to annual stroke risk (percent) lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityTable {
    entries: BTreeMap<u32, f64>,
}

impl ProbabilityTable {
    pub fn new(entries: impl IntoIterator<Item = (u32, f64)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Annual stroke risk by CHA2DS2-VASc score, from the AHA stroke outcomes table.
    pub fn stroke_risk() -> Self {
        Self::new([
            (0, 0.0),
            (1, 1.3),
            (2, 2.2),
            (3, 3.2),
            (4, 4.0),
            (5, 6.7),
            (6, 9.8),
            (7, 9.6),
            (8, 6.7),
            (9, 15.2),
        ])
    }

    pub fn probability(&self, score: u32) -> Option<f64> {
        self.entries.get(&score).copied()
    }
}

/// CHA2DS2-VASc stroke risk score for patients with atrial fibrillation.
pub struct Cha2ds2VascPlugin {
    config: PluginConfig,
    table: ProbabilityTable,
}

impl Cha2ds2VascPlugin {
    pub fn new(table: ProbabilityTable) -> Self {
        let config = PluginConfig {
            name: NAME.to_string(),
            method: CodeableConcept::coded(
                Coding::new(RISK_ASSESSMENT_METHOD_SYSTEM, "CHADS"),
                NAME,
            ),
            predicted_outcome: CodeableConcept::text("Stroke"),
            default_slices: vec![
                Slice::new(CONGESTIVE_HEART_FAILURE, 11, Some(1)),
                Slice::new(HYPERTENSION, 11, Some(1)),
                Slice::new(DIABETES, 11, Some(1)),
                Slice::new(STROKE, 22, Some(2)),
                Slice::new(VASCULAR_DISEASE, 11, Some(1)),
                Slice::new(AGE, 22, Some(2)),
                Slice::new(GENDER, 11, Some(1)),
            ],
            required_kinds: vec![ResourceKind::Condition],
            significant_ages: vec![65, 75],
        };

        Self { config, table }
    }

    fn seed(&self, stream: &EventStream, now: DateTime<Utc>) -> Pie {
        let mut pie = self.config.seed_pie(stream.patient_reference(), now);
        match stream.patient.as_ref().and_then(|patient| patient.gender) {
            Some(AdministrativeGender::Female) => pie.update_slice_value(GENDER, 1),
            Some(AdministrativeGender::Male) => pie.update_slice_value(GENDER, 0),
            _ => {}
        }
        pie
    }
}

impl Default for Cha2ds2VascPlugin {
    fn default() -> Self {
        Self::new(ProbabilityTable::stroke_risk())
    }
}

impl RiskPlugin for Cha2ds2VascPlugin {
    fn config(&self) -> &PluginConfig {
        &self.config
    }

    fn calculate(
        &self,
        stream: &EventStream,
        now: DateTime<Utc>,
    ) -> Result<Vec<CalculationResult>, NotApplicable> {
        let has_atrial_fibrillation = stream.events.iter().any(|event| match &event.payload {
            EventPayload::Condition(condition) => {
                !event.end && diagnosed(condition, ATRIAL_FIBRILLATION)
            }
            _ => false,
        });
        if !has_atrial_fibrillation {
            return Err(NotApplicable::new(
                "CHA2DS2-VASc only applies to patients with atrial fibrillation",
            ));
        }

        let mut pie = self.seed(stream, now);
        let mut qualified = false;
        let mut results = Vec::new();

        // End edges are ignored: a diagnosis in the history counts from onset onward.
        for event in stream
            .events
            .iter()
            .filter(|event| !event.end && event.date <= now)
        {
            pie = pie.clone_with_new_id();

            let is_factor = match &event.payload {
                EventPayload::Condition(condition) => {
                    if diagnosed(condition, ATRIAL_FIBRILLATION) {
                        qualified = true;
                        true
                    } else if let Some((_, slice, value)) = CONDITION_FACTORS
                        .iter()
                        .find(|(prefix, _, _)| diagnosed(condition, prefix))
                    {
                        pie.update_slice_value(slice, *value);
                        true
                    } else {
                        false
                    }
                }
                EventPayload::Age(age) if (65..75).contains(age) => {
                    pie.update_slice_value(AGE, 1);
                    true
                }
                EventPayload::Age(age) if *age >= 75 => {
                    pie.update_slice_value(AGE, 2);
                    true
                }
                _ => false,
            };

            if qualified && is_factor {
                let score = pie.total_values();
                results.push(CalculationResult {
                    as_of: event.date,
                    score,
                    probability: self.table.probability(score),
                    pie: pie.clone(),
                });
            }
        }

        Ok(results)
    }
}

fn diagnosed(condition: &Condition, prefix: &str) -> bool {
    condition.is_confirmed()
        && condition
            .code
            .as_ref()
            .is_some_and(|code| code.has_code_prefix(ICD9_SYSTEM, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::fhir::{FhirDateTime, Patient};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        at(2020, 1, 1, 0)
    }

    fn stream(gender: AdministrativeGender) -> EventStream {
        EventStream::new(Some(Patient {
            id: "1223".to_string(),
            gender: Some(gender),
            birth_date: Some(FhirDateTime::parse("1940-07-01").expect("birth date")),
        }))
    }

    fn condition(id: &str, code: &str, onset: DateTime<Utc>) -> Event {
        Event::start(
            onset,
            EventPayload::Condition(Arc::new(Condition {
                id: id.to_string(),
                code: Some(CodeableConcept::coded(Coding::new(ICD9_SYSTEM, code), id)),
                verification_status: Some("confirmed".to_string()),
                onset_date_time: Some(onset.into()),
                ..Condition::default()
            })),
        )
    }

    fn scores(results: &[CalculationResult]) -> Vec<u32> {
        results.iter().map(|result| result.score).collect()
    }

    #[test]
    fn every_factor_accumulates_with_published_probabilities() {
        let mut stream = stream(AdministrativeGender::Female);
        stream.push(condition("afib", "427.31", at(1990, 2, 15, 15)));
        stream.push(condition("chf", "428.0", at(1993, 3, 15, 15)));
        stream.push(condition("htn", "401.0", at(1997, 4, 15, 15)));
        stream.push(condition("dm", "250.0", at(2000, 5, 15, 15)));
        stream.push(condition("stroke", "434.91", at(2004, 6, 15, 15)));
        stream.push(Event::age_milestone(at(2005, 7, 1, 0), 65));
        stream.push(condition("vasc", "443.9", at(2007, 7, 15, 15)));
        stream.push(Event::age_milestone(at(2015, 7, 1, 0), 75));

        let results = Cha2ds2VascPlugin::default()
            .calculate(&stream, now())
            .expect("applicable");

        assert_eq!(scores(&results), vec![1, 2, 3, 4, 6, 7, 8, 9]);
        let probabilities: Vec<Option<f64>> =
            results.iter().map(|result| result.probability).collect();
        assert_eq!(
            probabilities,
            [1.3, 2.2, 3.2, 4.0, 9.8, 9.6, 6.7, 15.2].map(Some).to_vec()
        );
        assert_eq!(results[7].as_of, at(2015, 7, 1, 0));
        assert_eq!(results[7].pie.slice_value(AGE), Some(2));
        assert_eq!(results[7].pie.patient, "Patient/1223");
    }

    #[test]
    fn factors_before_diagnosis_are_counted_but_not_emitted() {
        let mut stream = stream(AdministrativeGender::Female);
        stream.push(Event::age_milestone(at(2005, 7, 1, 0), 65));
        stream.push(condition("chf", "428.0", at(2006, 3, 15, 15)));
        stream.push(condition("afib", "427.31", at(2010, 2, 15, 15)));
        stream.push(condition("dm", "250.0", at(2012, 5, 15, 15)));
        stream.push(Event::age_milestone(at(2015, 7, 1, 0), 75));

        let results = Cha2ds2VascPlugin::default()
            .calculate(&stream, now())
            .expect("applicable");

        assert_eq!(scores(&results), vec![3, 4, 5]);
        assert_eq!(results[0].as_of, at(2010, 2, 15, 15));
    }

    #[test]
    fn male_with_atrial_fibrillation_only_scores_zero() {
        let mut stream = stream(AdministrativeGender::Male);
        stream.push(condition("afib", "427.31", at(1990, 2, 15, 15)));

        let results = Cha2ds2VascPlugin::default()
            .calculate(&stream, now())
            .expect("applicable");

        assert_eq!(scores(&results), vec![0]);
        assert_eq!(results[0].probability, Some(0.0));
    }

    #[test]
    fn future_and_unrelated_events_are_ignored() {
        let mut stream = stream(AdministrativeGender::Female);
        stream.push(condition("rash", "782.1", at(1985, 1, 15, 15)));
        stream.push(condition("afib", "427.31", at(1990, 2, 15, 15)));
        stream.push(condition("htn", "401.0", at(1997, 4, 15, 15)));
        stream.push(condition("stroke", "434.91", at(2035, 6, 15, 15)));

        let results = Cha2ds2VascPlugin::default()
            .calculate(&stream, now())
            .expect("applicable");

        assert_eq!(scores(&results), vec![1, 2]);
    }

    #[test]
    fn pies_get_fresh_identities_per_result() {
        let mut stream = stream(AdministrativeGender::Female);
        stream.push(condition("afib", "427.31", at(1990, 2, 15, 15)));
        stream.push(condition("htn", "401.0", at(1997, 4, 15, 15)));

        let results = Cha2ds2VascPlugin::default()
            .calculate(&stream, now())
            .expect("applicable");

        assert_ne!(results[0].pie.id, results[1].pie.id);
        assert_eq!(results[0].pie.slice_value(HYPERTENSION), Some(0));
    }

    #[test]
    fn without_atrial_fibrillation_is_not_applicable() {
        let mut stream = stream(AdministrativeGender::Female);
        stream.push(condition("htn", "401.0", at(1997, 4, 15, 15)));

        let err = Cha2ds2VascPlugin::default()
            .calculate(&stream, now())
            .expect_err("no qualifying diagnosis");

        assert!(err.reason.contains("atrial fibrillation"));
    }

    #[test]
    fn future_only_diagnosis_yields_no_results() {
        let mut stream = stream(AdministrativeGender::Female);
        stream.push(condition("afib", "427.31", at(2035, 2, 15, 15)));

        let results = Cha2ds2VascPlugin::default()
            .calculate(&stream, now())
            .expect("pre-scan ignores dates");

        assert!(results.is_empty());
    }

    #[test]
    fn custom_probability_tables_are_honored() {
        let mut stream = stream(AdministrativeGender::Female);
        stream.push(condition("afib", "427.31", at(1990, 2, 15, 15)));

        let plugin = Cha2ds2VascPlugin::new(ProbabilityTable::new([(1, 42.0)]));
        let results = plugin.calculate(&stream, now()).expect("applicable");

        assert_eq!(results[0].probability, Some(42.0));
    }
}
