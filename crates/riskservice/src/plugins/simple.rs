use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::{CalculationResult, NotApplicable, PluginConfig, RiskPlugin};
use crate::events::{EventPayload, EventStream};
use crate::fhir::{CodeableConcept, Coding, ResourceKind, RISK_ASSESSMENT_METHOD_SYSTEM};
use crate::pie::Slice;

const NAME: &str = "Simple Conditions + Medications";
const CONDITIONS: &str = "Conditions";
const MEDICATIONS: &str = "Medications";

/// Proof-of-concept score counting distinct active conditions and medications. Not
/// clinically validated.
pub struct SimplePlugin {
    config: PluginConfig,
}

impl SimplePlugin {
    pub fn new() -> Self {
        Self {
            config: PluginConfig {
                name: NAME.to_string(),
                method: CodeableConcept::coded(
                    Coding::new(RISK_ASSESSMENT_METHOD_SYSTEM, "Simple"),
                    NAME,
                ),
                predicted_outcome: CodeableConcept::text("Negative Outcome"),
                default_slices: vec![
                    Slice::new(CONDITIONS, 50, Some(5)),
                    Slice::new(MEDICATIONS, 50, Some(5)),
                ],
                required_kinds: vec![ResourceKind::Condition, ResourceKind::MedicationStatement],
                significant_ages: Vec::new(),
            },
        }
    }

    fn cap(&self, slice: &str) -> u32 {
        self.config
            .default_slices
            .iter()
            .find(|candidate| candidate.name == slice)
            .and_then(|candidate| candidate.max_value)
            .unwrap_or(u32::MAX)
    }
}

impl Default for SimplePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskPlugin for SimplePlugin {
    fn config(&self) -> &PluginConfig {
        &self.config
    }

    fn calculate(
        &self,
        stream: &EventStream,
        now: DateTime<Utc>,
    ) -> Result<Vec<CalculationResult>, NotApplicable> {
        // Active counts per `system|code`, so duplicate records are not double counted.
        let mut conditions: HashMap<String, u32> = HashMap::new();
        let mut medications: HashMap<String, u32> = HashMap::new();

        let mut pie = self.config.seed_pie(stream.patient_reference(), now);
        let mut results = Vec::new();

        for event in stream.events.iter().filter(|event| event.date <= now) {
            let (concept, active, slice) = match &event.payload {
                EventPayload::Condition(condition) => {
                    (condition.code.as_ref(), &mut conditions, CONDITIONS)
                }
                EventPayload::MedicationStatement(statement) => (
                    statement.medication_codeable_concept.as_ref(),
                    &mut medications,
                    MEDICATIONS,
                ),
                _ => continue,
            };
            let Some(coding) = concept.and_then(CodeableConcept::first_coding) else {
                continue;
            };

            let count = active
                .entry(format!("{}|{}", coding.system, coding.code))
                .or_insert(0);
            if event.end {
                *count = count.saturating_sub(1);
            } else {
                *count += 1;
            }
            let distinct = active.values().filter(|count| **count > 0).count();
            let distinct = u32::try_from(distinct).unwrap_or(u32::MAX);

            pie = pie.clone_with_new_id();
            pie.update_slice_value(slice, distinct.min(self.cap(slice)));
            results.push(CalculationResult {
                as_of: event.date,
                score: pie.total_values(),
                probability: None,
                pie: pie.clone(),
            });
        }

        if results.is_empty() {
            results.push(CalculationResult {
                as_of: now,
                score: 0,
                probability: None,
                pie,
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::fhir::{Condition, MedicationStatement, Patient};
    use chrono::TimeZone;
    use std::sync::Arc;

    const RXNORM: &str = "http://www.nlm.nih.gov/research/umls/rxnorm/";

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    fn stream() -> EventStream {
        EventStream::new(Some(Patient {
            id: "1223".to_string(),
            ..Patient::default()
        }))
    }

    fn condition(code: &str) -> EventPayload {
        EventPayload::Condition(Arc::new(Condition {
            code: Some(CodeableConcept::coded(
                Coding::new(crate::fhir::ICD9_SYSTEM, code),
                code,
            )),
            verification_status: Some("confirmed".to_string()),
            ..Condition::default()
        }))
    }

    fn medication(code: &str) -> EventPayload {
        EventPayload::MedicationStatement(Arc::new(MedicationStatement {
            status: Some("active".to_string()),
            medication_codeable_concept: Some(CodeableConcept::coded(
                Coding::new(RXNORM, code),
                code,
            )),
            ..MedicationStatement::default()
        }))
    }

    fn scores(results: &[CalculationResult]) -> Vec<u32> {
        results.iter().map(|result| result.score).collect()
    }

    #[test]
    fn counts_distinct_active_conditions_and_medications() {
        let mut stream = stream();
        let hypertension = condition("401.0");
        stream.push(Event::start(at(2000, 1, 1), hypertension.clone()));
        stream.push(Event::start(at(2001, 1, 1), medication("197361")));
        stream.push(Event::start(at(2002, 1, 1), condition("250.0")));
        stream.push(Event::end(at(2003, 1, 1), hypertension));

        let results = SimplePlugin::new()
            .calculate(&stream, at(2020, 1, 1))
            .expect("always applicable");

        assert_eq!(scores(&results), vec![1, 2, 3, 2]);
        assert!(results.iter().all(|result| result.probability.is_none()));
        assert_eq!(results[3].pie.slice_value(CONDITIONS), Some(1));
        assert_eq!(results[3].pie.slice_value(MEDICATIONS), Some(1));
    }

    #[test]
    fn duplicate_records_never_drive_counts_negative() {
        let mut stream = stream();
        let diabetes = condition("250.0");
        stream.push(Event::start(at(2000, 1, 1), diabetes.clone()));
        stream.push(Event::start(at(2000, 2, 1), diabetes.clone()));
        stream.push(Event::end(at(2001, 1, 1), diabetes.clone()));
        stream.push(Event::end(at(2001, 2, 1), diabetes.clone()));
        stream.push(Event::end(at(2001, 3, 1), diabetes.clone()));
        stream.push(Event::start(at(2002, 1, 1), diabetes));

        let results = SimplePlugin::new()
            .calculate(&stream, at(2020, 1, 1))
            .expect("always applicable");

        assert_eq!(scores(&results), vec![1, 1, 1, 0, 0, 1]);
    }

    #[test]
    fn slice_values_are_capped_at_max() {
        let mut stream = stream();
        for (index, code) in ["A", "B", "C", "D", "E", "F", "G"].into_iter().enumerate() {
            stream.push(Event::start(at(2000 + index as i32, 1, 1), medication(code)));
        }

        let results = SimplePlugin::new()
            .calculate(&stream, at(2020, 1, 1))
            .expect("always applicable");

        assert_eq!(scores(&results), vec![1, 2, 3, 4, 5, 5, 5]);
    }

    #[test]
    fn uncoded_and_future_events_are_skipped() {
        let mut stream = stream();
        stream.push(Event::start(
            at(2000, 1, 1),
            EventPayload::Condition(Arc::new(Condition::default())),
        ));
        stream.push(Event::start(at(2001, 1, 1), condition("401.0")));
        stream.push(Event::start(at(2030, 1, 1), condition("250.0")));

        let results = SimplePlugin::new()
            .calculate(&stream, at(2020, 1, 1))
            .expect("always applicable");

        assert_eq!(scores(&results), vec![1]);
    }

    #[test]
    fn no_factor_events_yields_one_zero_score_now() {
        let now = at(2020, 1, 1);
        let plugin = SimplePlugin::new();

        let results = plugin.calculate(&stream(), now).expect("always applicable");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 0);
        assert_eq!(results[0].as_of, now);
        assert_eq!(results[0].pie.slices, plugin.config().default_slices);
    }
}
