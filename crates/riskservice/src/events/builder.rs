use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Event, EventPayload, EventStream};
use crate::fhir::{
    Condition, FhirDateTime, MedicationStatement, Observation, Period, Resource,
};

const MEDICATION_EXCLUDED_STATUS: &str = "entered-in-error";
const OBSERVATION_STATUSES: [&str; 4] = ["final", "amended", "preliminary", "registered"];

/// Failure to assemble a single-patient event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStreamError {
    #[error("found more than one patient in the record batch")]
    AmbiguousPatient,
    #[error("unsupported record kind '{kind}' cannot be converted to an event")]
    UnsupportedResourceKind { kind: String },
}

/// Date resolution and validity rules for one record kind.
trait DatedRecord {
    fn start_date(&self) -> Option<DateTime<Utc>>;
    fn end_date(&self) -> Option<DateTime<Utc>>;
    fn is_valid(&self) -> bool;
    fn record_id(&self) -> &str;
}

impl DatedRecord for Condition {
    fn start_date(&self) -> Option<DateTime<Utc>> {
        first_date([
            self.onset_date_time,
            period_start(self.onset_period.as_ref()),
            self.date_recorded,
        ])
    }

    fn end_date(&self) -> Option<DateTime<Utc>> {
        first_date([
            self.abatement_date_time,
            period_end(self.abatement_period.as_ref()),
        ])
    }

    fn is_valid(&self) -> bool {
        self.is_confirmed()
    }

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl DatedRecord for MedicationStatement {
    fn start_date(&self) -> Option<DateTime<Utc>> {
        first_date([
            self.effective_date_time,
            period_start(self.effective_period.as_ref()),
            self.date_asserted,
        ])
    }

    fn end_date(&self) -> Option<DateTime<Utc>> {
        first_date([period_end(self.effective_period.as_ref())])
    }

    fn is_valid(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| !status.is_empty() && status != MEDICATION_EXCLUDED_STATUS)
    }

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl DatedRecord for Observation {
    fn start_date(&self) -> Option<DateTime<Utc>> {
        first_date([
            self.effective_date_time,
            period_start(self.effective_period.as_ref()),
            self.issued,
        ])
    }

    fn end_date(&self) -> Option<DateTime<Utc>> {
        first_date([period_end(self.effective_period.as_ref())])
    }

    fn is_valid(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| OBSERVATION_STATUSES.contains(&status))
    }

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Convert an unordered record batch into one patient's chronological event stream.
///
/// Records failing their kind's validity check are dropped without error. Records with no
/// resolvable start or end date produce no events.
pub fn build_event_stream<I>(records: I) -> Result<EventStream, EventStreamError>
where
    I: IntoIterator<Item = Resource>,
{
    let mut stream = EventStream::new(None);

    for record in records {
        match record {
            Resource::Patient(patient) => {
                if stream.patient.is_some() {
                    return Err(EventStreamError::AmbiguousPatient);
                }
                stream.patient = Some(patient);
            }
            Resource::Condition(condition) => {
                push_record(&mut stream, "Condition", condition, EventPayload::Condition)
            }
            Resource::MedicationStatement(statement) => push_record(
                &mut stream,
                "MedicationStatement",
                statement,
                EventPayload::MedicationStatement,
            ),
            Resource::Observation(observation) => push_record(
                &mut stream,
                "Observation",
                observation,
                EventPayload::Observation,
            ),
            Resource::Unsupported { kind } => {
                return Err(EventStreamError::UnsupportedResourceKind { kind })
            }
        }
    }

    stream.sort();
    Ok(stream)
}

fn push_record<T, F>(stream: &mut EventStream, kind: &str, record: T, wrap: F)
where
    T: DatedRecord,
    F: Fn(Arc<T>) -> EventPayload,
{
    if !record.is_valid() {
        debug!(kind, id = record.record_id(), "skipping record with excluded status");
        return;
    }

    let start = record.start_date();
    let end = record.end_date();
    if start.is_none() && end.is_none() {
        debug!(kind, id = record.record_id(), "skipping record without a resolvable date");
        return;
    }

    let shared = Arc::new(record);
    if let Some(date) = start {
        stream.push(Event::start(date, wrap(Arc::clone(&shared))));
    }
    if let Some(date) = end {
        stream.push(Event::end(date, wrap(shared)));
    }
}

fn first_date<const N: usize>(candidates: [Option<FhirDateTime>; N]) -> Option<DateTime<Utc>> {
    candidates.into_iter().flatten().next().map(FhirDateTime::instant)
}

fn period_start(period: Option<&Period>) -> Option<FhirDateTime> {
    period.and_then(|period| period.start)
}

fn period_end(period: Option<&Period>) -> Option<FhirDateTime> {
    period.and_then(|period| period.end)
}
