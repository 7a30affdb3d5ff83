//! Chronological event model shared by every scoring plugin.

mod builder;

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Months, Utc};

use crate::fhir::{Condition, MedicationStatement, Observation, Patient};

pub use builder::{build_event_stream, EventStreamError};

/// Category of an event, derived from its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Condition,
    MedicationStatement,
    Observation,
    Age,
}

/// The fact behind an event. Record payloads are shared between the start and end events
/// of the same record and across cloned streams.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Condition(Arc<Condition>),
    MedicationStatement(Arc<MedicationStatement>),
    Observation(Arc<Observation>),
    /// Synthetic milestone: the patient reached this age in years.
    Age(u32),
}

/// A dated clinical fact. `end` marks the closing edge of a record with a known end date.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub date: DateTime<Utc>,
    pub end: bool,
    pub payload: EventPayload,
}

impl Event {
    pub fn start(date: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            date,
            end: false,
            payload,
        }
    }

    pub fn end(date: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            date,
            end: true,
            payload,
        }
    }

    pub fn age_milestone(date: DateTime<Utc>, age: u32) -> Self {
        Self::start(date, EventPayload::Age(age))
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Condition(_) => EventKind::Condition,
            EventPayload::MedicationStatement(_) => EventKind::MedicationStatement,
            EventPayload::Observation(_) => EventKind::Observation,
            EventPayload::Age(_) => EventKind::Age,
        }
    }
}

/// One patient's events in ascending date order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventStream {
    pub patient: Option<Patient>,
    pub events: Vec<Event>,
}

impl EventStream {
    pub fn new(patient: Option<Patient>) -> Self {
        Self {
            patient,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Stable sort by date; events sharing a date keep their insertion order.
    pub fn sort(&mut self) {
        self.events.sort_by_key(|event| event.date);
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.patient.as_ref().map(|patient| patient.id.as_str())
    }

    /// Relative FHIR reference to the patient, empty when the stream has no patient.
    pub fn patient_reference(&self) -> String {
        self.patient_id()
            .map(|id| format!("Patient/{id}"))
            .unwrap_or_default()
    }

    /// Copy of the stream with one age milestone per birthday already reached at `now`.
    pub fn with_significant_birthdays(&self, ages: &[u32], now: DateTime<Utc>) -> Self {
        let mut stream = self.clone();
        let Some(birth_date) = self
            .patient
            .as_ref()
            .and_then(|patient| patient.birth_date)
        else {
            return stream;
        };

        let born = birth_date.instant();
        for &age in ages {
            let Some(mut birthday) =
                born.checked_add_months(Months::new(age.saturating_mul(12)))
            else {
                continue;
            };
            // Leap-day birthdays fall on March 1st in common years.
            if born.month() == 2 && born.day() == 29 && birthday.day() == 28 {
                birthday += Duration::days(1);
            }
            if birthday < now {
                stream.push(Event::age_milestone(birthday, age));
            }
        }

        stream.sort();
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir::{AdministrativeGender, FhirDateTime};
    use chrono::TimeZone;

    fn patient_born(raw: &str) -> Patient {
        Patient {
            id: "1223".to_string(),
            gender: Some(AdministrativeGender::Female),
            birth_date: Some(FhirDateTime::parse(raw).expect("birth date")),
        }
    }

    #[test]
    fn injects_only_birthdays_before_now() {
        let mut stream = EventStream::new(Some(patient_born("1940-07-01")));
        stream.push(Event::start(
            Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap(),
            EventPayload::Observation(Arc::new(Observation::default())),
        ));
        let now = Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap();

        let stream = stream.with_significant_birthdays(&[65, 75], now);

        assert_eq!(stream.events.len(), 2);
        assert_eq!(stream.events[0].payload, EventPayload::Age(65));
        assert_eq!(
            stream.events[0].date,
            Utc.with_ymd_and_hms(2005, 7, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(stream.events[1].kind(), EventKind::Observation);
    }

    #[test]
    fn leap_day_birthdays_roll_forward_in_common_years() {
        let stream = EventStream::new(Some(patient_born("1944-02-29")));
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        let stream = stream.with_significant_birthdays(&[65, 76], now);

        assert_eq!(
            stream.events[0].date,
            Utc.with_ymd_and_hms(2009, 3, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            stream.events[1].date,
            Utc.with_ymd_and_hms(2020, 2, 29, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn streams_without_birth_date_get_no_milestones() {
        let mut patient = patient_born("1940");
        patient.birth_date = None;
        let stream = EventStream::new(Some(patient));

        let stream = stream.with_significant_birthdays(&[65, 75], Utc::now());

        assert!(stream.events.is_empty());
        assert_eq!(stream.patient_reference(), "Patient/1223");
    }
}
