//! Clinical risk scoring service core.
//!
//! Clinical records are turned into a chronological [`events::EventStream`], scored by the
//! registered [`plugins::RiskPlugin`]s, consolidated, and synchronized into the pie store and the
//! assessment publisher. Recalculation triggers are debounced per key by
//! [`scheduler::FunctionDelayer`].

pub mod config;
pub mod error;
pub mod events;
pub mod fhir;
pub mod pie;
pub mod plugins;
pub mod scheduler;
pub mod service;
pub mod telemetry;
