//! Risk calculation pipeline: fetch records, score them with every registered plugin, and
//! replace each plugin's stored history for the patient.

mod consolidate;
pub mod repository;
pub mod router;
mod sync;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::events::{build_event_stream, EventStreamError};
use crate::pie::{Pie, PieId};
use crate::plugins::PluginRegistry;

pub use consolidate::consolidate;
pub use repository::{
    AssessmentBatch, AssessmentPublisher, ClinicalRecordSource, PieStore, PublishError,
    SourceError, StoreError, StoredPie,
};
pub use router::{risk_router, CalculateRequest, RiskRouterState};
pub use sync::{ReplacementSynchronizer, SyncError, SyncReport};

/// Service composing the record source, the plugin registry, and the synchronizer.
pub struct RiskService<S, P, A> {
    source: Arc<S>,
    pies: Arc<P>,
    synchronizer: ReplacementSynchronizer<P, A>,
    registry: PluginRegistry,
    basis_pie_url: String,
}

/// Per-plugin outcome of one calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginOutcome {
    pub plugin: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Scored {
        results: usize,
        latest_score: Option<u32>,
        removed_pies: usize,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationSummary {
    pub patient_id: String,
    pub calculated_at: DateTime<Utc>,
    pub outcomes: Vec<PluginOutcome>,
}

impl CalculationSummary {
    pub fn outcome(&self, plugin: &str) -> Option<&OutcomeStatus> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.plugin == plugin)
            .map(|outcome| &outcome.status)
    }
}

impl<S, P, A> RiskService<S, P, A>
where
    S: ClinicalRecordSource + 'static,
    P: PieStore + 'static,
    A: AssessmentPublisher + 'static,
{
    pub fn new(
        source: Arc<S>,
        pies: Arc<P>,
        publisher: Arc<A>,
        registry: PluginRegistry,
        basis_pie_url: impl Into<String>,
    ) -> Self {
        let synchronizer = ReplacementSynchronizer::new(Arc::clone(&pies), publisher);
        Self {
            source,
            pies,
            synchronizer,
            registry,
            basis_pie_url: basis_pie_url.into(),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Recalculate and replace every plugin's score history for the patient as of now.
    pub fn calculate(&self, patient_id: &str) -> Result<CalculationSummary, RiskServiceError> {
        self.calculate_at(patient_id, Utc::now())
    }

    /// Like [`RiskService::calculate`], evaluating plugins as of `now`.
    pub fn calculate_at(
        &self,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CalculationSummary, RiskServiceError> {
        let records = self
            .source
            .fetch(patient_id, &self.registry.required_kinds())?;
        let stream = build_event_stream(records)?;

        let mut outcomes = Vec::with_capacity(self.registry.len());
        for plugin in self.registry.plugins() {
            let config = plugin.config();
            let plugin_stream = stream.with_significant_birthdays(&config.significant_ages, now);

            let results = match plugin.calculate(&plugin_stream, now) {
                Ok(results) => consolidate(results),
                Err(not_applicable) => {
                    debug!(
                        patient_id,
                        plugin = %config.name,
                        reason = %not_applicable.reason,
                        "plugin not applicable, skipping"
                    );
                    outcomes.push(PluginOutcome {
                        plugin: config.name.clone(),
                        status: OutcomeStatus::Skipped {
                            reason: not_applicable.reason,
                        },
                    });
                    continue;
                }
            };

            let report = self.synchronizer.synchronize(
                patient_id,
                config,
                &results,
                &self.basis_pie_url,
            )?;
            let latest_score = results.last().map(|result| result.score);

            info!(
                patient_id,
                plugin = %config.name,
                results = results.len(),
                removed_pies = report.removed,
                ?latest_score,
                "risk scores synchronized"
            );

            outcomes.push(PluginOutcome {
                plugin: config.name.clone(),
                status: OutcomeStatus::Scored {
                    results: results.len(),
                    latest_score,
                    removed_pies: report.removed,
                },
            });
        }

        Ok(CalculationSummary {
            patient_id: patient_id.to_string(),
            calculated_at: now,
            outcomes,
        })
    }

    /// Fetch a stored pie for the basis links of published assessments.
    pub fn pie(&self, id: &PieId) -> Result<Pie, RiskServiceError> {
        self.pies
            .fetch(id)?
            .ok_or(RiskServiceError::PieNotFound(*id))
    }
}

/// Error raised by the risk service.
#[derive(Debug, thiserror::Error)]
pub enum RiskServiceError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    EventStream(#[from] EventStreamError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pie {0} not found")]
    PieNotFound(PieId),
}
