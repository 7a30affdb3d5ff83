use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::repository::{
    AssessmentBatch, AssessmentPublisher, PieStore, PublishError, StoreError, StoredPie,
};
use crate::fhir::RiskAssessment;
use crate::pie::PieId;
use crate::plugins::{CalculationResult, MethodKey, PluginConfig};

/// Replaces a patient's stored pies and published assessments for one scoring method.
pub struct ReplacementSynchronizer<P, A> {
    pies: Arc<P>,
    publisher: Arc<A>,
}

/// What one synchronization changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub stored: Vec<PieId>,
    pub published: usize,
    pub removed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("plugin '{name}' has no method coding")]
    MissingMethodCoding { name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl<P, A> ReplacementSynchronizer<P, A>
where
    P: PieStore + 'static,
    A: AssessmentPublisher + 'static,
{
    pub fn new(pies: Arc<P>, publisher: Arc<A>) -> Self {
        Self { pies, publisher }
    }

    /// Store the new pies, publish the replacement batch, then drop superseded pies.
    ///
    /// `results` must already be consolidated. When publishing fails the freshly stored
    /// pies are removed again and previously stored state is left alone.
    pub fn synchronize(
        &self,
        patient_id: &str,
        config: &PluginConfig,
        results: &[CalculationResult],
        basis_pie_url: &str,
    ) -> Result<SyncReport, SyncError> {
        let coding = config
            .method_coding()
            .ok_or_else(|| SyncError::MissingMethodCoding {
                name: config.name.clone(),
            })?;
        let method = MethodKey::from(coding);

        let mut stored = Vec::with_capacity(results.len());
        for result in results {
            let staged = StoredPie {
                pie: result.pie.clone(),
                patient_id: patient_id.to_string(),
                method: method.clone(),
            };
            if let Err(err) = self.pies.insert(staged) {
                self.rollback(&stored);
                return Err(err.into());
            }
            stored.push(result.pie.id);
        }

        let batch = AssessmentBatch {
            patient_id: patient_id.to_string(),
            method: coding.clone(),
            assessments: assessments(patient_id, config, results, basis_pie_url),
        };
        if let Err(err) = self.publisher.publish(&batch) {
            self.rollback(&stored);
            return Err(err.into());
        }

        let removed = self
            .pies
            .remove_scope_except(patient_id, &method, &stored)?;

        Ok(SyncReport {
            published: batch.assessments.len(),
            stored,
            removed,
        })
    }

    fn rollback(&self, staged: &[PieId]) {
        for id in staged {
            if let Err(err) = self.pies.remove(id) {
                warn!(pie = %id, error = %err, "failed to roll back staged pie");
            }
        }
    }
}

fn assessments(
    patient_id: &str,
    config: &PluginConfig,
    results: &[CalculationResult],
    basis_pie_url: &str,
) -> Vec<RiskAssessment> {
    let latest = results
        .iter()
        .enumerate()
        .max_by_key(|(_, result)| result.as_of)
        .map(|(index, _)| index);

    results
        .iter()
        .enumerate()
        .map(|(index, result)| {
            let mut assessment = result.to_risk_assessment(patient_id, basis_pie_url, config);
            if Some(index) == latest {
                assessment.tag_most_recent();
            }
            assessment
        })
        .collect()
}
