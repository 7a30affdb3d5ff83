use crate::infra::{
    parse_instant, BundleFileSource, InMemoryAssessmentPublisher, InMemoryPieStore,
};
use chrono::{DateTime, Utc};
use clap::Args;
use riskservice::config::AppConfig;
use riskservice::error::AppError;
use riskservice::plugins::PluginRegistry;
use riskservice::service::{
    CalculationSummary, OutcomeStatus, RiskService, RiskServiceError, SourceError,
};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct ScoreArgs {
    /// FHIR Bundle (JSON) holding one patient and their records
    #[arg(long)]
    pub(crate) bundle: PathBuf,
    /// Evaluate as of this RFC 3339 instant (defaults to now)
    #[arg(long, value_parser = parse_instant)]
    pub(crate) now: Option<DateTime<Utc>>,
}

type FileService = RiskService<BundleFileSource, InMemoryPieStore, InMemoryAssessmentPublisher>;

pub(crate) fn run_score(args: ScoreArgs) -> Result<(), AppError> {
    let ScoreArgs { bundle, now } = args;

    let source = BundleFileSource::from_path(&bundle)?;
    let patient_id = source
        .patient_id()
        .map(str::to_string)
        .ok_or_else(|| {
            RiskServiceError::Source(SourceError::PatientNotFound(bundle.display().to_string()))
        })?;
    let basis_pie_url = AppConfig::load()?.risk.basis_pie_url;
    let now = now.unwrap_or_else(Utc::now);

    let publisher = Arc::new(InMemoryAssessmentPublisher::default());
    let service = RiskService::new(
        Arc::new(source),
        Arc::new(InMemoryPieStore::default()),
        publisher.clone(),
        PluginRegistry::standard()?,
        basis_pie_url,
    );

    let summary = service.calculate_at(&patient_id, now)?;
    print!("{}", render_summary(&service, &publisher, &summary));
    Ok(())
}

fn render_summary(
    service: &FileService,
    publisher: &InMemoryAssessmentPublisher,
    summary: &CalculationSummary,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Risk scores for Patient/{} as of {}",
        summary.patient_id,
        summary.calculated_at.to_rfc3339()
    );

    for outcome in &summary.outcomes {
        let _ = writeln!(out, "\n{}", outcome.plugin);
        match &outcome.status {
            OutcomeStatus::Skipped { reason } => {
                let _ = writeln!(out, "  skipped: {reason}");
            }
            OutcomeStatus::Scored { results, .. } => {
                let _ = writeln!(out, "  {results} result(s)");
                let Some(plugin) = service
                    .registry()
                    .plugins()
                    .iter()
                    .find(|plugin| plugin.config().name == outcome.plugin)
                else {
                    continue;
                };
                let Some(method) = plugin.config().method_key() else {
                    continue;
                };

                for assessment in publisher.assessments(&summary.patient_id, &method) {
                    let score = assessment
                        .basis
                        .first()
                        .and_then(|basis| basis.reference.rsplit('/').next())
                        .and_then(|id| id.parse().ok())
                        .and_then(|id| service.pie(&id).ok())
                        .map(|pie| pie.total_values());
                    let prediction = assessment
                        .prediction
                        .first()
                        .and_then(|prediction| prediction.probability_decimal)
                        .map_or_else(|| "-".to_string(), |value| format!("{value:.1}"));
                    let marker = if assessment.is_most_recent() {
                        "  (most recent)"
                    } else {
                        ""
                    };
                    let _ = writeln!(
                        out,
                        "  {}  score {:>2}  prediction {:>5}{}",
                        assessment.date.date_naive(),
                        score.map_or_else(|| "?".to_string(), |score| score.to_string()),
                        prediction,
                        marker
                    );
                }
            }
        }
    }

    out
}
