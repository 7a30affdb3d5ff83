use crate::cli::ServeArgs;
use crate::infra::{
    AppState, FhirHttpClient, FhirHttpPublisher, FhirHttpSource, InMemoryPieStore,
};
use crate::routes::with_risk_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use riskservice::config::AppConfig;
use riskservice::error::AppError;
use riskservice::plugins::PluginRegistry;
use riskservice::scheduler::FunctionDelayer;
use riskservice::service::{RiskRouterState, RiskService};
use riskservice::telemetry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let http = FhirHttpClient::new(&config.risk.fhir_endpoint, Handle::current())?;
    let service = Arc::new(RiskService::new(
        Arc::new(FhirHttpSource::new(http.clone())),
        Arc::new(InMemoryPieStore::default()),
        Arc::new(FhirHttpPublisher::new(http)),
        PluginRegistry::standard()?,
        config.risk.basis_pie_url.clone(),
    ));
    let plugins: Vec<&str> = service
        .registry()
        .plugins()
        .iter()
        .map(|plugin| plugin.config().name.as_str())
        .collect();
    info!(?plugins, "risk plugins registered");
    let delayer = FunctionDelayer::new(config.risk.debounce);

    let app = with_risk_routes(RiskRouterState {
        service,
        delayer: delayer.clone(),
        upstream: config.risk.fhir_endpoint.clone(),
    })
    .layer(Extension(app_state))
    .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        fhir_endpoint = %config.risk.fhir_endpoint,
        debounce_ms = config.risk.debounce.as_millis() as u64,
        "risk service ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(drain_on_interrupt(
            readiness_flag,
            delayer,
            config.risk.shutdown_grace,
        ))
        .await?;
    Ok(())
}

/// Waits for Ctrl-C, then lets pending recalculations finish before the server stops.
async fn drain_on_interrupt(
    readiness: Arc<AtomicBool>,
    delayer: FunctionDelayer,
    grace: Duration,
) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }

    readiness.store(false, Ordering::Release);
    info!(pending = delayer.pending(), "shutting down, draining recalculations");
    delayer.shutdown(grace).await;
    info!("recalculations drained");
}
