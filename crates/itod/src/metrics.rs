//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  Liveness probe (always 200 if process is running)
//!   GET /readyz   Readiness probe (200 if the report index is reachable)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use ito_sync::SchedulerStats;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::{counter::Counter, family::Family, gauge::Gauge};
use prometheus_client::registry::Registry;
use std::sync::Arc;

type Labels = Vec<(String, String)>;

/// Daemon counters. Scheduler-side counts live in `SchedulerStats` and are
/// copied in at scrape time.
#[derive(Default)]
pub struct Metrics {
    pub tcns_generated: Counter,
    pub ratchet_persist_failures: Counter,
    pub beacons_ingested: Family<Labels, Counter>,
    pub sessions_flushed: Counter,
    pub reports_fetched: Counter,
    pub publish: Family<Labels, Counter>,
    pub open_sessions: Gauge,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Arc<Self> {
        let metrics = Self::default();
        // prometheus-client appends `_total` to counters
        registry.register(
            "ito_tcns_generated",
            "TCNs derived and handed to the advertiser",
            metrics.tcns_generated.clone(),
        );
        registry.register(
            "ito_ratchet_persist_failures",
            "Ticks whose ratchet state could not be persisted",
            metrics.ratchet_persist_failures.clone(),
        );
        registry.register(
            "ito_beacons_ingested",
            "Observed beacons by ingest outcome",
            metrics.beacons_ingested.clone(),
        );
        registry.register(
            "ito_sessions_flushed",
            "Contact sessions written to the record store",
            metrics.sessions_flushed.clone(),
        );
        registry.register(
            "ito_reports_fetched",
            "New reports stored from the report index",
            metrics.reports_fetched.clone(),
        );
        registry.register(
            "ito_publish",
            "Publish requests by outcome",
            metrics.publish.clone(),
        );
        registry.register(
            "ito_open_sessions",
            "Contact sessions currently open in the cache",
            metrics.open_sessions.clone(),
        );
        Arc::new(metrics)
    }

    pub fn record_ingest(&self, outcome: &str) {
        self.beacons_ingested
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .inc();
    }

    pub fn record_publish(&self, outcome: &str) {
        self.publish
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .inc();
    }

    /// Bring the scheduler counters up to date.
    pub fn sync_scheduler(&self, stats: &SchedulerStats) {
        catch_up(&self.tcns_generated, stats.tcns_generated());
        catch_up(&self.ratchet_persist_failures, stats.persist_failures());
    }
}

fn catch_up(counter: &Counter, total: u64) {
    let seen = counter.get();
    if total > seen {
        counter.inc_by(total - seen);
    }
}

/// Shared health state updated by the daemon
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
    pub scheduler: Arc<SchedulerStats>,
    pub operator: opendal::Operator,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9464")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    state.metrics.sync_scheduler(&state.scheduler);

    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match ito_storage::check_health(&state.operator).await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "report index unreachable"),
    }
}
