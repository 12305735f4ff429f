//! Daemon lifecycle: startup, health checks, systemd notify, gRPC server

use anyhow::{Context, Result};
use ito_core::config::{ItoConfig, StorageBackend};
use ito_storage::ReportBoard;
use ito_sync::{
    BeaconScheduler, CacheConfig, ContactCache, DisclosureConfig, DisclosureTask, ExposureConfig,
    ExposureTracker, SchedulerConfig, StoreBackend,
};
use prometheus_client::registry::Registry;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::beacon::{BeaconSlot, LogProximity};
use crate::grpc::ItoDaemonImpl;
use crate::metrics::{HealthState, Metrics};
use crate::service::TracingService;

struct S3Credentials {
    access_key_id: String,
    secret_access_key: SecretString,
}

fn load_credentials() -> Option<S3Credentials> {
    let access_key_id = std::env::var("ITO_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("AWS_ACCESS_KEY_ID"))
        .ok()?;
    let secret = std::env::var("ITO_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("AWS_SECRET_ACCESS_KEY"))
        .ok()?;
    Some(S3Credentials {
        access_key_id,
        secret_access_key: SecretString::from(secret),
    })
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

async fn build_board(config: &ItoConfig) -> Result<ReportBoard> {
    let op = match (&config.storage.backend, load_credentials()) {
        (StorageBackend::S3, Some(creds)) => ito_storage::build_index_operator(
            &config.storage,
            &creds.access_key_id,
            creds.secret_access_key.expose_secret(),
        )?,
        (StorageBackend::S3, None) => {
            warn!("no S3 credentials in environment, report index access is anonymous");
            ito_storage::build_index_operator(&config.storage, "", "")?
        }
        (StorageBackend::Memory, _) => ito_storage::build_index_operator(&config.storage, "", "")?,
    };

    match ito_storage::check_health(&op).await {
        Ok(()) => info!(endpoint = %config.storage.endpoint, "report index: connected"),
        // Still keep the operator; the maintenance loop retries
        Err(e) => warn!(endpoint = %config.storage.endpoint, "report index: {e}"),
    }
    Ok(ReportBoard::new(op, &config.storage.prefix).with_lookback(config.storage.fetch_lookback()))
}

pub async fn run(config: ItoConfig) -> Result<()> {
    info!("daemon starting");
    config.validate().context("invalid configuration")?;

    let store_path = expand_tilde(&config.store.path);
    let store = Arc::new(
        StoreBackend::open(&store_path)
            .with_context(|| format!("opening record store {}", store_path.display()))?,
    );
    info!(backend = store.kind(), path = %store_path.display(), "record store opened");

    let board = build_board(&config).await?;

    let mut registry = Registry::default();
    let metrics = Metrics::register(&mut registry);
    let registry = Arc::new(registry);

    let cache = Arc::new(ContactCache::new(
        store.clone(),
        CacheConfig::from(&config.cache),
    ));
    cache.set_proximity_listener(Arc::new(LogProximity));
    let tracker = ExposureTracker::new(
        store.clone(),
        cache.clone(),
        ExposureConfig::from(&config.exposure),
    );
    let disclosure = Arc::new(DisclosureTask::new(
        store.clone(),
        Arc::new(board.clone()),
        DisclosureConfig::from(&config.ratchet),
    ));

    let beacon = BeaconSlot::default();
    let scheduler = BeaconScheduler::new(
        store.clone(),
        beacon.clone(),
        SchedulerConfig::from_config(&config.ratchet, &config.store),
    );
    let scheduler_stats = scheduler.stats();
    let (scheduler, scheduler_task) = scheduler.spawn();
    scheduler
        .start()
        .await
        .context("starting beacon scheduler")?;

    let service = Arc::new(TracingService::new(
        &config,
        store,
        cache,
        tracker,
        disclosure,
        board.clone(),
        scheduler.clone(),
        beacon,
        metrics.clone(),
    ));

    // Start Prometheus metrics endpoint
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry,
            metrics,
            scheduler: scheduler_stats,
            operator: board.operator().clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let maintenance = tokio::spawn(service.clone().run_maintenance(shutdown_tx.subscribe()));

    // Send systemd ready notification
    notify_ready();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let socket_path = config.daemon.socket.clone();
    let impl_ = ItoDaemonImpl::new(service.clone());

    let served = tokio::select! {
        res = crate::grpc::serve(&socket_path, impl_) => res,
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(());
    if let Err(e) = maintenance.await {
        warn!("maintenance task ended abnormally: {e}");
    }
    service.shutdown().await;
    scheduler.shutdown().await;
    if let Err(e) = scheduler_task.await {
        warn!("scheduler task ended abnormally: {e}");
    }

    if socket_path.exists() {
        let _ = tokio::fs::remove_file(&socket_path).await;
    }
    info!("daemon stopped");
    served
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
