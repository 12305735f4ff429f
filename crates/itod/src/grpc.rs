//! tonic gRPC server over Unix domain socket

use anyhow::Result;
use ito_sync::PublishOutcome;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use ito_core::proto::{
    ito_daemon_server::{ItoDaemon, ItoDaemonServer},
    *,
};
use ito_core::ItoError;

use crate::service::TracingService;

/// Implementation of the ItoDaemon gRPC service
pub struct ItoDaemonImpl {
    service: Arc<TracingService>,
    start_time: std::time::Instant,
}

impl ItoDaemonImpl {
    pub fn new(service: Arc<TracingService>) -> Self {
        Self {
            service,
            start_time: std::time::Instant::now(),
        }
    }
}

fn to_status(e: ItoError) -> tonic::Status {
    match e {
        ItoError::Config(_) => tonic::Status::invalid_argument(e.to_string()),
        e if e.is_transient() => tonic::Status::unavailable(e.to_string()),
        e => tonic::Status::internal(e.to_string()),
    }
}

#[tonic::async_trait]
impl ItoDaemon for ItoDaemonImpl {
    async fn status(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<tonic::Response<StatusResponse>, tonic::Status> {
        let report_index_ok = ito_storage::is_healthy(self.service.board.operator()).await;
        Ok(tonic::Response::new(StatusResponse {
            version: env!("CARGO_PKG_VERSION").into(),
            tracing_running: self.service.is_running().await,
            report_index_ok,
            open_sessions: u32::try_from(self.service.cache.open_sessions()).unwrap_or(u32::MAX),
            uptime_secs: self.start_time.elapsed().as_secs() as i64,
        }))
    }

    async fn publish(
        &self,
        request: tonic::Request<PublishRequest>,
    ) -> Result<tonic::Response<PublishResponse>, tonic::Status> {
        let req = request.into_inner();
        info!(from_ms = req.from_ms, to_ms = req.to_ms, "publish requested");

        // Publish failures are an expected outcome, reported in the body
        let resp = match self.service.publish(req.from_ms, req.to_ms).await {
            Ok(PublishOutcome::Published {
                reports, purged, ..
            }) => PublishResponse {
                success: true,
                reports: u32::try_from(reports).unwrap_or(u32::MAX),
                purged,
                error: String::new(),
            },
            Ok(PublishOutcome::NothingToPublish) => PublishResponse {
                success: true,
                reports: 0,
                purged: false,
                error: String::new(),
            },
            Err(e) => {
                warn!("publish failed: {e}");
                PublishResponse {
                    success: false,
                    reports: 0,
                    purged: false,
                    error: e.to_string(),
                }
            }
        };
        Ok(tonic::Response::new(resp))
    }

    async fn is_possibly_infected(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<tonic::Response<InfectionResponse>, tonic::Status> {
        let (possibly_infected, exposure) = self.service.exposure().map_err(to_status)?;
        Ok(tonic::Response::new(InfectionResponse {
            possibly_infected,
            exposure_ms: exposure.as_millis() as u64,
        }))
    }

    async fn latest_fetch_checkpoint(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<tonic::Response<CheckpointResponse>, tonic::Status> {
        let checkpoint = self.service.fetch_checkpoint().map_err(to_status)?;
        Ok(tonic::Response::new(CheckpointResponse { checkpoint }))
    }

    async fn restart_tracing(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<tonic::Response<RestartResponse>, tonic::Status> {
        let running = self.service.restart().await.map_err(to_status)?;
        Ok(tonic::Response::new(RestartResponse { running }))
    }

    async fn submit_observation(
        &self,
        request: tonic::Request<Observation>,
    ) -> Result<tonic::Response<ObservationResponse>, tonic::Status> {
        let obs = request.into_inner();
        let outcome = self
            .service
            .submit_observation(&obs.payload, obs.rssi, obs.observed_at_ms);
        Ok(tonic::Response::new(ObservationResponse {
            outcome: outcome.into(),
        }))
    }

    async fn current_beacon(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<tonic::Response<BeaconResponse>, tonic::Status> {
        let payload = self.service.current_beacon();
        Ok(tonic::Response::new(BeaconResponse {
            advertising: payload.is_some(),
            payload: payload.unwrap_or_default(),
        }))
    }
}

/// Start the gRPC server on a Unix domain socket
pub async fn serve(socket_path: &Path, impl_: ItoDaemonImpl) -> Result<()> {
    // Remove stale socket if it exists
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path).await?;
    }

    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(socket_path)?;
    let stream = UnixListenerStream::new(listener);

    info!(socket = %socket_path.display(), "gRPC server ready");

    Server::builder()
        .add_service(ItoDaemonServer::new(impl_))
        .serve_with_incoming(stream)
        .await
        .map_err(|e| anyhow::anyhow!("gRPC server error: {e}"))
}
