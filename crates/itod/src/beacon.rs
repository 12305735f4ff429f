//! Advertiser and proximity listener backed by the daemon's own state.
//!
//! The platform Bluetooth stack lives outside the daemon. It polls the
//! `CurrentBeacon` RPC for the payload to broadcast and feeds scan results
//! back through `SubmitObservation`.

use ito_core::ItoResult;
use ito_sync::{Advertiser, ProximityEstimate, ProximityListener};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Latest payload handed over by the scheduler, `None` while halted.
#[derive(Clone, Default)]
pub struct BeaconSlot {
    payload: Arc<RwLock<Option<Vec<u8>>>>,
}

impl BeaconSlot {
    pub fn current(&self) -> Option<Vec<u8>> {
        self.payload
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Advertiser for BeaconSlot {
    fn advertise(&mut self, payload: &[u8]) -> ItoResult<()> {
        *self.payload.write().unwrap_or_else(PoisonError::into_inner) = Some(payload.to_vec());
        Ok(())
    }

    fn halt(&mut self) {
        *self.payload.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub struct LogProximity;

impl ProximityListener for LogProximity {
    fn on_proximity(&self, estimate: &ProximityEstimate) {
        debug!(
            tcn = %estimate.tcn,
            rssi = estimate.rssi,
            distance_m = estimate.distance_m,
            "peer in range"
        );
    }
}
