pub mod config;
pub mod error;
pub mod types;

pub use error::{ItoError, ItoResult};
pub use types::{now_ms, ObservedBeacon, Tcn, TCN_LENGTH};

/// Generated gRPC types and service traits (from ito.proto)
pub mod proto {
    tonic::include_proto!("ito");
}
