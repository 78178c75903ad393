//! The Aggregated Discovery Service served to mesh proxies.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod arbiter;
pub mod metrics;
mod pool;
mod response;
mod server;
mod stream;
pub mod validate;

pub use self::{
    metrics::{GrpcServerMetricsFamily, XdsMetrics},
    pool::{Done, PoolClosed, WorkerPool},
    server::{AdsServer, StreamError},
    validate::{PeerCertificate, PeerValidationError, TrustDomainValidator, ValidatePeer},
};
