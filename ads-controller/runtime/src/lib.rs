#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_ads_controller_core as core;
pub use mesh_ads_controller_grpc as grpc;
pub use mesh_ads_controller_k8s_index as index;

mod args;
mod tls;

pub use self::args::Args;
