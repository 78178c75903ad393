//! Core types for the Aggregated Discovery Service control plane.
//!
//! Each connected Envoy proxy is modeled as a [`Proxy`], which owns a [`Session`] describing what
//! the control plane has offered to the proxy and what the proxy has acknowledged, per xDS
//! resource type. Connected proxies are tracked in the process-wide [`registry::ProxyRegistry`].
//!
//! The control plane reacts to three event sources, all delivered through the [`broker::Broker`]:
//!
//! - proxy update announcements (broadcast to all proxies or targeted at a single proxy);
//! - certificate rotations;
//! - pod deletions, which release the certificates of the proxies that fronted them.
//!
//! ```text
//! [ Catalog ] --resources--> [ response job ] --DiscoveryResponse--> [ Proxy ]
//!      |                                                                 |
//!      +--announcements--> [ Broker ] --updates/rotations--> [ stream loop ]
//! ```
//!
//! Resource generation itself is behind the [`catalog::Catalog`] trait.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod broker;
pub mod catalog;
pub mod identity;
pub mod pod;
mod proxy;
pub mod registry;
mod session;
mod xds;

pub use self::{
    identity::{CommonName, CommonNameError, ProxyIdentity, ProxyKind, SerialNumber, ServiceIdentity},
    proxy::Proxy,
    session::Session,
    xds::{ResourceType, UnknownTypeUrl},
};
pub use uuid::Uuid;

/// The label set by the sidecar injector on every meshed pod. Its value is the UUID embedded in
/// the proxy's certificate common name.
pub const PROXY_UUID_LABEL: &str = "osm-proxy-uuid";
