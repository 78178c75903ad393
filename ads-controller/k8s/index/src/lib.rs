//! An index of meshed pods, fed by a Kubernetes watch.
//!
//! The sidecar injector labels every meshed pod with the UUID that is also embedded in its proxy's
//! certificate common name. Connecting proxies are resolved to their pods through this label so
//! that the pod's service account can be checked against the certificate.
//!
//! The index also turns pod changes into broker events:
//!
//! - a deleted pod publishes a pod-deleted event, so that its proxy's certificate may be released;
//! - a change to a pod's metrics scrape annotation announces an update to that pod's proxy.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod pod;


pub use self::pod::{PodIndex, PodLookup, SharedIndex, SCRAPE_ANNOTATION};
