//! Decides how to answer each discovery request on an ADS stream.
//!
//! Every response carries a fresh nonce, and a proxy echoes the nonce of the last response it
//! processed. At most one response per type is outstanding: until the proxy echoes the latest
//! nonce, further requests for that type are stale and go unanswered.

use envoy_types::pb::envoy::service::discovery::v3::DiscoveryRequest;
use mesh_ads_controller_core::{ResourceType, Session};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

/// The outcome of a discovery request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The request could not be interpreted.
    Invalid,

    /// The proxy rejected the last response of this type.
    Nack(ResourceType),

    /// The request does not acknowledge the latest response of this type.
    Stale(ResourceType),

    /// The proxy applied the latest response of this type.
    Ack(ResourceType),

    /// The first request for this type on the stream.
    Subscribe(ResourceType),

    /// The proxy holds configuration issued by another control plane instance.
    Reconnect(ResourceType),

    /// The proxy acknowledged the latest response but changed the resources it requests.
    Resubscribe(ResourceType),
}

// === impl Decision ===

impl Decision {
    /// Returns true if a response must be sent for the request.
    pub fn must_respond(&self) -> bool {
        matches!(
            self,
            Self::Subscribe(_) | Self::Reconnect(_) | Self::Resubscribe(_)
        )
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        match *self {
            Self::Invalid => None,
            Self::Nack(ty)
            | Self::Stale(ty)
            | Self::Ack(ty)
            | Self::Subscribe(ty)
            | Self::Reconnect(ty)
            | Self::Resubscribe(ty) => Some(ty),
        }
    }
}

/// Updates the session with a discovery request and decides whether it must be answered.
pub fn respond_to_request(session: &Session, req: &DiscoveryRequest) -> Decision {
    if req.type_url.is_empty() {
        warn!("Ignoring discovery request without a type URL");
        return Decision::Invalid;
    }

    let ty = match req.type_url.parse::<ResourceType>() {
        Ok(ty) => ty,
        Err(error) => {
            warn!(%error, "Ignoring discovery request");
            return Decision::Invalid;
        }
    };

    let version = if req.version_info.is_empty() {
        0
    } else {
        match req.version_info.parse::<u64>() {
            Ok(v) => v,
            Err(error) => {
                warn!(%ty, version = %req.version_info, %error, "Ignoring discovery request with an invalid version");
                return Decision::Invalid;
            }
        }
    };

    if let Some(status) = &req.error_detail {
        warn!(
            %ty,
            version,
            nonce = %req.response_nonce,
            code = status.code,
            message = %status.message,
            "Proxy rejected configuration"
        );
        return Decision::Nack(ty);
    }

    let requested = req.resource_names.iter().cloned().collect::<BTreeSet<_>>();

    if req.response_nonce.is_empty() {
        debug!(%ty, resources = requested.len(), "Proxy subscribed");
        session.set_subscribed_resources(ty, requested);
        return Decision::Subscribe(ty);
    }

    let last_nonce = session.last_sent_nonce(ty);
    if last_nonce.is_empty() {
        debug!(
            %ty,
            version,
            nonce = %req.response_nonce,
            "Proxy was configured by another control plane instance"
        );
        session.set_last_sent_version(ty, version);
        session.set_last_applied_version(ty, version);
        session.set_subscribed_resources(ty, requested);
        return Decision::Reconnect(ty);
    }

    if req.response_nonce != last_nonce {
        trace!(%ty, nonce = %req.response_nonce, expected = %last_nonce, "Ignoring stale request");
        return Decision::Stale(ty);
    }

    session.set_last_applied_version(ty, version);
    if ty.is_wildcard() {
        trace!(%ty, version, "Proxy acknowledged configuration");
        return Decision::Ack(ty);
    }

    if requested != session.subscribed_resources(ty) {
        debug!(%ty, resources = requested.len(), "Proxy changed its subscription");
        session.set_subscribed_resources(ty, requested);
        return Decision::Resubscribe(ty);
    }

    trace!(%ty, version, "Proxy acknowledged configuration");
    Decision::Ack(ty)
}
