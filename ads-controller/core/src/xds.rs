use std::{fmt, str::FromStr};

/// The xDS resource types served over the aggregated stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Cds,
    Eds,
    Lds,
    Rds,
    Sds,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown xDS type URL: {0:?}")]
pub struct UnknownTypeUrl(pub String);

// === impl ResourceType ===

impl ResourceType {
    pub const ALL: [Self; 5] = [Self::Cds, Self::Eds, Self::Lds, Self::Rds, Self::Sds];

    /// Types pushed to a proxy when mesh configuration changes, in push order.
    ///
    /// Secrets are never pushed on a configuration change: the proxy pulls them, and they are
    /// pushed only when its own certificate rotates.
    pub const PROXY_UPDATE: [Self; 4] = [Self::Cds, Self::Eds, Self::Lds, Self::Rds];

    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Cds => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            Self::Eds => "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment",
            Self::Lds => "type.googleapis.com/envoy.config.listener.v3.Listener",
            Self::Rds => "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
            Self::Sds => "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret",
        }
    }

    /// Envoy always requests clusters and listeners without naming resources.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Cds | Self::Lds)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cds => "CDS",
            Self::Eds => "EDS",
            Self::Lds => "LDS",
            Self::Rds => "RDS",
            Self::Sds => "SDS",
        }
    }
}

impl FromStr for ResourceType {
    type Err = UnknownTypeUrl;

    fn from_str(type_url: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.type_url() == type_url)
            .ok_or_else(|| UnknownTypeUrl(type_url.to_string()))
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
