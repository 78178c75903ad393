//! Proxy identities derived from certificate common names.
//!
//! A proxy certificate's common name has the form
//! `<proxy-uuid>.<proxy-kind>.<service-account>.<namespace>.<trust-domain>`.

use std::{fmt, str::FromStr, sync::Arc};
use uuid::Uuid;

/// The common name of a proxy's certificate. Used as the registry key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommonName(Arc<str>);

/// The hex-encoded serial number of a proxy's certificate.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SerialNumber(Arc<str>);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Sidecar,
    Gateway,
}

/// A Kubernetes service account, `<service-account>.<namespace>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    pub service_account: String,
    pub namespace: String,
}

/// The identity encoded in a proxy certificate's common name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyIdentity {
    pub uuid: Uuid,
    pub kind: ProxyKind,
    pub service: ServiceIdentity,
    pub trust_domain: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommonNameError {
    #[error("common name {0:?} has too few components")]
    TooFewComponents(String),

    #[error("common name {cn:?} has an empty {component} component")]
    EmptyComponent {
        cn: String,
        component: &'static str,
    },

    #[error("common name {cn:?} has an invalid proxy UUID: {source}")]
    InvalidUuid {
        cn: String,
        #[source]
        source: uuid::Error,
    },

    #[error("common name {cn:?} has an unknown proxy kind {kind:?}")]
    UnknownKind { cn: String, kind: String },
}

// === impl CommonName ===

impl CommonName {
    pub fn new(cn: impl Into<Arc<str>>) -> Self {
        Self(cn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CommonName {
    fn from(cn: &str) -> Self {
        Self::new(cn)
    }
}

impl From<String> for CommonName {
    fn from(cn: String) -> Self {
        Self::new(cn)
    }
}

impl fmt::Display for CommonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl SerialNumber ===

impl SerialNumber {
    pub fn new(serial: impl Into<Arc<str>>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl ProxyKind ===

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sidecar => "sidecar",
            Self::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ServiceIdentity ===

impl ServiceIdentity {
    /// The common name of this identity's service certificate.
    pub fn common_name(&self, trust_domain: &str) -> CommonName {
        CommonName::from(format!("{self}.{trust_domain}"))
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_account, self.namespace)
    }
}

// === impl ProxyIdentity ===

impl ProxyIdentity {
    pub fn parse(cn: &CommonName) -> Result<Self, CommonNameError> {
        cn.as_str().parse()
    }

    /// Returns true if a service certificate with the given common name was issued to this
    /// proxy's service identity. Service certificate common names have the form
    /// `<service-account>.<namespace>.<trust-domain>`.
    pub fn owns_certificate(&self, cn: &CommonName) -> bool {
        let parts = cn.as_str().split('.').collect::<Vec<_>>();
        parts.len() >= 3
            && parts[0] == self.service.service_account
            && parts[1] == self.service.namespace
    }
}

impl FromStr for ProxyIdentity {
    type Err = CommonNameError;

    fn from_str(cn: &str) -> Result<Self, Self::Err> {
        let parts = cn.splitn(5, '.').collect::<Vec<_>>();
        if parts.len() < 4 {
            return Err(CommonNameError::TooFewComponents(cn.to_string()));
        }

        for (part, component) in parts
            .iter()
            .zip(["proxy UUID", "proxy kind", "service account", "namespace"])
        {
            if part.is_empty() {
                return Err(CommonNameError::EmptyComponent {
                    cn: cn.to_string(),
                    component,
                });
            }
        }

        let uuid = parts[0]
            .parse::<Uuid>()
            .map_err(|source| CommonNameError::InvalidUuid {
                cn: cn.to_string(),
                source,
            })?;

        let kind = match parts[1] {
            "sidecar" => ProxyKind::Sidecar,
            "gateway" => ProxyKind::Gateway,
            kind => {
                return Err(CommonNameError::UnknownKind {
                    cn: cn.to_string(),
                    kind: kind.to_string(),
                })
            }
        };

        Ok(Self {
            uuid,
            kind,
            service: ServiceIdentity {
                service_account: parts[2].to_string(),
                namespace: parts[3].to_string(),
            },
            trust_domain: parts.get(4).filter(|td| !td.is_empty()).map(|td| td.to_string()),
        })
    }
}

impl fmt::Display for ProxyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.uuid, self.kind, self.service)?;
        if let Some(td) = &self.trust_domain {
            write!(f, ".{td}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "0b2c0a1e-6f5e-4e3b-9d39-7f4b2a8c1d10";

    #[test]
    fn parses_sidecar_common_name() {
        let cn = format!("{UUID}.sidecar.bookbuyer.bookstore.cluster.local");
        let id = cn.parse::<ProxyIdentity>().expect("common name must parse");
        assert_eq!(id.uuid, UUID.parse::<Uuid>().unwrap());
        assert_eq!(id.kind, ProxyKind::Sidecar);
        assert_eq!(id.service.service_account, "bookbuyer");
        assert_eq!(id.service.namespace, "bookstore");
        assert_eq!(id.service.to_string(), "bookbuyer.bookstore");
        assert_eq!(id.trust_domain.as_deref(), Some("cluster.local"));
        assert_eq!(id.to_string(), cn);
    }

    #[test]
    fn parses_gateway_without_trust_domain() {
        let id = format!("{UUID}.gateway.ingress.mesh")
            .parse::<ProxyIdentity>()
            .expect("common name must parse");
        assert_eq!(id.kind, ProxyKind::Gateway);
        assert_eq!(id.trust_domain, None);
    }

    #[test]
    fn rejects_malformed_common_names() {
        assert!(matches!(
            "a.b.c".parse::<ProxyIdentity>(),
            Err(CommonNameError::TooFewComponents(_))
        ));
        assert!(matches!(
            format!("{UUID}..sa.ns.cluster.local").parse::<ProxyIdentity>(),
            Err(CommonNameError::EmptyComponent {
                component: "proxy kind",
                ..
            })
        ));
        assert!(matches!(
            "not-a-uuid.sidecar.sa.ns.cluster.local".parse::<ProxyIdentity>(),
            Err(CommonNameError::InvalidUuid { .. })
        ));
        assert!(matches!(
            format!("{UUID}.vm.sa.ns.cluster.local").parse::<ProxyIdentity>(),
            Err(CommonNameError::UnknownKind { .. })
        ));
    }

    #[test]
    fn certificate_ownership() {
        let id = format!("{UUID}.sidecar.bookbuyer.bookstore.cluster.local")
            .parse::<ProxyIdentity>()
            .unwrap();

        assert!(id.owns_certificate(&CommonName::from("bookbuyer.bookstore.cluster.local")));
        assert!(!id.owns_certificate(&CommonName::from("bookthief.bookstore.cluster.local")));
        assert!(!id.owns_certificate(&CommonName::from("bookbuyer.bookstore")));
    }
}
