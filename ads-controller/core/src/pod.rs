use crate::{ProxyIdentity, ServiceIdentity};

/// Metadata about the pod backing a connected proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodMetadata {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub service_account: String,
}

/// Resolves the pod backing a proxy.
///
/// Returns `Ok(None)` when no pod carries the proxy's UUID (e.g. for gateways running outside the
/// cluster).
pub trait LookupPod {
    fn lookup_pod(&self, proxy: &ProxyIdentity) -> anyhow::Result<Option<PodMetadata>>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("proxy certificate identity {certificate} does not match pod {namespace}/{name} identity {pod}")]
pub struct IdentityMismatch {
    pub certificate: ServiceIdentity,
    pub pod: ServiceIdentity,
    pub namespace: String,
    pub name: String,
}

/// A lookup that never finds a pod.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoPods;

// === impl PodMetadata ===

impl PodMetadata {
    pub fn service_identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            service_account: self.service_account.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Verifies that the proxy's certificate was issued to the pod's service account.
    pub fn check_identity(&self, proxy: &ProxyIdentity) -> Result<(), IdentityMismatch> {
        let pod = self.service_identity();
        if pod == proxy.service {
            return Ok(());
        }
        Err(IdentityMismatch {
            certificate: proxy.service.clone(),
            pod,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        })
    }
}

// === impl NoPods ===

impl LookupPod for NoPods {
    fn lookup_pod(&self, _: &ProxyIdentity) -> anyhow::Result<Option<PodMetadata>> {
        Ok(None)
    }
}
