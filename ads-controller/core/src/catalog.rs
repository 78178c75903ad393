//! Collaborators that supply the resources served to proxies.

use crate::{
    broker::{Broker, CertificateRotated},
    CommonName, Proxy, ResourceType, ServiceIdentity,
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// A named, protobuf-encoded xDS resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub body: Bytes,
}

/// Supplies the resources of a type that a proxy should receive.
#[async_trait::async_trait]
pub trait Catalog {
    /// Returns the resources of type `ty` for `proxy`.
    ///
    /// `names` is the set of resource names the proxy subscribed to. It is empty for wildcard
    /// types and when the proxy has not named any resources.
    async fn resources(
        &self,
        proxy: &Proxy,
        ty: ResourceType,
        names: &BTreeSet<String>,
    ) -> Result<Vec<Resource>>;
}

/// Releases the certificate issued to a proxy once the proxy's workload is gone.
pub trait ReleaseCertificate {
    fn release_certificate(&self, cn: &CommonName);
}

/// An in-memory catalog holding the current set of resources of each type.
#[derive(Clone, Debug)]
pub struct SnapshotCatalog {
    inner: Arc<RwLock<Snapshot>>,
    broker: Broker,
    trust_domain: Arc<str>,
}

#[derive(Debug, Default)]
struct Snapshot {
    resources: HashMap<ResourceType, BTreeMap<String, Bytes>>,
    identity_secrets: HashMap<ServiceIdentity, BTreeMap<String, Bytes>>,
    proxy_secrets: HashMap<CommonName, BTreeMap<String, Bytes>>,
}

// === impl SnapshotCatalog ===

impl SnapshotCatalog {
    pub fn new(broker: Broker, trust_domain: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Default::default(),
            broker,
            trust_domain: trust_domain.into(),
        }
    }

    /// Replaces all resources of a non-secret type and announces an update to all proxies.
    pub fn set_resources(&self, ty: ResourceType, resources: impl IntoIterator<Item = Resource>) {
        if ty == ResourceType::Sds {
            tracing::warn!("Secrets must be set per identity");
            return;
        }
        let resources = by_name(resources);
        tracing::debug!(%ty, resources = resources.len(), "Updated resources");
        self.inner.write().resources.insert(ty, resources);
        self.broker.announce_all();
    }

    /// Replaces the secrets served to proxies of a service identity and announces the rotation.
    pub fn set_secrets(
        &self,
        identity: ServiceIdentity,
        secrets: impl IntoIterator<Item = Resource>,
    ) {
        let cn = identity.common_name(&self.trust_domain);
        self.inner
            .write()
            .identity_secrets
            .insert(identity, by_name(secrets));
        self.broker
            .publish_certificate_rotated(CertificateRotated { cn, serial: None });
    }

    /// Replaces the secrets served to a single proxy and announces the rotation.
    pub fn set_proxy_secrets(&self, cn: CommonName, secrets: impl IntoIterator<Item = Resource>) {
        self.inner
            .write()
            .proxy_secrets
            .insert(cn.clone(), by_name(secrets));
        self.broker
            .publish_certificate_rotated(CertificateRotated { cn, serial: None });
    }

    fn select(
        resources: Option<&BTreeMap<String, Bytes>>,
        ty: ResourceType,
        names: &BTreeSet<String>,
    ) -> Vec<Resource> {
        let Some(resources) = resources else {
            return vec![];
        };
        resources
            .iter()
            .filter(|(name, _)| ty.is_wildcard() || names.is_empty() || names.contains(*name))
            .map(|(name, body)| Resource {
                name: name.clone(),
                body: body.clone(),
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Catalog for SnapshotCatalog {
    async fn resources(
        &self,
        proxy: &Proxy,
        ty: ResourceType,
        names: &BTreeSet<String>,
    ) -> Result<Vec<Resource>> {
        let snapshot = self.inner.read();
        if ty != ResourceType::Sds {
            return Ok(Self::select(snapshot.resources.get(&ty), ty, names));
        }

        // Secrets issued to the proxy itself take precedence over its identity's secrets.
        let mut secrets = snapshot
            .identity_secrets
            .get(&proxy.identity().service)
            .cloned()
            .unwrap_or_default();
        if let Some(own) = snapshot.proxy_secrets.get(proxy.common_name()) {
            secrets.extend(own.iter().map(|(n, b)| (n.clone(), b.clone())));
        }
        Ok(Self::select(Some(&secrets), ty, names))
    }
}

impl ReleaseCertificate for SnapshotCatalog {
    fn release_certificate(&self, cn: &CommonName) {
        if self.inner.write().proxy_secrets.remove(cn).is_some() {
            tracing::debug!(%cn, "Released proxy certificate");
        }
    }
}

fn by_name(resources: impl IntoIterator<Item = Resource>) -> BTreeMap<String, Bytes> {
    resources.into_iter().map(|r| (r.name, r.body)).collect()
}
