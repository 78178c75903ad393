//! The process-wide set of connected proxies.

use crate::{
    broker::{PodDeleted, Subscription},
    catalog::ReleaseCertificate,
    pod::PodMetadata,
    CommonName, Proxy,
};
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};

pub mod metrics;

/// Tracks connected proxies by certificate common name.
///
/// Disconnected proxies are remembered for a bounded time for diagnostics.
#[derive(Debug)]
pub struct ProxyRegistry {
    inner: RwLock<Inner>,
    disconnected_ttl: chrono::Duration,
}

/// The connection limit was reached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("too many connected proxies (limit {limit})")]
pub struct ConnectionLimitReached {
    pub limit: usize,
}

#[derive(Debug, Default)]
struct Inner {
    connected: HashMap<CommonName, Arc<Proxy>>,
    disconnected: HashMap<CommonName, DateTime<Utc>>,
    by_pod_uid: HashMap<String, CommonName>,
}

// === impl ProxyRegistry ===

impl ProxyRegistry {
    pub fn new(disconnected_ttl: Duration) -> Self {
        Self {
            inner: Default::default(),
            disconnected_ttl: chrono::Duration::from_std(disconnected_ttl)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Records a newly connected proxy, replacing any earlier connection with the same common
    /// name.
    pub fn register_proxy(&self, proxy: Arc<Proxy>) {
        Self::insert(&mut self.inner.write(), proxy);
    }

    /// Records a newly connected proxy unless `limit` proxies are already connected. Zero
    /// disables the limit. A proxy replacing an earlier connection with the same common name is
    /// always admitted.
    pub fn try_register_proxy(
        &self,
        proxy: Arc<Proxy>,
        limit: usize,
    ) -> Result<(), ConnectionLimitReached> {
        let mut inner = self.inner.write();
        if limit > 0
            && inner.connected.len() >= limit
            && !inner.connected.contains_key(proxy.common_name())
        {
            return Err(ConnectionLimitReached { limit });
        }
        Self::insert(&mut inner, proxy);
        Ok(())
    }

    fn insert(inner: &mut Inner, proxy: Arc<Proxy>) {
        let cn = proxy.common_name().clone();
        inner.disconnected.remove(&cn);
        if inner.connected.insert(cn.clone(), proxy).is_some() {
            tracing::debug!(%cn, "Replaced existing connection");
        }
        if let Some(uid) = inner.connected.get(&cn).and_then(|p| p.pod()).map(|p| p.uid) {
            inner.by_pod_uid.insert(uid, cn);
        }
    }

    /// Attaches pod metadata to a proxy and indexes the proxy by pod UID.
    pub fn set_pod(&self, proxy: &Proxy, pod: PodMetadata) {
        let uid = pod.uid.clone();
        proxy.set_pod(pod);
        self.inner
            .write()
            .by_pod_uid
            .insert(uid, proxy.common_name().clone());
    }

    /// Removes a proxy's connection.
    ///
    /// Returns false if the registered connection for the proxy's common name is a different,
    /// newer connection, which is left in place.
    pub fn unregister_proxy(&self, proxy: &Arc<Proxy>) -> bool {
        let cn = proxy.common_name();
        let now = Utc::now();
        let mut inner = self.inner.write();
        match inner.connected.get(cn) {
            Some(current) if Arc::ptr_eq(current, proxy) => {}
            _ => return false,
        }
        inner.connected.remove(cn);
        inner.disconnected.insert(cn.clone(), now);
        self.prune(&mut inner, now);
        true
    }

    fn prune(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let ttl = self.disconnected_ttl;
        let before = inner.disconnected.len();
        inner
            .disconnected
            .retain(|_, at| now.signed_duration_since(*at) < ttl);
        if inner.disconnected.len() == before {
            return;
        }
        tracing::debug!(
            pruned = before - inner.disconnected.len(),
            "Pruned disconnected proxies"
        );
        let Inner {
            connected,
            disconnected,
            by_pod_uid,
        } = inner;
        by_pod_uid.retain(|_, cn| connected.contains_key(cn) || disconnected.contains_key(cn));
    }

    pub fn get(&self, cn: &CommonName) -> Option<Arc<Proxy>> {
        self.inner.read().connected.get(cn).cloned()
    }

    pub fn connected_proxies(&self) -> Vec<Arc<Proxy>> {
        self.inner.read().connected.values().cloned().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.inner.read().connected.len()
    }

    pub fn disconnected_proxies(&self) -> Vec<(CommonName, DateTime<Utc>)> {
        self.inner
            .read()
            .disconnected
            .iter()
            .map(|(cn, at)| (cn.clone(), *at))
            .collect()
    }

    pub fn proxy_for_pod_uid(&self, uid: &str) -> Option<CommonName> {
        self.inner.read().by_pod_uid.get(uid).cloned()
    }

    /// Forgets a pod, returning the common name of the proxy that fronted it.
    pub fn remove_pod(&self, uid: &str) -> Option<CommonName> {
        self.inner.write().by_pod_uid.remove(uid)
    }

    /// Releases the certificates of proxies whose pods are deleted. Runs until the broker shuts
    /// down.
    pub async fn release_certificates<R>(
        self: Arc<Self>,
        mut deletions: Subscription<PodDeleted>,
        certificates: R,
    ) where
        R: ReleaseCertificate,
    {
        while let Some(PodDeleted {
            uid,
            namespace,
            name,
        }) = deletions.recv().await
        {
            match self.remove_pod(&uid) {
                Some(cn) => {
                    tracing::info!(%namespace, pod = %name, %cn, "Releasing certificate of deleted pod");
                    certificates.release_certificate(&cn);
                }
                None => {
                    tracing::debug!(%namespace, pod = %name, "Deleted pod has no known proxy");
                }
            }
        }
        tracing::debug!("Pod deletion subscription closed");
    }
}
