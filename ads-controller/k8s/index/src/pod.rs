use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{bail, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use mesh_ads_controller_core::{
    broker::{Broker, PodDeleted},
    pod::{LookupPod, PodMetadata},
    ProxyIdentity, Uuid, PROXY_UUID_LABEL,
};
use parking_lot::RwLock;
use std::sync::Arc;

/// Toggles metrics scraping of a pod's proxy, which changes the proxy's configuration.
pub const SCRAPE_ANNOTATION: &str = "prometheus.io/scrape";

pub type SharedIndex = Arc<RwLock<PodIndex>>;

/// Indexes meshed pods by namespace/name and by proxy UUID.
#[derive(Debug)]
pub struct PodIndex {
    broker: Broker,
    pods: HashMap<PodRef, IndexedPod>,
    by_uuid: HashMap<Uuid, HashSet<PodRef>>,
}

/// Resolves connecting proxies to their pods.
#[derive(Clone, Debug)]
pub struct PodLookup(SharedIndex);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PodRef {
    namespace: String,
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct IndexedPod {
    uid: String,
    uuid: Uuid,
    service_account: String,
    scrape: Option<String>,
}

// === impl PodIndex ===

impl PodIndex {
    pub fn shared(broker: Broker) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            broker,
            pods: HashMap::default(),
            by_uuid: HashMap::default(),
        }))
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub(crate) fn namespace_sizes(&self) -> HashMap<String, usize> {
        let mut sizes = HashMap::<String, usize>::default();
        for pod_ref in self.pods.keys() {
            *sizes.entry(pod_ref.namespace.clone()).or_default() += 1;
        }
        sizes
    }

    pub(crate) fn uuid_count(&self) -> usize {
        self.by_uuid.len()
    }

    fn lookup(&self, uuid: &Uuid) -> Result<Option<PodMetadata>> {
        let Some(refs) = self.by_uuid.get(uuid).filter(|refs| !refs.is_empty()) else {
            return Ok(None);
        };
        if refs.len() > 1 {
            let mut pods = refs
                .iter()
                .map(|r| format!("{}/{}", r.namespace, r.name))
                .collect::<Vec<_>>();
            pods.sort();
            bail!("found {} pods with {PROXY_UUID_LABEL}={uuid}: {}", refs.len(), pods.join(", "));
        }

        Ok(refs.iter().next().and_then(|r| {
            let pod = self.pods.get(r)?;
            Some(PodMetadata {
                uid: pod.uid.clone(),
                name: r.name.clone(),
                namespace: r.namespace.clone(),
                service_account: pod.service_account.clone(),
            })
        }))
    }

    fn insert(&mut self, pod_ref: PodRef, pod: IndexedPod) -> Option<IndexedPod> {
        let uuid = pod.uuid;
        let prior = self.pods.insert(pod_ref.clone(), pod);
        if let Some(prior) = prior.as_ref().filter(|p| p.uuid != uuid) {
            self.unlink(&pod_ref, &prior.uuid);
        }
        self.by_uuid.entry(uuid).or_default().insert(pod_ref);
        prior
    }

    fn remove(&mut self, pod_ref: &PodRef) -> Option<IndexedPod> {
        let pod = self.pods.remove(pod_ref)?;
        self.unlink(pod_ref, &pod.uuid);
        Some(pod)
    }

    fn unlink(&mut self, pod_ref: &PodRef, uuid: &Uuid) {
        if let Some(refs) = self.by_uuid.get_mut(uuid) {
            refs.remove(pod_ref);
            if refs.is_empty() {
                self.by_uuid.remove(uuid);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for PodIndex {
    fn apply(&mut self, pod: Pod) {
        let name = pod.name_unchecked();
        let Some(namespace) = pod.namespace() else {
            tracing::warn!(%name, "Pod has no namespace");
            return;
        };
        let pod_ref = PodRef { namespace, name };

        let indexed = match IndexedPod::from_pod(&pod) {
            Ok(indexed) => indexed,
            Err(error) => {
                tracing::warn!(namespace = %pod_ref.namespace, pod = %pod_ref.name, %error, "Ignoring pod");
                self.remove(&pod_ref);
                return;
            }
        };

        let uuid = indexed.uuid;
        let scrape = indexed.scrape.clone();
        match self.insert(pod_ref.clone(), indexed) {
            None => {
                tracing::debug!(namespace = %pod_ref.namespace, pod = %pod_ref.name, %uuid, "Indexed pod");
            }
            Some(prior) if prior.scrape != scrape => {
                tracing::debug!(
                    namespace = %pod_ref.namespace,
                    pod = %pod_ref.name,
                    %uuid,
                    "Metrics scrape annotation changed"
                );
                self.broker.announce_proxy(&uuid);
            }
            Some(_) => {}
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let pod_ref = PodRef { namespace, name };
        let Some(pod) = self.remove(&pod_ref) else {
            return;
        };
        tracing::debug!(namespace = %pod_ref.namespace, pod = %pod_ref.name, uid = %pod.uid, "Pod deleted");
        self.broker.publish_pod_deleted(PodDeleted {
            uid: pod.uid,
            namespace: pod_ref.namespace,
            name: pod_ref.name,
        });
    }
}

// === impl IndexedPod ===

impl IndexedPod {
    fn from_pod(pod: &Pod) -> Result<Self> {
        let Some(label) = pod.labels().get(PROXY_UUID_LABEL) else {
            bail!("missing {PROXY_UUID_LABEL} label");
        };
        let uuid = match label.parse::<Uuid>() {
            Ok(uuid) => uuid,
            Err(error) => bail!("invalid {PROXY_UUID_LABEL} label {label:?}: {error}"),
        };
        let Some(uid) = pod.uid() else {
            bail!("pod has no UID");
        };
        let service_account = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.clone())
            .filter(|sa| !sa.is_empty())
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            uid,
            uuid,
            service_account,
            scrape: pod.annotations().get(SCRAPE_ANNOTATION).cloned(),
        })
    }
}

// === impl PodLookup ===

impl PodLookup {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

impl LookupPod for PodLookup {
    fn lookup_pod(&self, proxy: &ProxyIdentity) -> Result<Option<PodMetadata>> {
        self.0.read().lookup(&proxy.uuid)
    }
}
