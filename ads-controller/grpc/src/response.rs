use crate::metrics::XdsMetrics;
use envoy_types::pb::{
    envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse},
    google::protobuf::Any,
};
use mesh_ads_controller_core::{catalog::Catalog, Proxy, ResourceType};
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) type ResponseTx = mpsc::Sender<Result<DiscoveryResponse, tonic::Status>>;

/// Builds and sends responses of one or more types to a proxy.
pub(crate) struct ResponseJob<C> {
    pub(crate) proxy: Arc<Proxy>,
    pub(crate) types: Vec<ResourceType>,
    pub(crate) request: Option<DiscoveryRequest>,
    pub(crate) catalog: Arc<C>,
    pub(crate) tx: ResponseTx,
    pub(crate) metrics: XdsMetrics,
}

impl<C> ResponseJob<C>
where
    C: Catalog + Send + Sync + 'static,
{
    pub(crate) async fn run(self) {
        for &ty in &self.types {
            let rsp = match self.build(ty).await {
                Ok(rsp) => rsp,
                Err(error) => {
                    warn!(proxy = %self.proxy, %ty, %error, "Failed to build response");
                    self.metrics.response(ty, false);
                    continue;
                }
            };

            debug!(
                proxy = %self.proxy,
                %ty,
                version = %rsp.version_info,
                nonce = %rsp.nonce,
                resources = rsp.resources.len(),
                "Sending response"
            );
            if self.tx.send(Ok(rsp)).await.is_err() {
                debug!(proxy = %self.proxy, "Stream closed before response was sent");
                return;
            }
            self.metrics.response(ty, true);
        }
    }

    async fn build(&self, ty: ResourceType) -> anyhow::Result<DiscoveryResponse> {
        let names = self.resource_names(ty);
        let resources = self
            .catalog
            .resources(&self.proxy, ty, &names)
            .await?
            .into_iter()
            .map(|r| Any {
                type_url: ty.type_url().to_string(),
                value: r.body.to_vec(),
            })
            .collect();

        let session = self.proxy.session();
        let version = session.increment_last_sent_version(ty);
        let nonce = session.new_nonce(ty);
        Ok(DiscoveryResponse {
            version_info: version.to_string(),
            resources,
            type_url: ty.type_url().to_string(),
            nonce,
            ..Default::default()
        })
    }

    fn resource_names(&self, ty: ResourceType) -> BTreeSet<String> {
        if ty.is_wildcard() {
            return BTreeSet::new();
        }
        match &self.request {
            Some(req) if req.type_url == ty.type_url() => {
                req.resource_names.iter().cloned().collect()
            }
            _ => self.proxy.session().subscribed_resources(ty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use bytes::Bytes;
    use mesh_ads_controller_core::{
        catalog::Resource, CommonName, ProxyIdentity, SerialNumber,
    };

    struct Fixed;

    #[async_trait::async_trait]
    impl Catalog for Fixed {
        async fn resources(
            &self,
            _: &Proxy,
            ty: ResourceType,
            names: &BTreeSet<String>,
        ) -> anyhow::Result<Vec<Resource>> {
            if ty == ResourceType::Eds {
                bail!("endpoints unavailable");
            }
            Ok(names
                .iter()
                .map(|n| Resource {
                    name: n.clone(),
                    body: Bytes::from(n.clone()),
                })
                .chain(std::iter::once(Resource {
                    name: ty.to_string(),
                    body: Bytes::from(ty.to_string()),
                }))
                .collect())
        }
    }

    fn proxy() -> Arc<Proxy> {
        let cn = CommonName::from(
            "0b2c0a1e-6f5e-4e3b-9d39-7f4b2a8c1d10.sidecar.bookbuyer.bookstore.cluster.local",
        );
        let id = ProxyIdentity::parse(&cn).unwrap();
        Arc::new(Proxy::new(cn, id, SerialNumber::new("01"), None))
    }

    fn job(
        proxy: &Arc<Proxy>,
        types: Vec<ResourceType>,
        request: Option<DiscoveryRequest>,
        tx: ResponseTx,
        metrics: &XdsMetrics,
    ) -> ResponseJob<Fixed> {
        ResponseJob {
            proxy: proxy.clone(),
            types,
            request,
            catalog: Arc::new(Fixed),
            tx,
            metrics: metrics.clone(),
        }
    }

    #[tokio::test]
    async fn sends_responses_in_order_and_skips_failures() {
        let proxy = proxy();
        let metrics = XdsMetrics::default();
        let (tx, mut rx) = mpsc::channel(8);

        job(&proxy, ResourceType::PROXY_UPDATE.to_vec(), None, tx, &metrics)
            .run()
            .await;

        let mut types = vec![];
        while let Some(Ok(rsp)) = rx.recv().await {
            assert_eq!(rsp.version_info, "1");
            assert!(!rsp.nonce.is_empty());
            assert!(rsp.resources.iter().all(|r| r.type_url == rsp.type_url));
            types.push(rsp.type_url.parse::<ResourceType>().unwrap());
        }
        assert_eq!(
            types,
            vec![ResourceType::Cds, ResourceType::Lds, ResourceType::Rds]
        );

        // A failed type does not advance its session state.
        assert_eq!(proxy.session().last_sent_nonce(ResourceType::Eds), "");
        assert_eq!(proxy.session().last_sent_version(ResourceType::Cds), 1);
    }

    #[tokio::test]
    async fn selects_requested_resources() {
        let proxy = proxy();
        let metrics = XdsMetrics::default();
        proxy
            .session()
            .set_subscribed_resources(ResourceType::Sds, ["subscribed".to_string()].into());

        let req = DiscoveryRequest {
            type_url: ResourceType::Rds.type_url().to_string(),
            resource_names: vec!["requested".to_string()],
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(8);
        job(
            &proxy,
            vec![ResourceType::Rds, ResourceType::Sds, ResourceType::Cds],
            Some(req),
            tx,
            &metrics,
        )
        .run()
        .await;

        let names = |rsp: DiscoveryResponse| {
            rsp.resources
                .into_iter()
                .map(|r| String::from_utf8(r.value).unwrap())
                .collect::<Vec<_>>()
        };
        let rds = rx.recv().await.unwrap().unwrap();
        assert_eq!(names(rds), vec!["requested", "RDS"]);
        let sds = rx.recv().await.unwrap().unwrap();
        assert_eq!(names(sds), vec!["subscribed", "SDS"]);
        let cds = rx.recv().await.unwrap().unwrap();
        assert_eq!(names(cds), vec!["CDS"]);
    }

    #[tokio::test]
    async fn stops_when_stream_closes() {
        let proxy = proxy();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        job(
            &proxy,
            ResourceType::PROXY_UPDATE.to_vec(),
            None,
            tx,
            &XdsMetrics::default(),
        )
        .run()
        .await;

        // The first response was built before the closed stream was observed.
        assert_eq!(proxy.session().last_sent_version(ResourceType::Cds), 1);
        assert_eq!(proxy.session().last_sent_version(ResourceType::Lds), 0);
    }
}
