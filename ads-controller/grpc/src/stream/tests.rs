use super::*;
use crate::metrics::TypeLabels;
use bytes::Bytes;
use envoy_types::pb::{
    envoy::{config::core::v3::Node, service::discovery::v3::DiscoveryResponse},
    google::rpc::Status,
};
use mesh_ads_controller_core::{
    broker::{BrokerConfig, BrokerMetrics, CertificateRotated},
    catalog::Resource,
    CommonName, ProxyIdentity, SerialNumber, Uuid,
};
use std::{collections::BTreeSet, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tokio_stream::wrappers::ReceiverStream;

const CN: &str = "0b2c0a1e-6f5e-4e3b-9d39-7f4b2a8c1d10.sidecar.bookbuyer.bookstore.cluster.local";

/// Serves one resource named after its type, plus every requested resource.
struct StaticCatalog;

#[async_trait::async_trait]
impl Catalog for StaticCatalog {
    async fn resources(
        &self,
        _: &Proxy,
        ty: ResourceType,
        names: &BTreeSet<String>,
    ) -> anyhow::Result<Vec<Resource>> {
        Ok(std::iter::once(ty.to_string())
            .chain(names.iter().cloned())
            .map(|name| Resource {
                body: Bytes::from(name.clone()),
                name,
            })
            .collect())
    }
}

struct TestConfig {
    proxy: Arc<Proxy>,
    registry: Arc<ProxyRegistry>,
    broker: Broker,
    metrics: XdsMetrics,
    requests: Option<mpsc::Sender<Result<DiscoveryRequest, tonic::Status>>>,
    responses: mpsc::Receiver<Result<DiscoveryResponse, tonic::Status>>,
    task: JoinHandle<Result<(), tonic::Status>>,
    drain: drain::Signal,
    _tracing: tracing::subscriber::DefaultGuard,
}

impl TestConfig {
    fn spawn() -> Self {
        let _tracing = init_tracing();

        let cn = CommonName::from(CN);
        let identity = ProxyIdentity::parse(&cn).expect("valid common name");
        let proxy = Arc::new(Proxy::new(cn, identity, SerialNumber::new("01"), None));

        let registry = Arc::new(ProxyRegistry::new(Duration::from_secs(60)));
        registry.register_proxy(proxy.clone());
        let (broker, dispatcher) = Broker::new(
            BrokerConfig {
                subscriber_capacity: 8,
                sliding_window: Duration::from_millis(10),
                max_window: Duration::from_millis(100),
            },
            BrokerMetrics::default(),
        );
        tokio::spawn(dispatcher.run());

        let metrics = XdsMetrics::default();
        let pool = WorkerPool::spawn(2, 8, metrics.clone());
        let (drain, watch) = drain::channel();
        let (tx, responses) = mpsc::channel(16);
        let (requests, rx) = mpsc::channel(16);

        let stream = StreamLoop {
            proxy: proxy.clone(),
            registry: registry.clone(),
            broker: broker.clone(),
            catalog: Arc::new(StaticCatalog),
            pool,
            metrics: metrics.clone(),
            tx,
            drain: watch,
        };
        let task = tokio::spawn(stream.run(ReceiverStream::new(rx)));

        Self {
            proxy,
            registry,
            broker,
            metrics,
            requests: Some(requests),
            responses,
            task,
            drain,
            _tracing,
        }
    }

    async fn send(&self, req: DiscoveryRequest) {
        self.requests
            .as_ref()
            .expect("request stream must be open")
            .send(Ok(req))
            .await
            .expect("stream must be running");
    }

    async fn next_response(&mut self) -> DiscoveryResponse {
        time::timeout(Duration::from_secs(5), self.responses.recv())
            .await
            .expect("response must be sent")
            .expect("stream must be open")
            .expect("response must not be an error")
    }

    async fn expect_no_response(&mut self) {
        if let Ok(rsp) = time::timeout(Duration::from_secs(5), self.responses.recv()).await {
            panic!("unexpected response: {rsp:?}");
        }
    }

    /// Completes the initial exchange for clusters and listeners.
    async fn handshake(&mut self) {
        self.send(with_node(request(ResourceType::Cds, "", "", &[])))
            .await;
        let cds = self.next_response().await;
        self.send(request(ResourceType::Lds, "", "", &[])).await;
        let lds = self.next_response().await;
        self.send(ack(&cds)).await;
        self.send(ack(&lds)).await;
        self.expect_no_response().await;
        assert!(self.proxy.is_past_init());
    }

    async fn expect_types(&mut self, expected: &[ResourceType]) {
        let mut types = vec![];
        for _ in expected {
            let rsp = self.next_response().await;
            types.push(rsp.type_url.parse::<ResourceType>().expect("known type"));
        }
        assert_eq!(types, expected);
        self.expect_no_response().await;
    }

    async fn finish(self) -> Result<(), tonic::Status> {
        self.task.await.expect("stream task must not panic")
    }
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

fn request(ty: ResourceType, nonce: &str, version: &str, names: &[&str]) -> DiscoveryRequest {
    DiscoveryRequest {
        type_url: ty.type_url().to_string(),
        response_nonce: nonce.to_string(),
        version_info: version.to_string(),
        resource_names: names.iter().map(|n| n.to_string()).collect(),
        ..Default::default()
    }
}

fn with_node(req: DiscoveryRequest) -> DiscoveryRequest {
    DiscoveryRequest {
        node: Some(Node {
            id: CN.to_string(),
            ..Default::default()
        }),
        ..req
    }
}

fn ack(rsp: &DiscoveryResponse) -> DiscoveryRequest {
    DiscoveryRequest {
        type_url: rsp.type_url.clone(),
        response_nonce: rsp.nonce.clone(),
        version_info: rsp.version_info.clone(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn responds_to_subscriptions_and_not_to_acks() {
    let mut test = TestConfig::spawn();

    test.send(with_node(request(ResourceType::Cds, "", "", &[])))
        .await;
    let rsp = test.next_response().await;
    assert_eq!(rsp.type_url, ResourceType::Cds.type_url());
    assert_eq!(rsp.version_info, "1");
    assert_eq!(rsp.resources.len(), 1);
    assert_eq!(rsp.nonce, test.proxy.session().last_sent_nonce(ResourceType::Cds));

    test.send(ack(&rsp)).await;
    test.expect_no_response().await;
    assert_eq!(
        test.proxy.session().last_applied_version(ResourceType::Cds),
        1
    );

    assert!(test.registry.get(test.proxy.common_name()).is_some());
    assert_eq!(test.metrics.connected.get(), 1);
    assert_eq!(
        test.metrics
            .requests
            .get_or_create(&TypeLabels::new(ResourceType::Cds))
            .get(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn ignores_initial_request_without_node() {
    let mut test = TestConfig::spawn();

    test.send(request(ResourceType::Cds, "", "", &[])).await;
    test.expect_no_response().await;

    test.send(with_node(request(ResourceType::Cds, "", "", &[])))
        .await;
    test.next_response().await;

    // Only the first request must identify the node.
    test.send(request(ResourceType::Eds, "", "", &["svc"])).await;
    let rsp = test.next_response().await;
    assert_eq!(rsp.type_url, ResourceType::Eds.type_url());
    assert_eq!(rsp.resources.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn proxy_updates_wait_for_initial_handshake() {
    let mut test = TestConfig::spawn();
    test.send(with_node(request(ResourceType::Cds, "", "", &[])))
        .await;
    test.next_response().await;

    // Clusters were sent, but listeners were not.
    test.broker.announce_all();
    test.expect_no_response().await;

    test.send(request(ResourceType::Lds, "", "", &[])).await;
    test.next_response().await;

    test.broker.announce_all();
    test.expect_types(&ResourceType::PROXY_UPDATE).await;
    assert_eq!(test.proxy.session().last_sent_version(ResourceType::Cds), 2);
    assert_eq!(test.proxy.session().last_sent_nonce(ResourceType::Sds), "");
}

#[tokio::test(start_paused = true)]
async fn no_updates_before_any_response() {
    let mut test = TestConfig::spawn();
    test.broker.announce_all();
    test.broker.announce_proxy(&test.proxy.identity().uuid);
    test.expect_no_response().await;
    assert!(!test.proxy.is_past_init());
}

#[tokio::test(start_paused = true)]
async fn targeted_updates() {
    let mut test = TestConfig::spawn();
    test.handshake().await;

    test.broker.announce_proxy(&Uuid::new_v4());
    test.expect_no_response().await;

    let uuid = test.proxy.identity().uuid;
    test.broker.announce_proxy(&uuid);
    test.expect_types(&ResourceType::PROXY_UPDATE).await;
}

#[tokio::test(start_paused = true)]
async fn pushes_rotations_of_owned_certificates() {
    let mut test = TestConfig::spawn();
    test.handshake().await;

    test.broker.publish_certificate_rotated(CertificateRotated {
        cn: CommonName::from("bookthief.bookstore.cluster.local"),
        serial: None,
    });
    test.expect_no_response().await;

    test.broker.publish_certificate_rotated(CertificateRotated {
        cn: CommonName::from("bookbuyer.bookstore.cluster.local"),
        serial: Some(SerialNumber::new("02")),
    });
    test.expect_types(&[ResourceType::Sds]).await;
}

#[tokio::test(start_paused = true)]
async fn rotations_of_other_identities_do_not_displace_owned_rotations() {
    let mut test = TestConfig::spawn();
    test.handshake().await;

    // Far more rotations than a subscriber buffers, none for this proxy.
    for i in 0..64 {
        test.broker.publish_certificate_rotated(CertificateRotated {
            cn: CommonName::from(format!("svc{i}.ns.cluster.local")),
            serial: None,
        });
    }
    test.broker.publish_certificate_rotated(CertificateRotated {
        cn: CommonName::from("bookbuyer.bookstore.cluster.local"),
        serial: None,
    });

    test.expect_types(&[ResourceType::Sds]).await;
    test.expect_no_response().await;
}

#[tokio::test(start_paused = true)]
async fn counts_nacks_and_reconnects() {
    let mut test = TestConfig::spawn();

    // The proxy was configured by another instance at version 7.
    test.send(with_node(request(ResourceType::Eds, "remote", "7", &["svc"])))
        .await;
    let rsp = test.next_response().await;
    assert_eq!(rsp.version_info, "8");
    assert_eq!(test.metrics.reconnects.get(), 1);

    let nack = DiscoveryRequest {
        error_detail: Some(Status {
            code: 3,
            message: "rejected".to_string(),
            details: vec![],
        }),
        ..ack(&rsp)
    };
    test.send(nack).await;
    test.expect_no_response().await;
    assert_eq!(
        test.metrics
            .nacks
            .get_or_create(&TypeLabels::new(ResourceType::Eds))
            .get(),
        1
    );
    assert_eq!(test.proxy.session().last_applied_version(ResourceType::Eds), 7);
}

#[tokio::test(start_paused = true)]
async fn cancellation_closes_cleanly() {
    let test = TestConfig::spawn();
    test.requests
        .as_ref()
        .unwrap()
        .send(Err(tonic::Status::cancelled("client went away")))
        .await
        .unwrap();

    let registry = test.registry.clone();
    let proxy = test.proxy.clone();
    let metrics = test.metrics.clone();
    test.finish().await.expect("cancellation is not an error");

    assert!(registry.get(proxy.common_name()).is_none());
    assert_eq!(registry.disconnected_proxies().len(), 1);
    assert_eq!(metrics.connected.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_is_an_error() {
    let mut test = TestConfig::spawn();
    test.requests = None;

    let registry = test.registry.clone();
    let err = test.finish().await.expect_err("proxy closed unexpectedly");
    assert_eq!(err.code(), tonic::Code::Unavailable);
    assert_eq!(registry.connected_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn transport_errors_end_the_stream() {
    let test = TestConfig::spawn();
    test.requests
        .as_ref()
        .unwrap()
        .send(Err(tonic::Status::internal("h2 protocol error")))
        .await
        .unwrap();

    let err = test.finish().await.expect_err("transport error");
    assert_eq!(err.code(), tonic::Code::Internal);
}

#[tokio::test(start_paused = true)]
async fn closing_the_response_stream_ends_the_loop() {
    let mut test = TestConfig::spawn();
    test.responses.close();
    test.finish().await.expect("closed response stream is not an error");
}

#[tokio::test(start_paused = true)]
async fn drains_on_shutdown() {
    let mut test = TestConfig::spawn();
    test.handshake().await;

    let TestConfig {
        drain,
        task,
        registry,
        requests: _requests,
        ..
    } = test;
    drain.drain().await;
    task.await.unwrap().expect("shutdown is not an error");
    assert_eq!(registry.connected_count(), 0);
}
