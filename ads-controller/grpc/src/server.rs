use crate::{
    metrics::{GrpcServerMetricsFamily, GrpcServerRPCMetrics, XdsMetrics},
    pool::WorkerPool,
    response::ResponseTx,
    stream::StreamLoop,
    validate::{PeerValidationError, ValidatePeer},
};
use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use futures::prelude::*;
use mesh_ads_controller_core::{
    broker::Broker,
    catalog::Catalog,
    pod::{IdentityMismatch, LookupPod, NoPods},
    registry::{ConnectionLimitReached, ProxyRegistry},
    Proxy,
};
use std::{net::SocketAddr, pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info_span, warn, Instrument};

const SERVICE: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";
const METHOD: &str = "StreamAggregatedResources";

/// Responses buffered per stream before the stream loop waits on the proxy.
const RESPONSE_BUFFER: usize = 16;

/// Serves the Aggregated Discovery Service to mesh proxies.
pub struct AdsServer<C> {
    registry: Arc<ProxyRegistry>,
    broker: Broker,
    catalog: Arc<C>,
    validator: Arc<dyn ValidatePeer + Send + Sync>,
    pods: Arc<dyn LookupPod + Send + Sync>,
    pool: WorkerPool,
    max_connections: usize,
    metrics: XdsMetrics,
    rpc: GrpcServerRPCMetrics,
    drain: drain::Watch,
}

/// Reasons a stream is refused when it is opened.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid proxy certificate: {0}")]
    InvalidCertificate(#[from] PeerValidationError),

    #[error("too many connected proxies (limit {limit})")]
    TooManyConnections { limit: usize },

    #[error(transparent)]
    IdentityMismatch(#[from] IdentityMismatch),
}

type BoxResponseStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

type BoxDeltaResponseStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, tonic::Status>> + Send>>;

// === impl AdsServer ===

impl<C> AdsServer<C>
where
    C: Catalog + Send + Sync + 'static,
{
    pub fn new<V>(
        catalog: Arc<C>,
        validator: V,
        registry: Arc<ProxyRegistry>,
        broker: Broker,
        pool: WorkerPool,
        drain: drain::Watch,
    ) -> Self
    where
        V: ValidatePeer + Send + Sync + 'static,
    {
        Self {
            registry,
            broker,
            catalog,
            validator: Arc::new(validator),
            pods: Arc::new(NoPods),
            pool,
            max_connections: 0,
            metrics: XdsMetrics::default(),
            rpc: GrpcServerMetricsFamily::default().bidi_stream_rpc(SERVICE, METHOD),
            drain,
        }
    }

    /// Resolves the pods backing proxies as they connect.
    pub fn with_pod_lookup<P>(mut self, pods: P) -> Self
    where
        P: LookupPod + Send + Sync + 'static,
    {
        self.pods = Arc::new(pods);
        self
    }

    /// Limits the number of concurrently connected proxies. Zero disables the limit.
    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit;
        self
    }

    pub fn with_metrics(mut self, xds: XdsMetrics, grpc: &GrpcServerMetricsFamily) -> Self {
        self.metrics = xds;
        self.rpc = grpc.bidi_stream_rpc(SERVICE, METHOD);
        self
    }

    pub fn svc(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    /// Admits a proxy presenting the given leaf certificate and registers it. The caller must
    /// run the proxy's stream loop, which unregisters it when the stream ends.
    pub(crate) fn connect(
        &self,
        leaf: Option<&[u8]>,
        addr: Option<SocketAddr>,
    ) -> Result<Arc<Proxy>, StreamError> {
        let peer = self.validator.validate(leaf)?;
        let proxy = Arc::new(Proxy::new(peer.cn, peer.identity, peer.serial, addr));

        // Gateways may run without a backing pod.
        match self.pods.lookup_pod(proxy.identity()) {
            Ok(Some(pod)) => {
                pod.check_identity(proxy.identity())?;
                proxy.set_pod(pod);
            }
            Ok(None) => {
                tracing::debug!(proxy = %proxy, "No pod found for proxy");
            }
            Err(error) => {
                warn!(proxy = %proxy, %error, "Failed to look up pod for proxy");
            }
        }

        // The slot is reserved under the registry lock so concurrent streams cannot overshoot
        // the limit.
        self.registry
            .try_register_proxy(proxy.clone(), self.max_connections)
            .inspect_err(|_| {
                self.metrics.max_connections_rejected.inc();
            })?;
        Ok(proxy)
    }

    fn stream_loop(&self, proxy: Arc<Proxy>, tx: ResponseTx) -> StreamLoop<C> {
        StreamLoop {
            proxy,
            registry: self.registry.clone(),
            broker: self.broker.clone(),
            catalog: self.catalog.clone(),
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            tx,
            drain: self.drain.clone(),
        }
    }
}

#[async_trait::async_trait]
impl<C> AggregatedDiscoveryService for AdsServer<C>
where
    C: Catalog + Send + Sync + 'static,
{
    type StreamAggregatedResourcesStream = BoxResponseStream;

    async fn stream_aggregated_resources(
        &self,
        req: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxResponseStream>, tonic::Status> {
        let observer = self.rpc.start();

        let addr = req.remote_addr();
        let leaf = req
            .peer_certs()
            .and_then(|certs| certs.first().map(|c| c.to_vec()));
        let proxy = match self.connect(leaf.as_deref(), addr) {
            Ok(proxy) => proxy,
            Err(error) => {
                warn!(?addr, %error, "Rejecting ADS stream");
                let status = tonic::Status::from(error);
                observer.end(status.code());
                return Err(status);
            }
        };

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let errors = tx.clone();
        let sent = observer.msg_sent();
        let stream = self.stream_loop(proxy.clone(), tx);
        let requests = req.into_inner();
        tokio::spawn(
            async move {
                let res = stream
                    .run(requests.inspect(|_| observer.msg_received()))
                    .await;
                match res {
                    Ok(()) => observer.end(tonic::Code::Ok),
                    Err(status) => {
                        observer.end(status.code());
                        let _ = errors.send(Err(status)).await;
                    }
                }
            }
            .instrument(info_span!("ads", proxy = %proxy.common_name())),
        );

        let responses = ReceiverStream::new(rx).inspect(move |rsp| {
            if rsp.is_ok() {
                sent.inc();
            }
        });
        Ok(tonic::Response::new(Box::pin(responses)))
    }

    type DeltaAggregatedResourcesStream = BoxDeltaResponseStream;

    async fn delta_aggregated_resources(
        &self,
        _: tonic::Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxDeltaResponseStream>, tonic::Status> {
        Err(tonic::Status::unimplemented("incremental xDS is not supported"))
    }
}

// === impl StreamError ===

impl From<ConnectionLimitReached> for StreamError {
    fn from(ConnectionLimitReached { limit }: ConnectionLimitReached) -> Self {
        Self::TooManyConnections { limit }
    }
}

impl From<StreamError> for tonic::Status {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::InvalidCertificate(_) => tonic::Status::unauthenticated(error.to_string()),
            StreamError::TooManyConnections { .. } => {
                tonic::Status::resource_exhausted(error.to_string())
            }
            StreamError::IdentityMismatch(_) => tonic::Status::permission_denied(error.to_string()),
        }
    }
}
