use crate::{core, grpc, index, tls::TlsPaths};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, num::NonZeroUsize, sync::Arc};
use tokio::time::Duration;
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

/// Concurrent streams accepted on a single HTTP/2 connection.
const MAX_CONCURRENT_STREAMS: u32 = 100_000;

#[derive(Debug, Parser)]
#[clap(name = "ads", about = "An Envoy aggregated discovery service controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "mesh_ads_controller=info,warn",
        env = "ADS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:15128")]
    ads_addr: SocketAddr,

    #[clap(flatten)]
    tls: TlsPaths,

    /// The trust domain in which proxy certificates are issued.
    #[clap(long, default_value = "cluster.local")]
    trust_domain: String,

    /// The maximum number of connected proxies. Zero disables the limit.
    #[clap(long, default_value = "0")]
    max_data_plane_connections: usize,

    /// The number of workers building responses. Defaults to the available parallelism.
    #[clap(long)]
    ads_workers: Option<NonZeroUsize>,

    #[clap(long, default_value = "4096")]
    ads_job_queue_capacity: usize,

    #[clap(long, default_value = "3600")]
    disconnected_proxy_ttl_secs: u64,

    #[clap(long, default_value = "2000")]
    proxy_update_sliding_window_ms: u64,

    #[clap(long, default_value = "10000")]
    proxy_update_max_window_ms: u64,

    #[clap(long, default_value = "60")]
    stream_keepalive_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            ads_addr,
            tls,
            trust_domain,
            max_data_plane_connections,
            ads_workers,
            ads_job_queue_capacity,
            disconnected_proxy_ttl_secs,
            proxy_update_sliding_window_ms,
            proxy_update_max_window_ms,
            stream_keepalive_secs,
        } = self;

        // Fail before connecting to the cluster if the server identity is unusable.
        let tls = tls.load()?;

        let mut prom = <Registry>::default();
        let grpc_metrics =
            grpc::GrpcServerMetricsFamily::register(prom.sub_registry_with_prefix("ads_grpc"));
        let xds_metrics = grpc::XdsMetrics::register(prom.sub_registry_with_prefix("ads_xds"));
        let broker_metrics =
            core::broker::BrokerMetrics::register(prom.sub_registry_with_prefix("ads_broker"));

        let registry = Arc::new(core::registry::ProxyRegistry::new(Duration::from_secs(
            disconnected_proxy_ttl_secs,
        )));
        core::registry::metrics::register(
            prom.sub_registry_with_prefix("ads_registry"),
            registry.clone(),
        );

        let (broker, dispatcher) = core::broker::Broker::new(
            core::broker::BrokerConfig {
                sliding_window: Duration::from_millis(proxy_update_sliding_window_ms),
                max_window: Duration::from_millis(proxy_update_max_window_ms),
                ..Default::default()
            },
            broker_metrics,
        );
        let pod_index = index::PodIndex::shared(broker.clone());
        index::metrics::register(
            prom.sub_registry_with_prefix("ads_pod_index"),
            pod_index.clone(),
        );

        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        tokio::spawn(dispatcher.run().instrument(info_span!("broker")));

        let catalog = core::catalog::SnapshotCatalog::new(broker.clone(), trust_domain.clone());

        // Release the certificates of proxies whose pods are gone.
        tokio::spawn(
            registry
                .clone()
                .release_certificates(broker.subscribe_pod_deletions(), catalog.clone())
                .instrument(info_span!("release_certificates")),
        );

        let pods =
            runtime.watch_all::<Pod>(watcher::Config::default().labels(core::PROXY_UUID_LABEL));
        tokio::spawn(
            kubert::index::namespaced(pod_index.clone(), pods).instrument(info_span!("pods")),
        );

        let workers = ads_workers
            .or_else(|| std::thread::available_parallelism().ok())
            .map_or(1, NonZeroUsize::get);
        let pool = grpc::WorkerPool::spawn(workers, ads_job_queue_capacity, xds_metrics.clone());

        let drain = runtime.shutdown_handle();
        let server = grpc::AdsServer::new(
            Arc::new(catalog),
            grpc::TrustDomainValidator::new(trust_domain),
            registry,
            broker,
            pool,
            drain.clone(),
        )
        .with_pod_lookup(index::PodLookup::new(pod_index))
        .with_max_connections(max_data_plane_connections)
        .with_metrics(xds_metrics, &grpc_metrics);

        tokio::spawn(serve(
            ads_addr,
            tls,
            Duration::from_secs(stream_keepalive_secs),
            server,
            drain,
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn serve(
    addr: SocketAddr,
    tls: tonic::transport::ServerTlsConfig,
    keepalive: Duration,
    server: grpc::AdsServer<core::catalog::SnapshotCatalog>,
    drain: drain::Watch,
) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    let router = Server::builder()
        .tls_config(tls)?
        .http2_keepalive_interval(Some(keepalive))
        .max_concurrent_streams(Some(MAX_CONCURRENT_STREAMS))
        .add_service(server.svc());
    tokio::pin! {
        let srv = router.serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "ADS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
