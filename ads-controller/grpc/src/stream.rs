use crate::{
    arbiter::{self, Decision},
    metrics::XdsMetrics,
    pool::WorkerPool,
    response::{ResponseJob, ResponseTx},
};
use envoy_types::pb::envoy::service::discovery::v3::DiscoveryRequest;
use futures::prelude::*;
use mesh_ads_controller_core::{
    broker::Broker, catalog::Catalog, registry::ProxyRegistry, Proxy, ResourceType,
};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Drives a single proxy's ADS stream.
///
/// All session state for the proxy is mutated from this loop or from the response job it is
/// currently waiting on, so responses to a proxy are never built concurrently.
pub(crate) struct StreamLoop<C> {
    pub(crate) proxy: Arc<Proxy>,
    pub(crate) registry: Arc<ProxyRegistry>,
    pub(crate) broker: Broker,
    pub(crate) catalog: Arc<C>,
    pub(crate) pool: WorkerPool,
    pub(crate) metrics: XdsMetrics,
    pub(crate) tx: ResponseTx,
    pub(crate) drain: drain::Watch,
}

/// Holds a proxy's registration for the lifetime of its stream. The proxy is registered when it
/// is admitted and unregistered when the guard drops.
struct Registration<'a> {
    proxy: &'a Arc<Proxy>,
    registry: &'a ProxyRegistry,
    metrics: &'a XdsMetrics,
}

// === impl StreamLoop ===

impl<C> StreamLoop<C>
where
    C: Catalog + Send + Sync + 'static,
{
    pub(crate) async fn run<S>(self, requests: S) -> Result<(), tonic::Status>
    where
        S: Stream<Item = Result<DiscoveryRequest, tonic::Status>>,
    {
        let _registration = Registration::new(&self.proxy, &self.registry, &self.metrics);

        // Both subscriptions are released when the loop returns.
        let mut updates = self
            .broker
            .subscribe_proxy_updates(&self.proxy.identity().uuid);
        let mut rotations = self.broker.subscribe_certificate_rotations(&self.proxy);

        tokio::pin! {
            let requests = requests;
            let shutdown = self.drain.clone().signaled();
        }

        let mut has_node = false;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Server shutting down");
                    return Ok(());
                }

                _ = self.tx.closed() => {
                    debug!("Proxy stopped receiving responses");
                    return Ok(());
                }

                req = requests.next() => match req {
                    Some(Ok(req)) => {
                        if !has_node {
                            if req.node.is_none() {
                                warn!(type_url = %req.type_url, "Ignoring initial request without a node");
                                continue;
                            }
                            has_node = true;
                        }
                        self.handle_request(req).await?;
                    }
                    Some(Err(status)) if status.code() == tonic::Code::Cancelled => {
                        debug!("Stream cancelled");
                        return Ok(());
                    }
                    Some(Err(status)) => {
                        warn!(code = ?status.code(), message = %status.message(), "Stream failed");
                        return Err(status);
                    }
                    None => {
                        info!("Proxy closed the stream");
                        return Err(tonic::Status::unavailable("proxy closed the stream"));
                    }
                },

                Some(update) = updates.recv() => {
                    if !self.proxy.is_past_init() {
                        trace!(announcements = update.announcements, "Proxy has not completed its initial handshake; skipping update");
                        continue;
                    }
                    debug!(announcements = update.announcements, "Pushing configuration update");
                    self.respond(ResourceType::PROXY_UPDATE.to_vec(), None).await?;
                }

                Some(rotated) = rotations.recv() => {
                    if !self.proxy.owns_certificate(&rotated.cn) {
                        continue;
                    }
                    debug!(cn = %rotated.cn, "Pushing rotated certificate");
                    self.respond(vec![ResourceType::Sds], None).await?;
                }
            }
        }
    }

    async fn handle_request(&self, req: DiscoveryRequest) -> Result<(), tonic::Status> {
        let decision = arbiter::respond_to_request(self.proxy.session(), &req);
        if let Some(ty) = decision.resource_type() {
            self.metrics.request(ty);
        }
        match decision {
            Decision::Nack(ty) => self.metrics.nack(ty),
            Decision::Reconnect(_) => {
                self.metrics.reconnects.inc();
            }
            _ => {}
        }

        let Some(ty) = decision.resource_type().filter(|_| decision.must_respond()) else {
            return Ok(());
        };
        self.respond(vec![ty], Some(req)).await
    }

    /// Submits a response job and waits for it to complete.
    async fn respond(
        &self,
        types: Vec<ResourceType>,
        request: Option<DiscoveryRequest>,
    ) -> Result<(), tonic::Status> {
        let job = ResponseJob {
            proxy: self.proxy.clone(),
            types,
            request,
            catalog: self.catalog.clone(),
            tx: self.tx.clone(),
            metrics: self.metrics.clone(),
        };
        let done = self.pool.add_job(job.run()).await.map_err(|error| {
            warn!(%error, "Failed to submit response job");
            tonic::Status::internal(error.to_string())
        })?;
        done.await;
        Ok(())
    }
}

// === impl Registration ===

impl<'a> Registration<'a> {
    fn new(proxy: &'a Arc<Proxy>, registry: &'a ProxyRegistry, metrics: &'a XdsMetrics) -> Self {
        metrics.connected.inc();
        info!(serial = %proxy.serial_number(), "Proxy connected");
        Self {
            proxy,
            registry,
            metrics,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister_proxy(self.proxy);
        self.metrics.connected.dec();
        info!("Proxy disconnected");
    }
}

#[cfg(test)]
mod tests;
