use super::ProxyRegistry;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

#[derive(Debug)]
struct Instrumented(Arc<ProxyRegistry>);

pub fn register(reg: &mut Registry, registry: Arc<ProxyRegistry>) {
    reg.register_collector(Box::new(Instrumented(registry)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.inner.read();

        let connected = ConstGauge::new(this.connected.len() as i64);
        let connected_encoder = encoder.encode_descriptor(
            "connected_proxies",
            "The number of proxies with an open ADS stream",
            None,
            MetricType::Gauge,
        )?;
        connected.encode(connected_encoder)?;

        let disconnected = ConstGauge::new(this.disconnected.len() as i64);
        let disconnected_encoder = encoder.encode_descriptor(
            "disconnected_proxies",
            "The number of recently disconnected proxies retained for diagnostics",
            None,
            MetricType::Gauge,
        )?;
        disconnected.encode(disconnected_encoder)?;

        let pods = ConstGauge::new(this.by_pod_uid.len() as i64);
        let pods_encoder = encoder.encode_descriptor(
            "pod_uid_index_size",
            "The number of pods indexed to a proxy certificate",
            None,
            MetricType::Gauge,
        )?;
        pods.encode(pods_encoder)?;

        Ok(())
    }
}
