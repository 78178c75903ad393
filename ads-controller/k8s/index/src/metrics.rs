use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let (by_ns, uuids) = {
            let this = self.0.read();
            (this.namespace_sizes(), this.uuid_count())
        };

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of meshed pods in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, pods) in &by_ns {
            let labels = [("namespace", ns.as_str())];
            let pods = ConstGauge::new(*pods as u32);
            let pods_encoder = pods_encoder.encode_family(&labels)?;
            pods.encode(pods_encoder)?;
        }

        let uuids = ConstGauge::new(uuids as u32);
        let uuids_encoder = encoder.encode_descriptor(
            "proxy_uuid_index_size",
            "The number of distinct proxy UUIDs in index",
            None,
            MetricType::Gauge,
        )?;
        uuids.encode(uuids_encoder)?;

        Ok(())
    }
}
