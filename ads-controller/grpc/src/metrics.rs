use mesh_ads_controller_core::ResourceType;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::{
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct GrpcServerMetricsFamily {
    started: Family<Labels, Counter>,
    handling: Family<Labels, Histogram>,
    handled: Family<CodeLabels, Counter>,
    msg_received: Family<Labels, Counter>,
    msg_sent: Family<Labels, Counter>,
}

#[derive(Clone, Debug)]
pub(crate) struct GrpcServerRPCMetrics {
    started: Counter,
    msg_received: Counter,
    msg_sent: Counter,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    labels: Labels,
}

pub(crate) struct ResponseObserver {
    msg_received: Counter,
    msg_sent: Counter,
    handled: Option<ResponseHandle>,
}

struct ResponseHandle {
    start: time::Instant,
    durations: Histogram,
    codes: Family<CodeLabels, Counter>,
    labels: Labels,
}

/// Metrics describing the xDS protocol exchange with proxies.
#[derive(Clone, Debug)]
pub struct XdsMetrics {
    pub(crate) connected: Gauge,
    pub(crate) max_connections_rejected: Counter,
    pub(crate) reconnects: Counter,
    pub(crate) requests: Family<TypeLabels, Counter>,
    pub(crate) nacks: Family<TypeLabels, Counter>,
    pub(crate) responses: Family<ResponseLabels, Counter>,
    pub(crate) job_duration: Histogram,
    pub(crate) jobs: Counter,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CodeLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
    grpc_code: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub(crate) struct TypeLabels {
    xds_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub(crate) struct ResponseLabels {
    xds_type: &'static str,
    result: &'static str,
}

// === GrpcServerMetricsFamily ===

impl GrpcServerMetricsFamily {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Family::<Labels, Counter>::default();
        reg.register(
            "started",
            "Total number of RPCs started on the server",
            started.clone(),
        );

        let msg_received = Family::<Labels, Counter>::default();
        reg.register(
            "msg_received",
            "Total number of RPC stream messages received on the server",
            msg_received.clone(),
        );

        let msg_sent = Family::<Labels, Counter>::default();
        reg.register(
            "msg_sent",
            "Total number of gRPC stream messages sent by the server",
            msg_sent.clone(),
        );

        let handled = Family::<CodeLabels, Counter>::default();
        reg.register(
            "handled",
            "Total number of RPCs completed on the server, regardless of success or failure",
            handled.clone(),
        );

        let handling = Family::<Labels, Histogram>::new_with_constructor(|| {
            // ADS streams live as long as the proxy, typically hours.
            Histogram::new([1.0, 60.0, 3600.0, 86400.0])
        });
        reg.register_with_unit(
            "handling",
            "Histogram of the lifetime (seconds) of gRPC streams handled by the server",
            Unit::Seconds,
            handling.clone(),
        );

        Self {
            started,
            msg_received,
            msg_sent,
            handled,
            handling,
        }
    }

    pub(crate) fn bidi_stream_rpc(
        &self,
        svc: &'static str,
        method: &'static str,
    ) -> GrpcServerRPCMetrics {
        self.rpc(svc, method, "bidi_stream")
    }

    fn rpc(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
        grpc_type: &'static str,
    ) -> GrpcServerRPCMetrics {
        let labels = Labels {
            grpc_service,
            grpc_method,
            grpc_type,
        };
        GrpcServerRPCMetrics {
            started: self.started.get_or_create(&labels).clone(),
            msg_received: self.msg_received.get_or_create(&labels).clone(),
            msg_sent: self.msg_sent.get_or_create(&labels).clone(),
            handled: self.handled.clone(),
            handling: self.handling.get_or_create(&labels).clone(),
            labels,
        }
    }
}

impl Default for GrpcServerMetricsFamily {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === GrpcServerRPCMetrics ===

impl GrpcServerRPCMetrics {
    pub(crate) fn start(&self) -> ResponseObserver {
        self.started.inc();

        // Pre-register OK
        let _ = self.handled.get_or_create(&CodeLabels {
            grpc_service: self.labels.grpc_service,
            grpc_method: self.labels.grpc_method,
            grpc_type: self.labels.grpc_type,
            grpc_code: code_str(tonic::Code::Ok),
        });

        ResponseObserver {
            msg_received: self.msg_received.clone(),
            msg_sent: self.msg_sent.clone(),
            handled: Some(ResponseHandle {
                start: time::Instant::now(),
                durations: self.handling.clone(),
                codes: self.handled.clone(),
                labels: self.labels.clone(),
            }),
        }
    }
}

// === ResponseObserver ===

impl ResponseObserver {
    pub(crate) fn msg_received(&self) {
        self.msg_received.inc();
    }

    /// Returns a handle that counts messages sent on the stream.
    pub(crate) fn msg_sent(&self) -> Counter {
        self.msg_sent.clone()
    }

    pub(crate) fn end(mut self, code: tonic::Code) {
        if let Some(handle) = self.handled.take() {
            handle.inc_end(code);
        }
    }
}

impl Drop for ResponseObserver {
    fn drop(&mut self) {
        if let Some(inner) = self.handled.take() {
            inner.inc_end(tonic::Code::Ok);
        }
    }
}

// === ResponseHandle ===

impl ResponseHandle {
    #[inline]
    fn inc_end(self, code: tonic::Code) {
        let Self {
            start,
            durations,
            codes,
            labels,
        } = self;
        durations.observe(start.elapsed().as_secs_f64());
        codes
            .get_or_create(&CodeLabels {
                grpc_service: labels.grpc_service,
                grpc_method: labels.grpc_method,
                grpc_type: labels.grpc_type,
                grpc_code: code_str(code),
            })
            .inc();
    }
}

// === XdsMetrics ===

impl XdsMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();

        reg.register(
            "proxy_connect_count",
            "Number of proxies with an open ADS stream",
            metrics.connected.clone(),
        );
        reg.register(
            "proxy_max_connections_rejected",
            "Count of ADS streams rejected by the connection limit",
            metrics.max_connections_rejected.clone(),
        );
        reg.register(
            "proxy_reconnect_count",
            "Count of proxies resuming a version lineage issued by another control plane instance",
            metrics.reconnects.clone(),
        );
        reg.register(
            "requests",
            "Count of discovery requests received, by xDS type",
            metrics.requests.clone(),
        );
        reg.register(
            "nacks",
            "Count of discovery requests rejecting a response, by xDS type",
            metrics.nacks.clone(),
        );
        reg.register(
            "responses",
            "Count of discovery responses built, by xDS type and result",
            metrics.responses.clone(),
        );
        reg.register_with_unit(
            "job_duration",
            "Histogram of the time spent building and sending responses for a job",
            Unit::Seconds,
            metrics.job_duration.clone(),
        );
        reg.register(
            "pool_jobs",
            "Count of jobs executed by the worker pool",
            metrics.jobs.clone(),
        );

        metrics
    }

    pub(crate) fn request(&self, ty: ResourceType) {
        self.requests.get_or_create(&TypeLabels::new(ty)).inc();
    }

    pub(crate) fn nack(&self, ty: ResourceType) {
        self.nacks.get_or_create(&TypeLabels::new(ty)).inc();
    }

    pub(crate) fn response(&self, ty: ResourceType, ok: bool) {
        self.responses
            .get_or_create(&ResponseLabels {
                xds_type: ty.as_str(),
                result: if ok { "ok" } else { "error" },
            })
            .inc();
    }
}

impl Default for XdsMetrics {
    fn default() -> Self {
        Self {
            connected: Gauge::default(),
            max_connections_rejected: Counter::default(),
            reconnects: Counter::default(),
            requests: Family::default(),
            nacks: Family::default(),
            responses: Family::default(),
            job_duration: Histogram::new([0.001, 0.01, 0.1, 1.0, 10.0]),
            jobs: Counter::default(),
        }
    }
}

impl TypeLabels {
    pub(crate) fn new(ty: ResourceType) -> Self {
        Self {
            xds_type: ty.as_str(),
        }
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}
