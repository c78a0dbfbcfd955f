use anyhow::Context as _;
use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    resource::Resource,
    trace::{self, Sampler, SdkTracerProvider},
};
use tracing_subscriber::layer::SubscriberExt;

/// Trace export settings, read from the server config's `jaeger` collector
/// endpoint and `trace_sample_ratio` option.
#[derive(Clone, Debug)]
pub struct TraceExport {
    pub collector: String,
    pub service_name: String,
    /// Fraction of root spans to sample, in (0, 1]. 1.0 samples everything;
    /// children always follow their parent's decision.
    pub sample_ratio: f64,
}

impl TraceExport {
    fn sampler(&self) -> Sampler {
        if self.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else {
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(self.sample_ratio)))
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/traces", self.collector.trim_end_matches('/'))
    }
}

/// Metric export settings, read from the server config's `prometheus`
/// collector endpoint and `metric_interval_secs` option.
#[derive(Clone, Debug)]
pub struct MetricExport {
    pub collector: String,
    pub service_name: String,
    pub interval_secs: u64,
}

/// Install the tracing pipeline: env-filtered fmt logging plus OTLP span
/// export with W3C trace-context propagation, so agent and dashboard calls
/// can carry their context through the control plane.
pub fn setup_tracing(
    export: TraceExport,
    filters: tracing_subscriber::EnvFilter,
) -> anyhow::Result<SdkTracerProvider> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(export.endpoint())
        .build()
        .context("building the OTLP span exporter")?;

    let provider = SdkTracerProvider::builder()
        .with_span_processor(trace::BatchSpanProcessor::builder(exporter).build())
        .with_sampler(export.sampler())
        .with_resource(
            Resource::builder()
                .with_service_name(export.service_name.clone())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer(export.service_name.clone());
    let subscriber = tracing_subscriber::Registry::default()
        .with(filters)
        .with(tracing_subscriber::fmt::layer()) // console logging layer
        .with(tracing_opentelemetry::layer().with_tracer(tracer));
    tracing::subscriber::set_global_default(subscriber)
        .context("installing the tracing subscriber")?;

    tracing::info!(
        collector = export.collector,
        sample_ratio = export.sample_ratio,
        "trace export enabled"
    );
    Ok(provider)
}

/// Install the metric pipeline: OTLP over gRPC on the configured interval.
/// The per-subsystem metric structs below are built once from the resulting
/// global meter and cloned into the subsystems.
pub fn setup_metrics(export: MetricExport) -> anyhow::Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(export.collector.trim_end_matches('/'))
        .build()
        .context("building the OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(std::time::Duration::from_secs(export.interval_secs.max(1)))
        .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(export.service_name.clone())
                .build(),
        )
        .with_reader(reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    tracing::info!(
        collector = export.collector,
        interval_secs = export.interval_secs,
        "metric export enabled"
    );
    Ok(meter_provider)
}

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

pub struct Metrics {
    pub http: HttpMetrics,
    pub core: CoreMetrics,
}

impl Metrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            http: HttpMetrics::new(meter),
            core: CoreMetrics::new(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    pub runs_submitted: Counter<u64>,
    pub runs_cancelled: Counter<u64>,
}

impl HttpMetrics {
    pub const LABEL: &'static str = "http";

    pub fn new(meter: &Meter) -> Self {
        Self {
            runs_submitted: meter
                .u64_counter(format!("{}_runs_submitted", Self::LABEL))
                .with_description("Runs submitted through the admission API")
                .build(),
            runs_cancelled: meter
                .u64_counter(format!("{}_runs_cancelled", Self::LABEL))
                .with_description("Runs cancelled through the admission API")
                .build(),
        }
    }

    pub fn increment_runs_submitted(&self) {
        self.runs_submitted.add(1, &[]);
    }

    pub fn increment_runs_cancelled(&self) {
        self.runs_cancelled.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct CoreMetrics {
    pub queue: QueueMetrics,
    pub registry: RegistryMetrics,
    pub scheduler: SchedulerMetrics,
    pub session: SessionMetrics,
    pub aggregator: AggregatorMetrics,
    pub bus: BusMetrics,
    pub admission: AdmissionMetrics,
}

impl CoreMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            queue: QueueMetrics::new(meter),
            registry: RegistryMetrics::new(meter),
            scheduler: SchedulerMetrics::new(meter),
            session: SessionMetrics::new(meter),
            aggregator: AggregatorMetrics::new(meter),
            bus: BusMetrics::new(meter),
            admission: AdmissionMetrics::new(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueMetrics {
    pub depth: UpDownCounter<i64>,
    pub total_admitted: Counter<u64>,
    pub total_popped: Counter<u64>,
}

impl QueueMetrics {
    pub const LABEL: &'static str = "queue";

    pub fn new(meter: &Meter) -> Self {
        Self {
            depth: meter
                .i64_up_down_counter(format!("{}_depth", Self::LABEL))
                .with_description("Pending shards currently queued")
                .build(),
            total_admitted: meter
                .u64_counter(format!("{}_total_admitted", Self::LABEL))
                .with_description("Total shards admitted to the queue")
                .build(),
            total_popped: meter
                .u64_counter(format!("{}_total_popped", Self::LABEL))
                .with_description("Total shards popped for assignment")
                .build(),
        }
    }

    pub fn record_admitted(&self) {
        self.depth.add(1, &[]);
        self.total_admitted.add(1, &[]);
    }

    pub fn record_removed(&self) {
        self.depth.add(-1, &[]);
    }

    pub fn record_popped(&self) {
        self.depth.add(-1, &[]);
        self.total_popped.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct RegistryMetrics {
    pub connected_agents: UpDownCounter<i64>,
    pub total_heartbeats: Counter<u64>,
    pub total_expired: Counter<u64>,
}

impl RegistryMetrics {
    pub const LABEL: &'static str = "registry";

    pub fn new(meter: &Meter) -> Self {
        Self {
            connected_agents: meter
                .i64_up_down_counter(format!("{}_connected_agents", Self::LABEL))
                .with_description("Agents currently registered and live")
                .build(),
            total_heartbeats: meter
                .u64_counter(format!("{}_total_heartbeats", Self::LABEL))
                .with_description("Total heartbeats received")
                .build(),
            total_expired: meter
                .u64_counter(format!("{}_total_expired", Self::LABEL))
                .with_description("Agents expired by the heartbeat sweep")
                .build(),
        }
    }

    pub fn increment_connected(&self) {
        self.connected_agents.add(1, &[]);
    }

    pub fn decrement_connected(&self) {
        self.connected_agents.add(-1, &[]);
    }

    pub fn increment_heartbeats(&self) {
        self.total_heartbeats.add(1, &[]);
    }

    pub fn increment_expired(&self) {
        self.total_expired.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerMetrics {
    pub total_decisions: Counter<u64>,
    pub decision_latency_seconds: Histogram<f64>,
    pub total_conflicts: Counter<u64>,
    pub total_offer_timeouts: Counter<u64>,
    pub total_start_timeouts: Counter<u64>,
    pub total_errors: Counter<u64>,
}

impl SchedulerMetrics {
    pub const LABEL: &'static str = "scheduler";

    pub fn new(meter: &Meter) -> Self {
        Self {
            total_decisions: meter
                .u64_counter(format!("{}_total_decisions", Self::LABEL))
                .with_description("Total matching decisions made")
                .build(),
            decision_latency_seconds: meter
                .f64_histogram(format!("{}_decision_latency_seconds", Self::LABEL))
                .with_description("Latency of one matching decision")
                .build(),
            total_conflicts: meter
                .u64_counter(format!("{}_total_conflicts", Self::LABEL))
                .with_description("Store CAS conflicts while assigning")
                .build(),
            total_offer_timeouts: meter
                .u64_counter(format!("{}_total_offer_timeouts", Self::LABEL))
                .with_description("Offers treated as refused after offer_timeout")
                .build(),
            total_start_timeouts: meter
                .u64_counter(format!("{}_total_start_timeouts", Self::LABEL))
                .with_description("Assignments released after start_timeout")
                .build(),
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn record_decision(&self, latency_seconds: f64) {
        self.total_decisions.add(1, &[]);
        self.decision_latency_seconds.record(latency_seconds, &[]);
    }

    pub fn increment_conflicts(&self) {
        self.total_conflicts.add(1, &[]);
    }

    pub fn increment_offer_timeouts(&self) {
        self.total_offer_timeouts.add(1, &[]);
    }

    pub fn increment_start_timeouts(&self) {
        self.total_start_timeouts.add(1, &[]);
    }

    pub fn increment_total_errors(&self) {
        self.total_errors.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct SessionMetrics {
    pub connected_sessions: UpDownCounter<i64>,
    pub total_frames: Counter<u64>,
    pub total_protocol_violations: Counter<u64>,
}

impl SessionMetrics {
    pub const LABEL: &'static str = "session";

    pub fn new(meter: &Meter) -> Self {
        Self {
            connected_sessions: meter
                .i64_up_down_counter(format!("{}_connected_sessions", Self::LABEL))
                .with_description("Open dispatch-stream sessions")
                .build(),
            total_frames: meter
                .u64_counter(format!("{}_total_frames", Self::LABEL))
                .with_description("Client frames received")
                .build(),
            total_protocol_violations: meter
                .u64_counter(format!("{}_total_protocol_violations", Self::LABEL))
                .with_description("Sessions rejected for breaking the frame protocol")
                .build(),
        }
    }

    pub fn increment_connected(&self) {
        self.connected_sessions.add(1, &[]);
    }

    pub fn decrement_connected(&self) {
        self.connected_sessions.add(-1, &[]);
    }

    pub fn increment_frames(&self) {
        self.total_frames.add(1, &[]);
    }

    pub fn increment_protocol_violations(&self) {
        self.total_protocol_violations.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct AggregatorMetrics {
    pub total_events: Counter<u64>,
    pub total_invalid_transitions: Counter<u64>,
    pub total_terminal_runs: Counter<u64>,
    pub total_late_frames: Counter<u64>,
    pub total_duplicates: Counter<u64>,
}

impl AggregatorMetrics {
    pub const LABEL: &'static str = "aggregator";

    pub fn new(meter: &Meter) -> Self {
        Self {
            total_events: meter
                .u64_counter(format!("{}_total_events", Self::LABEL))
                .with_description("Shard/result events absorbed")
                .build(),
            total_invalid_transitions: meter
                .u64_counter(format!("{}_total_invalid_transitions", Self::LABEL))
                .with_description("Transitions rejected by the run/shard state table")
                .build(),
            total_terminal_runs: meter
                .u64_counter(format!("{}_total_terminal_runs", Self::LABEL))
                .with_description("Runs that reached a terminal state")
                .build(),
            total_late_frames: meter
                .u64_counter(format!("{}_total_late_frames", Self::LABEL))
                .with_description("Frames dropped because the shard was already terminal")
                .build(),
            total_duplicates: meter
                .u64_counter(format!("{}_total_duplicates", Self::LABEL))
                .with_description("Replayed results, artifacts, and log chunks deduplicated")
                .build(),
        }
    }

    pub fn increment_events(&self) {
        self.total_events.add(1, &[]);
    }

    pub fn increment_invalid_transitions(&self) {
        self.total_invalid_transitions.add(1, &[]);
    }

    pub fn increment_terminal_runs(&self) {
        self.total_terminal_runs.add(1, &[]);
    }

    pub fn increment_late_frames(&self) {
        self.total_late_frames.add(1, &[]);
    }

    pub fn increment_duplicate(&self) {
        self.total_duplicates.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct BusMetrics {
    pub subscribers: UpDownCounter<i64>,
    pub total_published: Counter<u64>,
    pub total_slow_consumer_drops: Counter<u64>,
}

impl BusMetrics {
    pub const LABEL: &'static str = "bus";

    pub fn new(meter: &Meter) -> Self {
        Self {
            subscribers: meter
                .i64_up_down_counter(format!("{}_subscribers", Self::LABEL))
                .with_description("Connected event-bus subscribers")
                .build(),
            total_published: meter
                .u64_counter(format!("{}_total_published", Self::LABEL))
                .with_description("Events published across all topics")
                .build(),
            total_slow_consumer_drops: meter
                .u64_counter(format!("{}_total_slow_consumer_drops", Self::LABEL))
                .with_description("Subscribers disconnected for overflowing their buffer")
                .build(),
        }
    }

    pub fn increment_subscribers(&self) {
        self.subscribers.add(1, &[]);
    }

    pub fn decrement_subscribers(&self) {
        self.subscribers.add(-1, &[]);
    }

    pub fn increment_published(&self) {
        self.total_published.add(1, &[]);
    }

    pub fn increment_slow_consumer_drops(&self) {
        self.total_slow_consumer_drops.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    pub total_admitted: Counter<u64>,
    pub total_rejected: Counter<u64>,
    pub total_schedule_fires: Counter<u64>,
}

impl AdmissionMetrics {
    pub const LABEL: &'static str = "admission";

    pub fn new(meter: &Meter) -> Self {
        Self {
            total_admitted: meter
                .u64_counter(format!("{}_total_admitted", Self::LABEL))
                .with_description("Runs admitted")
                .build(),
            total_rejected: meter
                .u64_counter(format!("{}_total_rejected", Self::LABEL))
                .with_description("Admission requests rejected by validation")
                .build(),
            total_schedule_fires: meter
                .u64_counter(format!("{}_total_schedule_fires", Self::LABEL))
                .with_description("Schedules that fired an admission")
                .build(),
        }
    }

    pub fn increment_admitted(&self) {
        self.total_admitted.add(1, &[]);
    }

    pub fn increment_rejected(&self) {
        self.total_rejected.add(1, &[]);
    }

    pub fn increment_schedule_fires(&self) {
        self.total_schedule_fires.add(1, &[]);
    }
}
