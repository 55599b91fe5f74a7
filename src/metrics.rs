//! Prometheus metrics. Ambient observability, not a spec feature: the
//! spec's Non-goals exclude science-domain concerns, not instrumentation
//! of the dispatcher itself (see SPEC_FULL.md §1/§9).

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    pub workers_in_flight: IntGauge,
    pub workers_by_instrument: IntGaugeVec,
    pub admissions_total: IntCounterVec,
    pub classifications_total: IntCounterVec,
    pub heartbeats_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let workers_in_flight = IntGauge::new(
            "postprocess_workers_in_flight",
            "Number of worker subprocesses currently supervised",
        )
        .expect("valid metric");

        let workers_by_instrument = IntGaugeVec::new(
            Opts::new(
                "postprocess_workers_by_instrument",
                "Worker subprocesses currently supervised, by instrument",
            ),
            &["instrument"],
        )
        .expect("valid metric");

        let admissions_total = IntCounterVec::new(
            Opts::new(
                "postprocess_admissions_total",
                "Admission controller decisions",
            ),
            &["decision"],
        )
        .expect("valid metric");

        let classifications_total = IntCounterVec::new(
            Opts::new(
                "postprocess_classifications_total",
                "Worker exit classifications",
            ),
            &["outcome"],
        )
        .expect("valid metric");

        let heartbeats_total = IntCounterVec::new(
            Opts::new("postprocess_heartbeats_total", "Heartbeat publish attempts"),
            &["result"],
        )
        .expect("valid metric");

        registry
            .register(Box::new(workers_in_flight.clone()))
            .expect("register workers_in_flight");
        registry
            .register(Box::new(workers_by_instrument.clone()))
            .expect("register workers_by_instrument");
        registry
            .register(Box::new(admissions_total.clone()))
            .expect("register admissions_total");
        registry
            .register(Box::new(classifications_total.clone()))
            .expect("register classifications_total");
        registry
            .register(Box::new(heartbeats_total.clone()))
            .expect("register heartbeats_total");

        Self {
            registry,
            workers_in_flight,
            workers_by_instrument,
            admissions_total,
            classifications_total,
            heartbeats_total,
        }
    }

    /// Renders the registry in Prometheus text exposition format, used by
    /// the loopback `/metrics` endpoint (SPEC_FULL.md §9 resolution).
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .expect("metrics encode to valid utf8");
        String::from_utf8(buffer).expect("prometheus text encoding is UTF-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
