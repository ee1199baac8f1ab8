use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub bids_total: IntCounterVec,
    pub order_transitions_total: IntCounterVec,
    pub acceptance_latency_seconds: HistogramVec,
    pub connections_active: IntGauge,
    pub fanout_frames_total: IntCounterVec,
    pub location_samples_total: IntCounterVec,
    pub notifications_in_queue: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bids_total = IntCounterVec::new(
            Opts::new("bids_total", "Bid placements by outcome"),
            &["outcome"],
        )
        .expect("valid bids_total metric");

        let order_transitions_total = IntCounterVec::new(
            Opts::new(
                "order_transitions_total",
                "Order status transitions by target status",
            ),
            &["status"],
        )
        .expect("valid order_transitions_total metric");

        let acceptance_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "acceptance_latency_seconds",
                "Latency of bid acceptance in seconds",
            ),
            &["outcome"],
        )
        .expect("valid acceptance_latency_seconds metric");

        let connections_active =
            IntGauge::new("connections_active", "Currently registered connections")
                .expect("valid connections_active metric");

        let fanout_frames_total = IntCounterVec::new(
            Opts::new("fanout_frames_total", "Outbound frames by delivery outcome"),
            &["outcome"],
        )
        .expect("valid fanout_frames_total metric");

        let location_samples_total = IntCounterVec::new(
            Opts::new("location_samples_total", "Driver location samples by outcome"),
            &["outcome"],
        )
        .expect("valid location_samples_total metric");

        let notifications_in_queue = IntGauge::new(
            "notifications_in_queue",
            "Notifications waiting for delivery",
        )
        .expect("valid notifications_in_queue metric");

        registry
            .register(Box::new(bids_total.clone()))
            .expect("register bids_total");
        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(acceptance_latency_seconds.clone()))
            .expect("register acceptance_latency_seconds");
        registry
            .register(Box::new(connections_active.clone()))
            .expect("register connections_active");
        registry
            .register(Box::new(fanout_frames_total.clone()))
            .expect("register fanout_frames_total");
        registry
            .register(Box::new(location_samples_total.clone()))
            .expect("register location_samples_total");
        registry
            .register(Box::new(notifications_in_queue.clone()))
            .expect("register notifications_in_queue");

        Self {
            registry,
            bids_total,
            order_transitions_total,
            acceptance_latency_seconds,
            connections_active,
            fanout_frames_total,
            location_samples_total,
            notifications_in_queue,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
