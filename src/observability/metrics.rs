use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub bookings_total: IntCounterVec,
    pub match_latency_seconds: HistogramVec,
    pub reservation_conflicts_total: IntCounter,
    pub bookings_in_queue: IntGauge,
    pub booking_transitions_total: IntCounterVec,
    pub position_updates_total: IntCounter,
    pub realtime_connections: IntGauge,
    pub realtime_rooms: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bookings_total = IntCounterVec::new(
            Opts::new("bookings_total", "Bookings created by initial outcome"),
            &["outcome"],
        )
        .expect("valid bookings_total metric");

        let match_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "match_latency_seconds",
                "Latency of match-and-reserve attempts in seconds",
            ),
            &["outcome"],
        )
        .expect("valid match_latency_seconds metric");

        let reservation_conflicts_total = IntCounter::new(
            "reservation_conflicts_total",
            "Reservations lost to a concurrent booking",
        )
        .expect("valid reservation_conflicts_total metric");

        let bookings_in_queue =
            IntGauge::new("bookings_in_queue", "Bookings waiting in the dispatch queue")
                .expect("valid bookings_in_queue metric");

        let booking_transitions_total = IntCounterVec::new(
            Opts::new("booking_transitions_total", "Booking status transitions by target"),
            &["to"],
        )
        .expect("valid booking_transitions_total metric");

        let position_updates_total = IntCounter::new(
            "position_updates_total",
            "Driver position updates accepted",
        )
        .expect("valid position_updates_total metric");

        let realtime_connections =
            IntGauge::new("realtime_connections", "Open realtime connections")
                .expect("valid realtime_connections metric");

        let realtime_rooms = IntGauge::new("realtime_rooms", "Booking rooms with subscribers")
            .expect("valid realtime_rooms metric");

        registry
            .register(Box::new(bookings_total.clone()))
            .expect("register bookings_total");
        registry
            .register(Box::new(match_latency_seconds.clone()))
            .expect("register match_latency_seconds");
        registry
            .register(Box::new(reservation_conflicts_total.clone()))
            .expect("register reservation_conflicts_total");
        registry
            .register(Box::new(bookings_in_queue.clone()))
            .expect("register bookings_in_queue");
        registry
            .register(Box::new(booking_transitions_total.clone()))
            .expect("register booking_transitions_total");
        registry
            .register(Box::new(position_updates_total.clone()))
            .expect("register position_updates_total");
        registry
            .register(Box::new(realtime_connections.clone()))
            .expect("register realtime_connections");
        registry
            .register(Box::new(realtime_rooms.clone()))
            .expect("register realtime_rooms");

        Self {
            registry,
            bookings_total,
            match_latency_seconds,
            reservation_conflicts_total,
            bookings_in_queue,
            booking_transitions_total,
            position_updates_total,
            realtime_connections,
            realtime_rooms,
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
