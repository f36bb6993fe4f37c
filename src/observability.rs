use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings successfully created.
pub const BOOKINGS_CREATED_TOTAL: &str = "reserva_bookings_created_total";

/// Counter: bookings cancelled (explicitly or by a declined consultation).
pub const BOOKINGS_CANCELLED_TOTAL: &str = "reserva_bookings_cancelled_total";

/// Counter: reservations refused because a cell was full.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "reserva_reservation_conflicts_total";

/// Counter: open-slot listings served.
pub const OPEN_SLOT_QUERIES_TOTAL: &str = "reserva_open_slot_queries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reserva_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reserva_wal_flush_batch_size";

/// Install the fmt tracing subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Install the Prometheus metrics exporter on the given port. No-op if
/// `port` is None.
pub fn init_metrics(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
