use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "hotelier_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "hotelier_query_duration_seconds";

// ── Resource metrics ────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "hotelier_connections_active";
pub const CONNECTIONS_TOTAL: &str = "hotelier_connections_total";

/// Counter: connections turned away at the connection cap.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "hotelier_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "hotelier_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "hotelier_wal_flush_duration_seconds";

/// Histogram: frames per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "hotelier_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "hotelier_bookings_created_total";

/// Counter: booking status changes. Labels: from, to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "hotelier_booking_transitions_total";

/// Counter: payment state changes. Labels: outcome.
pub const PAYMENTS_TOTAL: &str = "hotelier_payments_total";

/// Counter: bookings checked out by the sweeper.
pub const AUTO_CHECKOUTS_TOTAL: &str = "hotelier_auto_checkouts_total";

#[derive(Debug, thiserror::Error)]
#[error("failed to install Prometheus exporter on port {port}: {source}")]
pub struct MetricsInitError {
    port: u16,
    #[source]
    source: metrics_exporter_prometheus::BuildError,
}

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), MetricsInitError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|source| MetricsInitError { port, source })?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, used on query metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom(_) => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectRoomTypes => "select_room_types",
        Command::SelectAvailableRooms { .. } => "select_available_rooms",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertBooking(_) => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::CancelOwnBooking { .. } => "cancel_own_booking",
        Command::InsertPayment(_) => "insert_payment",
        Command::ConfirmPayment { .. } => "confirm_payment",
        Command::CancelPayment { .. } => "cancel_payment",
        Command::RefundPayment { .. } => "refund_payment",
        Command::DeletePayment { .. } => "delete_payment",
        Command::SelectPayments { .. } => "select_payments",
        Command::BeginGatewayPayment { .. } => "begin_gateway_payment",
        Command::GatewayCallback { .. } => "gateway_callback",
        Command::SelectDashboard => "select_dashboard",
    }
}
