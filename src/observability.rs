use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reservas_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reservas_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservation creates/moves refused by the engine. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "reservas_reservations_rejected_total";

/// Counter: attendance registered against a pass with no credit left.
pub const ATTENDANCE_WARNINGS_TOTAL: &str = "reservas_attendance_warnings_total";

/// Counter: write-lock acquisitions that gave up after all attempts.
pub const LOCK_TIMEOUTS_TOTAL: &str = "reservas_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservas_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservas_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservas_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "reservas_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservas_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservas_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSpace { .. } => "insert_space",
        Command::UpdateSpace { .. } => "update_space",
        Command::DeleteSpace { .. } => "delete_space",
        Command::SelectSpaces { .. } => "select_spaces",
        Command::InsertPass { .. } => "insert_pass",
        Command::UpdatePass { .. } => "update_pass",
        Command::DeletePass { .. } => "delete_pass",
        Command::SelectPasses { .. } => "select_passes",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::MoveReservation { .. } => "move_reservation",
        Command::AttendReservation { .. } => "attend_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::InsertAttendance { .. } => "insert_attendance",
        Command::UpdateAttendance { .. } => "update_attendance",
        Command::DeleteAttendance { .. } => "delete_attendance",
        Command::SelectAttendance { .. } => "select_attendance",
        Command::SelectOccupancy { .. } => "select_occupancy",
    }
}
