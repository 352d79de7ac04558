use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "careslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "careslot_query_duration_seconds";

/// Counter: engine errors returned to clients. Labels: kind.
pub const ERRORS_TOTAL: &str = "careslot_errors_total";

/// Counter: refused writes that lost to existing state. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "careslot_conflicts_total";

// ── Domain counters ─────────────────────────────────────────────

/// Counter: availability windows published.
pub const WINDOWS_CREATED_TOTAL: &str = "careslot_windows_created_total";

/// Counter: successful reservations.
pub const RESERVATIONS_TOTAL: &str = "careslot_reservations_total";

/// Counter: ended, unbooked windows removed by the sweeper.
pub const WINDOWS_REAPED_TOTAL: &str = "careslot_windows_reaped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "careslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "careslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "careslot_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "careslot_tenants_active";

/// Counter: logins that could not be mapped to an actor.
pub const AUTH_FAILURES_TOTAL: &str = "careslot_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "careslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "careslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertAvailability { .. } => "insert_availability",
        Command::DeleteAvailability { .. } => "delete_availability",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertAccount { .. } => "insert_account",
        Command::GrantRole { .. } => "grant_role",
        Command::RevokeRole { .. } => "revoke_role",
        Command::SelectAccount { .. } => "select_account",
        Command::InsertAttendance { .. } => "insert_attendance",
        Command::ReserveAttendance { .. } => "reserve_attendance",
        Command::UpdateAttendance { .. } => "update_attendance",
        Command::SelectAttendances { .. } => "select_attendances",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}

/// Label for [`CONFLICTS_TOTAL`]. `None` for errors that aren't conflicts.
pub fn conflict_label(err: &EngineError) -> Option<&'static str> {
    match err {
        EngineError::Overlap(_) => Some("overlap"),
        EngineError::AlreadyExists(_) => Some("already_exists"),
        EngineError::AlreadyBooked(_) => Some("already_booked"),
        EngineError::AlreadyScheduled(_) => Some("already_scheduled"),
        _ => None,
    }
}
