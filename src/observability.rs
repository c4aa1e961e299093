use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeep_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Counter: admin statements refused to non-admin sessions.
pub const AUTH_FAILURES_TOTAL: &str = "innkeep_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: reservations persisted.
pub const BOOKINGS_TOTAL: &str = "innkeep_bookings_total";

/// Counter: bookings or blocks refused because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "innkeep_slot_conflicts_total";

/// Counter: calendar reconciliation steps. Labels: action.
pub const RECONCILE_ACTIONS_TOTAL: &str = "innkeep_reconcile_actions_total";

/// Counter: mail delivery attempts. Labels: outcome.
pub const NOTIFICATIONS_TOTAL: &str = "innkeep_notifications_total";

/// Counter: notification jobs refused at enqueue.
pub const NOTIFY_QUEUE_REJECTED_TOTAL: &str = "innkeep_notify_queue_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectOpenings { .. } => "select_openings",
        Command::InsertDraft { .. } => "insert_draft",
        Command::UpdateDraft { .. } => "update_draft",
        Command::SelectDraft => "select_draft",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SelectSummary => "select_summary",
        Command::InsertRoom { .. } => "insert_room",
        Command::SelectReservations { .. } => "select_reservations",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::UpdateCalendar { .. } => "update_calendar",
        Command::InsertBlock { .. } => "insert_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::SelectRestrictions { .. } => "select_restrictions",
    }
}
