use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "atelier_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "atelier_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "atelier_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "atelier_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "atelier_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "atelier_tenants_active";

/// Counter: startup/auth failures (bad login name format included).
pub const AUTH_FAILURES_TOTAL: &str = "atelier_auth_failures_total";

/// Counter: slots created by materialization (on-demand + background).
pub const SLOTS_MATERIALIZED_TOTAL: &str = "atelier_slots_materialized_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "atelier_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "atelier_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertOwner { .. } => "insert_owner",
        Command::UpdateOwner { .. } => "update_owner",
        Command::DeleteOwner { .. } => "delete_owner",
        Command::UpsertTemplate { .. } => "upsert_template",
        Command::DeleteTemplate { .. } => "delete_template",
        Command::Materialize { .. } => "materialize",
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::UpdateScheduleStatus { .. } => "update_schedule_status",
        Command::MoveSchedule { .. } => "move_schedule",
        Command::SelectOwners => "select_owners",
        Command::SelectTemplates { .. } => "select_templates",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSchedules { .. } => "select_schedules",
    }
}
