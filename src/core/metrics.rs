use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub const ATTEMPTS_STARTED: &str = "attempts_started_total";
pub const ATTEMPTS_FINISHED: &str = "attempts_finished_total";
pub const ATTEMPTS_ABANDONED: &str = "attempts_abandoned_total";
pub const ATTEMPTS_OVERDUE: &str = "attempts_overdue_total";
pub const OUT_OF_SEQUENCE: &str = "attempt_submissions_out_of_sequence_total";
pub const ITEMS_REDONE: &str = "attempt_items_redone_total";
pub const ATTEMPTS_RECHECKED: &str = "attempts_rechecked_total";

/// Installs the Prometheus recorder when enabled. Without a recorder the
/// `metrics` macros are no-ops, which is what tests rely on.
pub fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    if PROM_HANDLE.set(handle).is_err() {
        tracing::warn!("Prometheus recorder already installed");
    }
    Ok(())
}

/// Current exposition text for an embedding HTTP layer to serve.
pub fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}
