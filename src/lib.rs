//! Timed, multi-page graded test attempts: layout, navigation, timing and the
//! attempt state machine, with Postgres and in-memory persistence.

pub mod core;
pub mod db;
pub mod repositories;
pub mod services;
pub mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{config::Settings, state::WorkerState, telemetry};
use crate::repositories::attempts::PgAttemptStore;
use crate::services::attempts::AttemptService;

/// Runs the check-time sweep against Postgres until a shutdown signal arrives.
///
/// Without an item engine the worker cannot finish attempts itself; use
/// [`run_worker_with`] to also process overdue attempts.
pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let store = Arc::new(PgAttemptStore::new(db_pool.clone()));
    let state = WorkerState::new(settings, store, None);

    tracing::info!(
        environment = %state.settings().runtime().environment.as_str(),
        recheck_interval_seconds = state.settings().sweep().recheck_interval_seconds,
        "examflow worker started"
    );

    let result = tasks::scheduler::run(state).await;

    db_pool.close().await;
    tracing::info!("Database pool closed");

    result
}

/// Runs both background loops for an embedder that supplies the item engine.
pub async fn run_worker_with(attempts: AttemptService) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let state = WorkerState::new(settings, attempts.store().clone(), Some(attempts));

    tracing::info!(
        environment = %state.settings().runtime().environment.as_str(),
        overdue_interval_seconds = state.settings().sweep().overdue_interval_seconds,
        "examflow worker started with overdue processing"
    );

    tasks::scheduler::run(state).await
}
