use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::core::metrics;
use crate::core::shutdown::{broadcast_on_signal, shutdown_channel, ShutdownRx};
use crate::core::state::WorkerState;
use crate::core::time::primitive_now_utc;
use crate::repositories::OpenAttemptFilter;
use crate::services::attempts::AttemptService;

/// Upper bound on back-to-back overdue batches in one tick.
const MAX_DUE_BATCHES_PER_TICK: usize = 50;

pub async fn run(state: WorkerState) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let handles = spawn_loops(&state, &shutdown_rx);

    broadcast_on_signal(shutdown_tx).await;
    join_all(handles).await;
    Ok(())
}

pub(crate) fn spawn_loops(state: &WorkerState, shutdown: &ShutdownRx) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);
    handles.push(tokio::spawn(recheck_loop(state.clone(), shutdown.clone())));

    match state.attempts() {
        Some(attempts) => {
            handles.push(tokio::spawn(overdue_loop(
                state.clone(),
                attempts.clone(),
                shutdown.clone(),
            )));
        }
        None => tracing::warn!(
            "No item engine configured; overdue attempts are left to the embedding application"
        ),
    }
    handles
}

pub(crate) async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }
}

async fn recheck_loop(state: WorkerState, mut shutdown: ShutdownRx) {
    let mut tick = interval(Duration::from_secs(state.settings().sweep().recheck_interval_seconds));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = recheck_all(&state).await {
                    tracing::error!(error = %err, "recheck_open_attempts failed");
                }
            }
        }
    }
}

async fn recheck_all(state: &WorkerState) -> Result<u64> {
    let filter = OpenAttemptFilter::default();
    if let Some(attempts) = state.attempts() {
        return Ok(attempts.recheck_open_attempts(&filter).await?);
    }

    let touched = state.store().recheck_open_attempts(&filter).await?;
    ::metrics::counter!(metrics::ATTEMPTS_RECHECKED).increment(touched);
    tracing::info!(touched, "Rechecked open attempts");
    Ok(touched)
}

async fn overdue_loop(state: WorkerState, attempts: AttemptService, mut shutdown: ShutdownRx) {
    let sweep = *state.settings().sweep();
    let mut tick = interval(Duration::from_secs(sweep.overdue_interval_seconds));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => drain_due(&attempts, sweep.overdue_batch_size, &shutdown).await,
        }
    }
}

/// Keeps taking batches while they come back full and clean.
async fn drain_due(attempts: &AttemptService, batch_size: u32, shutdown: &ShutdownRx) {
    for _ in 0..MAX_DUE_BATCHES_PER_TICK {
        if *shutdown.borrow() {
            break;
        }

        match attempts.process_due_attempts(primitive_now_utc(), batch_size).await {
            Ok(summary) if summary.checked >= u64::from(batch_size) && summary.failed == 0 => {}
            Ok(_) => break,
            Err(err) => {
                tracing::error!(error = %err, "process_due_attempts failed");
                break;
            }
        }
    }
}
