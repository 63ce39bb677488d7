use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::daemon::{spawn_periodic, DaemonConfig};
use crate::{message, AppState, CoreError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub promoted: usize,
    pub failed: usize,
}

/// Promote every scheduled message due at `now` and broadcast it.
///
/// Promotion is conditional in the store, so overlapping sweeps broadcast
/// each message once. One failing message does not stop the rest.
pub async fn run_sweep(state: &AppState, now: DateTime<Utc>, batch_size: i64) -> Result<SweepReport, CoreError> {
    let due = parley_db::messages::find_due_scheduled(&state.db, now, batch_size).await?;
    let mut report = SweepReport::default();
    for row in due {
        match promote(state, row.id, now).await {
            Ok(true) => report.promoted += 1,
            Ok(false) => tracing::debug!(message_id = row.id, "scheduled message already promoted"),
            Err(err) => {
                report.failed += 1;
                tracing::warn!(message_id = row.id, error = %err, "failed to promote scheduled message");
            }
        }
    }
    if report.promoted > 0 || report.failed > 0 {
        tracing::info!(promoted = report.promoted, failed = report.failed, "scheduler sweep finished");
    }
    Ok(report)
}

async fn promote(state: &AppState, message_id: i64, now: DateTime<Utc>) -> Result<bool, CoreError> {
    let Some(row) = parley_db::messages::promote_scheduled(&state.db, message_id, now).await? else {
        return Ok(false);
    };
    let message = message::hydrate(state, vec![row])
        .await?
        .pop()
        .ok_or(CoreError::NotFound("message"))?;
    message::broadcast_new(state, &message, None);
    Ok(true)
}

pub fn spawn(state: AppState, config: DaemonConfig) -> Option<JoinHandle<()>> {
    if !config.enabled {
        tracing::info!("scheduler disabled");
        return None;
    }
    Some(spawn_periodic("scheduler", state, config.interval, move |state| async move {
        if let Err(err) = run_sweep(&state, Utc::now(), config.batch_size).await {
            tracing::error!(error = %err, "scheduler sweep failed");
        }
    }))
}
