use chrono::{DateTime, Utc};
use parley_db::messages::MessageRow;
use parley_models::gateway::EVENT_MESSAGE_EXPIRED;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::daemon::{spawn_periodic, DaemonConfig};
use crate::{message, AppState, CoreError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub files_removed: usize,
    pub failed: usize,
    pub invites_purged: u64,
}

/// Hard-delete every message whose expiry has passed, with its attachment,
/// and announce each deletion once. Expired invites are purged too.
pub async fn run_sweep(state: &AppState, now: DateTime<Utc>, batch_size: i64) -> Result<CleanupReport, CoreError> {
    let expired = parley_db::messages::find_expired(&state.db, now, batch_size).await?;
    let mut report = CleanupReport::default();
    for row in expired {
        match parley_db::messages::delete_expired_message(&state.db, row.id, now).await {
            Ok(Some(deleted)) => {
                report.expired += 1;
                if remove_attachment(state, &deleted).await {
                    report.files_removed += 1;
                }
                announce(state, &deleted);
            }
            Ok(None) => tracing::debug!(message_id = row.id, "expired message already removed"),
            Err(err) => {
                report.failed += 1;
                tracing::warn!(message_id = row.id, error = %err, "failed to delete expired message");
            }
        }
    }

    match parley_db::invites::delete_expired_invites(&state.db, now).await {
        Ok(purged) => report.invites_purged = purged,
        Err(err) => tracing::warn!(error = %err, "failed to purge expired invites"),
    }

    if report.expired > 0 || report.failed > 0 || report.invites_purged > 0 {
        tracing::info!(
            expired = report.expired,
            files_removed = report.files_removed,
            failed = report.failed,
            invites_purged = report.invites_purged,
            "cleanup sweep finished"
        );
    }
    Ok(report)
}

async fn remove_attachment(state: &AppState, row: &MessageRow) -> bool {
    let Some(url) = row.metadata().file_url.filter(|url| !url.trim().is_empty()) else {
        return false;
    };
    match state.files.delete(&url).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(message_id = row.id, file_url = %url, error = %err, "failed to delete attachment");
            false
        }
    }
}

fn announce(state: &AppState, row: &MessageRow) {
    // Nobody but the sender ever saw a message that expired while still scheduled.
    if row.is_scheduled {
        return;
    }
    let message = row.to_message(Vec::new());
    message::publish(
        state,
        EVENT_MESSAGE_EXPIRED,
        &message,
        json!({
            "messageId": row.id.to_string(),
            "roomId": row.room_id.map(|id| id.to_string()),
            "channelId": row.channel_id.map(|id| id.to_string()),
            "recipientId": row.recipient_id.map(|id| id.to_string()),
        }),
        None,
    );
}

pub fn spawn(state: AppState, config: DaemonConfig) -> Option<JoinHandle<()>> {
    if !config.enabled {
        tracing::info!("cleanup disabled");
        return None;
    }
    Some(spawn_periodic("cleanup", state, config.interval, move |state| async move {
        if let Err(err) = run_sweep(&state, Utc::now(), config.batch_size).await {
            tracing::error!(error = %err, "cleanup sweep failed");
        }
    }))
}
