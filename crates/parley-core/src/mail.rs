use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::CoreError;

/// An invitation ready to be delivered.
#[derive(Debug, Clone)]
pub struct InviteEmail {
    pub to: String,
    pub room_name: String,
    pub inviter_name: String,
    pub token: String,
    /// Absolute accept link when the server knows its public URL.
    pub accept_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Outbound email collaborator.
pub trait Mailer: Send + Sync {
    fn send_invite<'a>(&'a self, email: &'a InviteEmail) -> BoxFuture<'a, Result<(), CoreError>>;
}

/// Writes invitations to the log instead of sending them.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send_invite<'a>(&'a self, email: &'a InviteEmail) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            tracing::info!(
                to = %email.to,
                room = %email.room_name,
                inviter = %email.inviter_name,
                expires_at = %email.expires_at,
                link = email.accept_url.as_deref().unwrap_or("-"),
                "room invite issued"
            );
            Ok(())
        })
    }
}

pub fn accept_url(public_url: Option<&str>, token: &str) -> Option<String> {
    public_url.map(|base| format!("{}/invite/{token}", base.trim_end_matches('/')))
}
