//! Pairwise end-to-end sessions and the group mesh built on top of them.
//!
//! Every user gets an X25519 identity, an Ed25519-signed prekey and a batch
//! of one-time prekeys. A pairwise session is an X3DH-style agreement that
//! yields one symmetric chain per direction; messages are sealed with
//! AES-256-GCM under keys ratcheted from those chains. Groups are a full
//! mesh of pairwise sessions, so a group send is one ciphertext per peer.

mod manager;
mod session;
mod store;

pub use manager::{EncryptionManager, DEFAULT_PREKEY_BATCH};
pub use session::{Envelope, PreKeyBundle};

use thiserror::Error;

use crate::error::ErrorKind;
use crate::{AppState, CoreError};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("user {0} has not set up encryption")]
    IdentityMissing(i64),
    #[error("no session from {from} to {to}")]
    SessionNotFound { from: i64, to: i64 },
    #[error("group {0} has no encryption session")]
    GroupNotFound(i64),
    #[error("user {user} is not part of group {group}")]
    NotGroupMember { group: i64, user: i64 },
    #[error("group {group} is missing the session from {from} to {to}")]
    GroupSessionInvalid { group: i64, from: i64, to: i64 },
    #[error("signed prekey signature does not verify")]
    InvalidSignature,
    #[error("malformed envelope: {0}")]
    InvalidEnvelope(String),
    #[error("message could not be decrypted")]
    DecryptFailed,
    #[error("message counter too far ahead of the session")]
    TooManySkipped,
    #[error("cipher failure: {0}")]
    Cipher(String),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdentityMissing(_) | Self::SessionNotFound { .. } | Self::GroupNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::NotGroupMember { .. } => ErrorKind::Authorization,
            Self::GroupSessionInvalid { .. } => ErrorKind::Conflict,
            Self::InvalidSignature
            | Self::InvalidEnvelope(_)
            | Self::DecryptFailed
            | Self::TooManySkipped => ErrorKind::Validation,
            Self::Cipher(_) => ErrorKind::Transient,
        }
    }
}

async fn require_user(state: &AppState, user_id: i64) -> Result<(), CoreError> {
    parley_db::users::get_user(&state.db, user_id)
        .await?
        .map(|_| ())
        .ok_or(CoreError::NotFound("user"))
}

/// Set up the caller's identity keys and return their public bundle.
pub async fn setup_identity(state: &AppState, user_id: i64) -> Result<PreKeyBundle, CoreError> {
    require_user(state, user_id).await?;
    Ok(state.encryption.setup_user(user_id))
}

/// Hand out `target_id`'s bundle, consuming one of their one-time prekeys.
pub async fn fetch_bundle(state: &AppState, target_id: i64) -> Result<PreKeyBundle, CoreError> {
    require_user(state, target_id).await?;
    Ok(state.encryption.prekey_bundle(target_id)?)
}

/// Open a pairwise session from `user_id` to `peer_id`, setting up either identity on demand.
pub async fn establish_direct(state: &AppState, user_id: i64, peer_id: i64) -> Result<PreKeyBundle, CoreError> {
    if user_id == peer_id {
        return Err(CoreError::validation("cannot open a session with yourself"));
    }
    require_user(state, peer_id).await?;
    state.encryption.setup_user(user_id);
    let peer = state.encryption.setup_user(peer_id);
    state.encryption.establish_session(user_id, peer_id)?;
    tracing::info!(user_id, peer_id, "direct session established");
    Ok(peer)
}
