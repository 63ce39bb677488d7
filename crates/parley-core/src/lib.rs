pub mod auth;
pub mod cleanup;
pub mod daemon;
pub mod e2ee;
pub mod error;
pub mod events;
pub mod files;
pub mod mail;
pub mod member_index;
pub mod message;
pub mod permissions;
pub mod presence;
pub mod room;
pub mod scheduler;
pub mod user;

pub use error::{CoreError, ErrorKind};

use chrono::{DateTime, Utc};
use parley_db::DbPool;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How room invitations behave.
#[derive(Clone, Debug)]
pub struct InvitePolicy {
    pub ttl_days: i64,
    /// `None` means unlimited until expiry.
    pub max_uses: Option<i64>,
}

impl Default for InvitePolicy {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            max_uses: Some(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    pub registration_enabled: bool,
    /// The public URL of this server, used for invite links.
    pub public_url: Option<String>,
    pub worker_id: u16,
    pub invites: InvitePolicy,
    /// Messages included in a `joinRoom` snapshot.
    pub snapshot_message_limit: i64,
    pub storage_path: String,
    pub prekey_batch: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut secret = [0_u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self {
            jwt_secret: secret.iter().map(|b| format!("{b:02x}")).collect(),
            jwt_expiry_seconds: 7 * 24 * 3600,
            registration_enabled: true,
            public_url: None,
            worker_id: 0,
            invites: InvitePolicy::default(),
            snapshot_message_limit: 50,
            storage_path: "./data/uploads".to_string(),
            prekey_batch: e2ee::DEFAULT_PREKEY_BATCH,
        }
    }
}

/// Cache key for slow mode: (room_id, user_id).
pub type SlowModeKey = (i64, i64);

/// Remembers each user's last send per room. Entries outlive any sane slow-mode window.
pub fn build_slow_mode_cache() -> moka::future::Cache<SlowModeKey, DateTime<Utc>> {
    moka::future::Cache::builder()
        .max_capacity(100_000)
        .time_to_live(Duration::from_secs(6 * 3600))
        .build()
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub event_bus: events::EventBus,
    pub config: AppConfig,
    /// Live gateway connections per user.
    pub presence: Arc<presence::PresenceRegistry>,
    pub typing: Arc<presence::TypingRegistry>,
    /// In-memory room->members index for zero-query presence dispatch.
    pub member_index: Arc<member_index::MemberIndex>,
    pub encryption: Arc<e2ee::EncryptionManager>,
    pub mailer: Arc<dyn mail::Mailer>,
    pub files: Arc<dyn files::FileStore>,
    pub slow_mode: moka::future::Cache<SlowModeKey, DateTime<Utc>>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        mailer: Arc<dyn mail::Mailer>,
        files: Arc<dyn files::FileStore>,
    ) -> Self {
        let encryption = Arc::new(e2ee::EncryptionManager::new(config.prekey_batch));
        Self {
            db,
            event_bus: events::EventBus::default(),
            config,
            presence: Arc::new(presence::PresenceRegistry::new()),
            typing: Arc::new(presence::TypingRegistry::new()),
            member_index: Arc::new(member_index::MemberIndex::empty()),
            encryption,
            mailer,
            files,
            slow_mode: build_slow_mode_cache(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Load in-memory indexes from the database.
    pub async fn warm(&self) -> Result<(), CoreError> {
        let memberships = parley_db::rooms::list_all_memberships(&self.db).await?;
        self.member_index.reload(memberships);
        Ok(())
    }

    pub fn next_id(&self) -> i64 {
        parley_util::snowflake::generate(self.config.worker_id)
    }
}
