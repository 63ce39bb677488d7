use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use parley_core::daemon::DaemonConfig;
use parley_core::{AppConfig, InvitePolicy};
use parley_ws::GatewayConfig;
use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub invites: InviteConfig,
    #[serde(default)]
    pub scheduler: DaemonSection,
    #[serde(default)]
    pub cleanup: DaemonSection,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Public URL of this server (e.g., https://chat.example.com).
    /// Used to build invite links.
    pub public_url: Option<String>,
    /// Snowflake worker id; must be unique per process sharing a database.
    #[serde(default)]
    pub worker_id: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            public_url: None,
            worker_id: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,
    #[serde(default = "default_true")]
    pub registration_enabled: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            jwt_expiry_seconds: default_jwt_expiry(),
            registration_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            url_prefix: default_url_prefix(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GatewaySection {
    #[serde(flatten)]
    pub limits: GatewayConfig,
    /// Recent messages sent with a `joinRoom` snapshot.
    #[serde(default = "default_snapshot_message_limit")]
    pub snapshot_message_limit: i64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            limits: GatewayConfig::default(),
            snapshot_message_limit: default_snapshot_message_limit(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InviteConfig {
    #[serde(default = "default_invite_ttl_days")]
    pub ttl_days: i64,
    /// 0 means unlimited until expiry.
    #[serde(default = "default_invite_max_uses")]
    pub max_uses: i64,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_invite_ttl_days(),
            max_uses: default_invite_max_uses(),
        }
    }
}

impl InviteConfig {
    pub fn policy(&self) -> InvitePolicy {
        InvitePolicy {
            ttl_days: self.ttl_days.max(1),
            max_uses: (self.max_uses > 0).then_some(self.max_uses),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_daemon_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_daemon_batch_size")]
    pub batch_size: i64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_daemon_interval(),
            batch_size: default_daemon_batch_size(),
        }
    }
}

impl DaemonSection {
    pub fn daemon(&self) -> DaemonConfig {
        DaemonConfig {
            enabled: self.enabled,
            interval: Duration::from_secs(self.interval_seconds.max(1)),
            batch_size: self.batch_size.max(1),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EncryptionConfig {
    /// One-time prekeys generated per identity.
    #[serde(default = "default_prekey_batch")]
    pub prekey_batch: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            prekey_batch: default_prekey_batch(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: default_log_filter(),
        }
    }
}

fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 { b'0' + idx } else { b'a' + idx - 10 })
        })
        .collect()
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".into()
}
fn default_database_url() -> String {
    "sqlite://./data/parley.db?mode=rwc".into()
}
fn default_max_connections() -> u32 {
    20
}
fn default_jwt_expiry() -> u64 {
    7 * 24 * 3600
}
fn default_true() -> bool {
    true
}
fn default_storage_path() -> String {
    "./data/uploads".into()
}
fn default_url_prefix() -> String {
    "/files".into()
}
fn default_snapshot_message_limit() -> i64 {
    50
}
fn default_invite_ttl_days() -> i64 {
    7
}
fn default_invite_max_uses() -> i64 {
    1
}
fn default_daemon_interval() -> u64 {
    60
}
fn default_daemon_batch_size() -> i64 {
    500
}
fn default_prekey_batch() -> usize {
    parley_core::e2ee::DEFAULT_PREKEY_BATCH
}
fn default_log_filter() -> String {
    "parley=info,tower_http=info".into()
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

impl Config {
    /// Read the config file, writing a fresh template first if none exists.
    /// `PARLEY_*` environment variables override file values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config_path = Path::new(path);

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            if let Some(parent) = config_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(config_path, default_template(&config))?;
            tracing::info!("Generated default config at {}", path);
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("PARLEY_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("PARLEY_PUBLIC_URL") {
            self.server.public_url = Some(value).filter(|url| !url.trim().is_empty());
        }
        if let Some(value) = env_parse("PARLEY_WORKER_ID") {
            self.server.worker_id = value;
        }
        if let Ok(value) = std::env::var("PARLEY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = env_parse("PARLEY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = value;
        }
        if let Ok(value) = std::env::var("PARLEY_JWT_SECRET") {
            self.auth.jwt_secret = value;
        }
        if let Some(value) = env_parse("PARLEY_JWT_EXPIRY_SECONDS") {
            self.auth.jwt_expiry_seconds = value;
        }
        if let Some(value) = env_parse("PARLEY_REGISTRATION_ENABLED") {
            self.auth.registration_enabled = value;
        }
        if let Ok(value) = std::env::var("PARLEY_STORAGE_PATH") {
            self.storage.path = value;
        }
        if let Some(value) = env_parse("PARLEY_INVITE_TTL_DAYS") {
            self.invites.ttl_days = value;
        }
        if let Some(value) = env_parse("PARLEY_INVITE_MAX_USES") {
            self.invites.max_uses = value;
        }

        if let Some(value) = env_parse("PARLEY_SCHEDULER_ENABLED") {
            self.scheduler.enabled = value;
        }
        if let Some(value) = env_parse("PARLEY_SCHEDULER_INTERVAL_SECONDS") {
            self.scheduler.interval_seconds = value;
        }
        if let Some(value) = env_parse("PARLEY_SCHEDULER_BATCH_SIZE") {
            self.scheduler.batch_size = value;
        }
        if let Some(value) = env_parse("PARLEY_CLEANUP_ENABLED") {
            self.cleanup.enabled = value;
        }
        if let Some(value) = env_parse("PARLEY_CLEANUP_INTERVAL_SECONDS") {
            self.cleanup.interval_seconds = value;
        }
        if let Some(value) = env_parse("PARLEY_CLEANUP_BATCH_SIZE") {
            self.cleanup.batch_size = value;
        }

        let gateway = &mut self.gateway.limits;
        if let Some(value) = env_parse("PARLEY_GATEWAY_HEARTBEAT_INTERVAL_MS") {
            gateway.heartbeat_interval_ms = value;
        }
        if let Some(value) = env_parse("PARLEY_GATEWAY_HEARTBEAT_TIMEOUT_MS") {
            gateway.heartbeat_timeout_ms = value;
        }
        if let Some(value) = env_parse("PARLEY_GATEWAY_MAX_CONNECTIONS") {
            gateway.max_connections = value;
        }
        if let Some(value) = env_parse("PARLEY_GATEWAY_MAX_CONNECTIONS_PER_USER") {
            gateway.max_connections_per_user = value;
        }
        if let Some(value) = env_parse("PARLEY_GATEWAY_MESSAGES_PER_MINUTE") {
            gateway.messages_per_minute = value;
        }
        if let Some(value) = env_parse("PARLEY_GATEWAY_TYPING_PER_MINUTE") {
            gateway.typing_per_minute = value;
        }

        if let Some(value) = env_parse("PARLEY_LOG_FORMAT") {
            self.logging.format = value;
        }
    }

    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            jwt_secret: self.auth.jwt_secret.clone(),
            jwt_expiry_seconds: self.auth.jwt_expiry_seconds,
            registration_enabled: self.auth.registration_enabled,
            public_url: self.server.public_url.clone(),
            worker_id: self.server.worker_id,
            invites: self.invites.policy(),
            snapshot_message_limit: self.gateway.snapshot_message_limit.max(0),
            storage_path: self.storage.path.clone(),
            prekey_batch: self.encryption.prekey_batch.max(1),
        }
    }
}

fn default_template(config: &Config) -> String {
    let gateway = &config.gateway.limits;
    format!(
        r#"# Parley Server Configuration

[server]
bind_address = "{bind}"
# public_url = "https://chat.example.com"
worker_id = 0

[database]
url = "{db_url}"
max_connections = {max_conn}

[auth]
jwt_secret = "{jwt_secret}"
jwt_expiry_seconds = {jwt_expiry}
registration_enabled = true

[storage]
path = "{storage_path}"
url_prefix = "{url_prefix}"

[gateway]
heartbeat_interval_ms = {hb_interval}
heartbeat_timeout_ms = {hb_timeout}
identify_timeout_ms = {identify}
max_connections = {gw_max}
max_connections_per_user = {gw_per_user}
messages_per_minute = {msg_rate}
typing_per_minute = {typing_rate}
snapshot_message_limit = {snapshot}

[invites]
ttl_days = {ttl_days}
# 0 = unlimited until expiry
max_uses = {max_uses}

[scheduler]
enabled = true
interval_seconds = {interval}
batch_size = {batch}

[cleanup]
enabled = true
interval_seconds = {interval}
batch_size = {batch}

[encryption]
prekey_batch = {prekeys}

[logging]
# "text" or "json"
format = "text"
filter = "{filter}"
"#,
        bind = config.server.bind_address,
        db_url = config.database.url,
        max_conn = config.database.max_connections,
        jwt_secret = config.auth.jwt_secret,
        jwt_expiry = config.auth.jwt_expiry_seconds,
        storage_path = config.storage.path,
        url_prefix = config.storage.url_prefix,
        hb_interval = gateway.heartbeat_interval_ms,
        hb_timeout = gateway.heartbeat_timeout_ms,
        identify = gateway.identify_timeout_ms,
        gw_max = gateway.max_connections,
        gw_per_user = gateway.max_connections_per_user,
        msg_rate = gateway.messages_per_minute,
        typing_rate = gateway.typing_per_minute,
        snapshot = config.gateway.snapshot_message_limit,
        ttl_days = config.invites.ttl_days,
        max_uses = config.invites.max_uses,
        interval = default_daemon_interval(),
        batch = default_daemon_batch_size(),
        prekeys = config.encryption.prekey_batch,
        filter = config.logging.filter,
    )
}
