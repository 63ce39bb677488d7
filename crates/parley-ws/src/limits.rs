use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::Deserialize;

const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Gateway tuning, loaded from the `[gateway]` config section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this closes the connection.
    pub heartbeat_timeout_ms: u64,
    /// How long an unauthenticated connection may wait before `authenticate`.
    pub identify_timeout_ms: u64,
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    /// Every client event except heartbeats counts against this.
    pub messages_per_minute: u32,
    pub typing_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 41_250,
            heartbeat_timeout_ms: 90_000,
            identify_timeout_ms: 30_000,
            max_connections: 2_000,
            max_connections_per_user: 5,
            messages_per_minute: 240,
            typing_per_minute: 120,
        }
    }
}

fn per_minute(count: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(count).unwrap_or(NonZeroU32::MIN))
}

/// Which bucket a client event draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LimitClass {
    Message,
    Typing,
}

/// Shared state of one mounted gateway: connection slots and per-user rate limits.
///
/// Limits are keyed by user, not connection, so opening more tabs does not buy more budget.
pub(crate) struct Gateway {
    pub(crate) config: GatewayConfig,
    active_connections: AtomicUsize,
    user_connections: DashMap<i64, usize>,
    messages: DefaultKeyedRateLimiter<i64>,
    typing: DefaultKeyedRateLimiter<i64>,
}

impl Gateway {
    pub(crate) fn new(config: GatewayConfig) -> Arc<Self> {
        let gateway = Arc::new(Self {
            messages: RateLimiter::keyed(per_minute(config.messages_per_minute)),
            typing: RateLimiter::keyed(per_minute(config.typing_per_minute)),
            active_connections: AtomicUsize::new(0),
            user_connections: DashMap::new(),
            config,
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(prune_limiters(Arc::downgrade(&gateway)));
        }
        gateway
    }

    /// Reserve a global slot; `None` means the gateway is full.
    pub(crate) fn try_open(self: &Arc<Self>) -> Option<ConnectionGuard> {
        let mut current = self.active_connections.load(AtomicOrdering::SeqCst);
        loop {
            if current >= self.config.max_connections {
                return None;
            }
            match self.active_connections.compare_exchange(
                current,
                current + 1,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(ConnectionGuard {
                        gateway: Arc::clone(self),
                        user_id: None,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn active_connections(&self) -> usize {
        self.active_connections.load(AtomicOrdering::SeqCst)
    }

    /// `Err(retry_after_ms)` when the user is over budget.
    pub(crate) fn check(&self, user_id: i64, class: LimitClass) -> Result<(), u64> {
        let now = DefaultClock::default().now();
        let limiter = match class {
            LimitClass::Message => &self.messages,
            LimitClass::Typing => &self.typing,
        };
        limiter
            .check_key(&user_id)
            .map_err(|not_until| not_until.wait_time_from(now).as_millis().max(1) as u64)
    }
}

async fn prune_limiters(gateway: Weak<Gateway>) {
    let mut interval = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(gateway) = gateway.upgrade() else {
            break;
        };
        gateway.messages.retain_recent();
        gateway.typing.retain_recent();
        gateway.messages.shrink_to_fit();
        gateway.typing.shrink_to_fit();
        tracing::trace!("rate limiter cleanup: pruned stale entries");
    }
}

/// Releases the connection's global and per-user slots on drop.
pub(crate) struct ConnectionGuard {
    gateway: Arc<Gateway>,
    user_id: Option<i64>,
}

impl ConnectionGuard {
    /// Claim a per-user slot once the user is known.
    pub(crate) fn bind_user(&mut self, user_id: i64) -> bool {
        let mut count = self.gateway.user_connections.entry(user_id).or_insert(0);
        if *count >= self.gateway.config.max_connections_per_user {
            return false;
        }
        *count += 1;
        self.user_id = Some(user_id);
        true
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(user_id) = self.user_id.take() {
            if let Some(mut count) = self.gateway.user_connections.get_mut(&user_id) {
                if *count <= 1 {
                    drop(count);
                    self.gateway.user_connections.remove(&user_id);
                } else {
                    *count -= 1;
                }
            }
        }
        self.gateway
            .active_connections
            .fetch_sub(1, AtomicOrdering::SeqCst);
    }
}
