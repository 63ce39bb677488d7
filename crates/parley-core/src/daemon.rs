use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::AppState;

/// Settings shared by the periodic background sweeps.
#[derive(Debug, Clone, Copy)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

/// Run `tick` every `interval` until `state.shutdown` fires.
///
/// A tick in progress is allowed to finish before the task exits.
pub fn spawn_periodic<F, Fut>(name: &'static str, state: AppState, interval: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut(AppState) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let shutdown = state.shutdown.clone();
        let notified = shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(daemon = name, interval_secs = interval.as_secs(), "daemon started");
        loop {
            tokio::select! {
                _ = &mut notified => break,
                _ = ticker.tick() => tick(state.clone()).await,
            }
        }
        tracing::info!(daemon = name, "daemon stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn ticks_until_shutdown() {
        let state = crate::test_support::state().await;
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = spawn_periodic("test", state.clone(), Duration::from_millis(5), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        state.shutdown.notify_waiters();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}
