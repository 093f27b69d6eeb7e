//! Presence reconciliation.
//!
//! Presence is the number of connected producers per topic. The tracker
//! periodically snapshots the registry, compares it with the snapshot it
//! persisted on the previous tick, and reports topics that lost their last
//! producer.

use crate::registry::ConnectionRegistry;
use crate::store::{load_or_default, save, KeyValueStore, StoreError};
use crate::subscriptions::Topic;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Key the previous snapshot is persisted under.
pub const PRESENCE_KEY: &str = "connections";

/// Default reconciliation period.
pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_secs(3);

/// Number of connected producers per topic.
pub type PresenceSnapshot = BTreeMap<Topic, usize>;

/// Topics live in `previous` with no producers in `current`, in order.
#[must_use]
pub fn silent_topics(previous: &PresenceSnapshot, current: &PresenceSnapshot) -> Vec<Topic> {
    previous
        .keys()
        .filter(|topic| current.get(*topic).copied().unwrap_or(0) == 0)
        .cloned()
        .collect()
}

/// Periodic presence reconciliation.
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn KeyValueStore>,
    period: Duration,
}

impl PresenceTracker {
    /// Create a tracker ticking every `period`.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn KeyValueStore>,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            period,
        }
    }

    /// The reconciliation period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one reconciliation and return the topics that went silent.
    ///
    /// The current snapshot is persisted whether or not anything changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the previous snapshot cannot be read or the
    /// current one cannot be written.
    pub async fn tick(&self) -> Result<Vec<Topic>, StoreError> {
        let previous: PresenceSnapshot =
            load_or_default(self.store.as_ref(), PRESENCE_KEY).await?;
        let current = self.registry.snapshot_by_topic();

        let silent = silent_topics(&previous, &current);
        for topic in &silent {
            info!(topic = %topic, "CC no longer live");
        }

        save(self.store.as_ref(), PRESENCE_KEY, &current).await?;

        debug!(live_topics = current.len(), silent = silent.len(), "Presence reconciled");
        Ok(silent)
    }

    /// Tick forever, first tick one period from now. Failed ticks are logged
    /// and retried on the next period.
    pub async fn run(self) {
        self.run_with(|_| {}).await;
    }

    /// Tick forever, handing the topics that went silent on each successful
    /// tick to `on_silent`.
    pub async fn run_with<F>(self, mut on_silent: F)
    where
        F: FnMut(&[Topic]) + Send,
    {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(silent) => on_silent(&silent),
                Err(e) => warn!(error = %e, "Presence reconciliation failed"),
            }
        }
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Spawn [`run_with`](Self::run_with) onto the runtime.
    #[must_use]
    pub fn spawn_with<F>(self, on_silent: F) -> JoinHandle<()>
    where
        F: FnMut(&[Topic]) + Send + 'static,
    {
        tokio::spawn(self.run_with(on_silent))
    }
}
