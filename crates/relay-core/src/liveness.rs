//! Heartbeat-based liveness detection.
//!
//! Every connection runs the same small state machine, driven by a single
//! periodic tick shared by all connections:
//!
//! ```text
//!            tick / ping              tick
//!   Alive ─────────────────▶ PendingPong ─────▶ Dead (evicted)
//!     ▲                          │
//!     └──────────── pong ────────┘
//! ```
//!
//! A connection the transport dropped without a close event stops answering
//! pings and is evicted on the second tick after its last pong, so it is
//! reclaimed within two periods.

use crate::registry::{ConnectionId, ConnectionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Liveness state of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    /// Answered the last ping (or was just accepted).
    #[default]
    Alive,
    /// Pinged on the last tick, no pong yet.
    PendingPong,
}

/// What a tick asks the heartbeat to do with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Send a ping and wait for the next tick.
    Ping,
    /// The connection is dead and must be evicted.
    Evict,
}

impl Liveness {
    /// Advance on a heartbeat tick.
    pub fn tick(&mut self) -> TickAction {
        match self {
            Liveness::Alive => {
                *self = Liveness::PendingPong;
                TickAction::Ping
            }
            Liveness::PendingPong => TickAction::Evict,
        }
    }

    /// Record a pong.
    pub fn pong(&mut self) {
        *self = Liveness::Alive;
    }
}

/// Result of one heartbeat sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections pinged on this tick.
    pub pinged: usize,
    /// Connections evicted on this tick.
    pub evicted: Vec<ConnectionId>,
}

/// Periodic heartbeat over every registered connection.
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    period: Duration,
}

impl LivenessMonitor {
    /// Create a monitor ticking every `period`.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, period: Duration) -> Self {
        Self { registry, period }
    }

    /// The heartbeat period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one heartbeat sweep.
    pub fn tick(&self) -> HeartbeatReport {
        let report = self.registry.heartbeat();
        for id in &report.evicted {
            info!(connection = %id, "Connection didn't respond to ping, terminating");
        }
        debug!(
            pinged = report.pinged,
            evicted = report.evicted.len(),
            "Heartbeat sweep"
        );
        report
    }

    /// Tick forever, first tick one period from now.
    pub async fn run(self) {
        self.run_with(|_| {}).await;
    }

    /// Tick forever, handing every sweep's report to `on_tick`.
    pub async fn run_with<F>(self, mut on_tick: F)
    where
        F: FnMut(&HeartbeatReport) + Send,
    {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.tick();
            on_tick(&report);
        }
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Spawn [`run_with`](Self::run_with) onto the runtime.
    #[must_use]
    pub fn spawn_with<F>(self, on_tick: F) -> JoinHandle<()>
    where
        F: FnMut(&HeartbeatReport) + Send + 'static,
    {
        tokio::spawn(self.run_with(on_tick))
    }
}
