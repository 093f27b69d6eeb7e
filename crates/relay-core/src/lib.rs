//! # ccrelay-core
//!
//! State and background work of the ccrelay clan chat relay.
//!
//! - **SubscriptionStore** - persisted topic → subscriber channel mapping
//! - **ConnectionRegistry** - live producer connections and their topics
//! - **LivenessMonitor** - heartbeat that evicts unresponsive connections
//! - **MessageRouter** - forwards chat messages to subscriber channels
//! - **PresenceTracker** - detects topics whose last producer went away
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐     ┌──────────────┐     ┌───────────────────┐
//! │ Connection │────▶│ MessageRouter│────▶│ SubscriptionStore │
//! └────────────┘     └──────────────┘     └───────────────────┘
//!       │                   │                       │
//!       ▼                   ▼                       ▼
//! ┌────────────────────┐  ┌────────────┐   ┌───────────────┐
//! │ ConnectionRegistry │  │ ChatClient │   │ KeyValueStore │
//! └────────────────────┘  └────────────┘   └───────────────┘
//!    ▲            ▲                                 ▲
//!    │            └──────── PresenceTracker ────────┘
//! LivenessMonitor
//! ```

pub mod liveness;
pub mod presence;
pub mod registry;
pub mod router;
pub mod store;
pub mod subscriptions;

pub use liveness::{HeartbeatReport, Liveness, LivenessMonitor, TickAction};
pub use presence::{silent_topics, PresenceSnapshot, PresenceTracker};
pub use registry::{ConnectionId, ConnectionRegistry, Signal, SignalReceiver};
pub use router::{ChatClient, ForwardError, MessageRouter, RouteError, RouteReport};
pub use store::{KeyValueStore, MemoryStore, StoreError};
pub use subscriptions::{ChannelId, SubscriptionStore, Topic};

#[cfg(feature = "sled")]
pub use store::SledStore;
