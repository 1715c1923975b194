#![forbid(unsafe_code)]

//! # Polaris
//!
//! Circuit-breaker and redelivery orchestration for an event-distribution
//! fabric. When delivery to a subscriber's endpoint fails, the delivery path
//! parks the event as WAITING and opens a breaker keyed by subscription.
//! Polaris probes the endpoint with cheap HTTP requests and, once it
//! recovers, re-emits the subscriber's queued events back onto the bus.
//!
//! ## Shape
//!
//! - A cluster of identical workers shares a breaker registry, a claim map,
//!   and one advisory lock (see [`cluster::ClusterCoordinator`]; `polaris-etcd`
//!   is the distributed backend).
//! - Each worker runs the [`orchestrator::BreakerOrchestrator`]: adopt OPEN
//!   breakers, move them to CHECKING, and hand them to the
//!   [`reconcile::SubscriptionReconciler`].
//! - The [`scheduler::ProbeScheduler`] keeps at most one probe in flight per
//!   `(url, method)`, damped exponentially while the endpoint stays down.
//! - On success, the [`recovery::RecoveryHandler`] drains the endpoint's
//!   subscriptions and the [`republish::Republisher`] picks each parked
//!   event off the bus by exact partition/offset and re-emits it as
//!   PROCESSED (`polaris-kafka` is the bus backend).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use polaris::{Polaris, PolarisConfig};
//! use polaris::bus::MemoryBus;
//! use polaris::cluster::InProcessCluster;
//! use polaris::probe::HttpProber;
//! use polaris::registry::InMemoryBreakerRegistry;
//! use polaris::store::InMemoryMessageStore;
//! use polaris::token::StaticTokenProvider;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PolarisConfig::default();
//! let tokens = Arc::new(StaticTokenProvider::new("token"));
//! let prober = HttpProber::new(tokens, config.max_timeout(), config.max_connections)?;
//!
//! let polaris = Polaris::builder(config)
//!     .bus(Arc::new(MemoryBus::new()))
//!     .store(Arc::new(InMemoryMessageStore::new()))
//!     .cluster(Arc::new(InProcessCluster::new("pod-0")))
//!     .registry(Arc::new(InMemoryBreakerRegistry::new()))
//!     .prober(Arc::new(prober))
//!     .build()?;
//! polaris.start();
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod breaker;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod health;
pub mod message;
pub mod orchestrator;
pub mod pool;
pub mod probe;
pub mod reconcile;
pub mod recovery;
pub mod registry;
pub mod republish;
pub mod scans;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod subscription;
pub mod time;
pub mod token;

// Re-exports
pub use breaker::{BreakerRecord, BreakerStatus, HealthCheck};
pub use config::PolarisConfig;
pub use error::{BusError, ClusterError, PickError, RegistryError, RoundError, StoreError};
pub use health::{HealthKey, HealthSnapshot};
pub use message::{ErrorClass, MessageCoord, MessageStatus, SubscriptionEventMessage};
pub use service::{Polaris, PolarisBuilder};
pub use subscription::{
    DeliveryType, ProbeMethod, SubscriptionEvent, SubscriptionEventKind, SubscriptionProjection,
};
