//! postrelay - scheduled channel republishing engine
//!
//! Republishes posts from source channels into target channels on weekly
//! time slots, through one messaging session per bot identity.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Bots, tasks, channels, raw messages and posts
//! - [`compose`] - Post grouping, selection and rendering with UTF-16 limits
//! - [`transport`] - Capability trait over the messaging sessions
//! - [`resolver`] - Cached channel reference resolution
//! - [`cache`] - Metadata and content caches
//! - [`storage`] - Administrative data and publication bookkeeping
//! - [`listener`] - PostgreSQL change notifications
//! - [`scheduler`] - Slot matching, dedup guard and retry queue
//! - [`publisher`] - Sending, album fallback, pin and delete policy
//! - [`pipeline`] - The publish path of one task
//! - [`engine`] - Orchestrator owning every service and loop
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use postrelay::config::Config;
//! use postrelay::engine::Engine;
//! use postrelay::storage::{PostgresStore, Store};
//! use postrelay::transport::GatewayFactory;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(&config.postgres_config()).await?);
//!     let factory = Arc::new(GatewayFactory::new(config.gateway_config())?);
//!     let engine = Arc::new(Engine::new(&config, store, factory)?);
//!     let (_tx, rx) = tokio::sync::watch::channel(false);
//!     engine.run(Some(config.listener_config()), rx).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod compose;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod publisher;
pub mod resolver;
pub mod scheduler;
pub mod storage;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{Engine, JobOutcome};
    pub use crate::error::{Error, ErrorCategory, RelayErrorTrait, Result};
    pub use crate::models::{BotIdentity, Channel, ChannelRef, Post, RawMessage, Task, TimeSlot};
    pub use crate::storage::Store;
    pub use crate::transport::{Transport, TransportFactory};
}

// Direct re-exports for convenience
pub use models::{Post, RawMessage, Task};
