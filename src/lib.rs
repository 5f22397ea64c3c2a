//! Ratesync - Distributed Rate Limiting Core
//!
//! This crate decides in real time whether a unit of work is admitted for a
//! tenant key plus a sequence of discriminating arguments. Admission runs
//! entirely in memory; state is shared between service instances through a
//! publish/subscribe bus and written back to durable storage in the background,
//! so instances converge without a network round trip on the decision path.

pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod store;
pub mod sync;

pub use error::{RateSyncError, Result};
pub use limiter::{Configuration, Decision, Limiter, LimiterKey, LimiterKind};
pub use manager::{LimiterManager, LiveLimiter};
pub use service::RateLimitService;
pub use store::{MemoryStore, RedisStore, StoreGateway};
pub use sync::InstanceId;
