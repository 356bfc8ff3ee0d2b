//! Shared primitives for the background-work fabric.
//!
//! Everything in here is runtime-agnostic with respect to the durable
//! broker and lock service: those are external collaborators reached
//! through the [`broker::Broker`] and [`locks::LockService`] contracts,
//! with in-process reference implementations for tests and development.

pub mod breaker;
pub mod broker;
pub mod error;
pub mod export;
pub mod idempotency;
pub mod ids;
pub mod locks;
pub mod metrics;
pub mod module_cache;
pub mod retry;

pub use error::Error;
