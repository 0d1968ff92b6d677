//! Offline-first data layer for a storefront client: per-entity cache
//! strategies, a priority request scheduler behind a circuit breaker, an
//! offline mutation queue with conflict resolution, and optimistic updates.

pub mod app;
pub mod backoff;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod datalayer;
pub mod entity;
pub mod error;
pub mod keys;
pub mod offline;
pub mod optimistic;
pub mod payment;
pub mod pipeline;
pub mod remote;
pub mod resource;
pub mod storage;

#[cfg(test)]
mod testing;

pub use app::App;
pub use config::Config;
pub use datalayer::{
  DataLayer, DataResponse, Mutation, MutationOptions, QueryOptions, ResponseSource, Subscription,
};
pub use entity::{CacheStrategy, ConflictPolicy, EntityKind, Priority};
pub use error::{Error, Result};
pub use keys::QueryKey;
pub use payment::PaymentVerification;
