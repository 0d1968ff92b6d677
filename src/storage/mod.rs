//! Durable key/value storage port.
//!
//! The offline queue, the terminal failure log and cache-warm metrics are
//! written through [`LocalStorage`] in the same call that mutates their
//! in-memory state, so a crash never leaves the two out of step.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;

/// String key/value storage that survives restarts.
pub trait LocalStorage: Send + Sync {
  fn get_item(&self, key: &str) -> Result<Option<String>>;

  fn set_item(&self, key: &str, value: &str) -> Result<()>;

  fn remove_item(&self, key: &str) -> Result<()>;
}
