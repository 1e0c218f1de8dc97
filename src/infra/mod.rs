//! Infrastructure adapters for change-set storage.

pub mod store;

pub use store::{InMemoryChangeSetStore, JsonlChangeSetStore};
