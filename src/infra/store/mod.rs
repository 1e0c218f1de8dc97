//! Change-set store backends.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlChangeSetStore;
pub use memory::InMemoryChangeSetStore;
