//! Runtime adapters and the producer/callback API surface.

pub mod api;
pub mod spawner;

pub use api::{
    ChangeSetService, ChangeSetStatusResponse, ChangeSetSubmission, Health, SubmitReceipt,
};
pub use spawner::{spawn_dispatcher, DispatcherHandle};
