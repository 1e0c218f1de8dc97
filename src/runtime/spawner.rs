//! Tokio runtime glue for the dispatcher loop.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::{
    ChangeSetPayload, ChangeSetStore, Dispatcher, DispatcherCounters, DispatcherStats,
};

/// Running dispatcher loop.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    counters: Arc<DispatcherCounters>,
}

impl DispatcherHandle {
    /// Live counters of the running loop.
    #[must_use]
    pub fn counters(&self) -> Arc<DispatcherCounters> {
        Arc::clone(&self.counters)
    }

    /// Snapshot of the loop's statistics.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// Whether the loop task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal shutdown and wait for the loop to exit. An in-flight tick
    /// finishes first.
    pub async fn shutdown(self) {
        // Err only means the loop already exited and dropped its receiver.
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "dispatcher task ended abnormally");
        }
    }
}

/// Spawn the dispatcher loop on a tokio runtime.
pub fn spawn_dispatcher<P, S>(handle: &Handle, dispatcher: Dispatcher<P, S>) -> DispatcherHandle
where
    P: ChangeSetPayload,
    S: ChangeSetStore<P>,
{
    let (tx, rx) = watch::channel(false);
    let counters = dispatcher.counters();
    let join = handle.spawn(dispatcher.run(rx));
    DispatcherHandle {
        shutdown: tx,
        join,
        counters,
    }
}
