//! Graceful shutdown
//!
//! Every background loop is spawned through a [`ShutdownGroup`]. Components
//! own a child group, so they can be closed on their own, and the parent
//! waits for every child when the whole node shuts down.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct ShutdownGroup {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownGroup {
    pub fn new() -> Self {
        ShutdownGroup {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Group cancelled together with the parent, the parent shutdown waits for it.
    pub fn child(&self) -> ShutdownGroup {
        let child = ShutdownGroup {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
        };
        let token = child.token.clone();
        let tracker = child.tracker.clone();
        self.tracker.spawn(async move {
            token.cancelled().await;
            tracker.close();
            tracker.wait().await;
        });
        child
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when shutdown is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Cancel all loops and wait until they exit.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
