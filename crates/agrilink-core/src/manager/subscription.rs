use futures::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::warn;

use super::AuthState;

/// Ordered feed of state transitions.
///
/// A subscriber that falls behind the channel buffer skips ahead to the
/// oldest retained transition rather than holding anyone up. Skipped
/// transitions are counted in [`Subscription::missed`].
pub struct Subscription {
    rx: broadcast::Receiver<AuthState>,
    missed: u64,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<AuthState>) -> Self {
        Self { rx, missed: 0 }
    }

    /// Transitions dropped because this subscriber fell behind
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Wait for the next transition. `None` once the manager is gone.
    pub async fn next(&mut self) -> Option<AuthState> {
        loop {
            match self.rx.recv().await {
                Ok(state) => return Some(state),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "State subscriber lagged");
                    self.missed += skipped;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next transition if one is already queued
    pub fn try_next(&mut self) -> Option<AuthState> {
        loop {
            match self.rx.try_recv() {
                Ok(state) => return Some(state),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "State subscriber lagged");
                    self.missed += skipped;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = AuthState> {
        stream::unfold(self, |mut sub| async move {
            let state = sub.next().await?;
            Some((state, sub))
        })
    }
}

/// Registration for a callback added with `SessionManager::on_change`.
/// The callback stops receiving transitions when this is dropped.
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn unsubscribe(self) {}

    /// False once unsubscribed, or if the callback panicked
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
