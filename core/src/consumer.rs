//! Type consumer lifecycle.
//!
//! Every event type with at least one subscription has a type consumer. Its
//! lifecycle is observable through a [`ConsumerHandle`]:
//!
//! ```text
//! Absent ──► Starting ──► Active ──► Draining ──► Stopped
//!   │           │            │           │            │
//!   │           │            │           │            └─ reader task has exited
//!   │           │            │           └─ reader is leaving its loop
//!   │           │            └─ reader loop running (provisioning happens here)
//!   │           └─ registry entry created by the first subscribe
//!   └─ no entry for the type
//! ```
//!
//! States only move forward. The registry entry is removed (and the cancellation
//! token fired) when the last subscription goes away; a consumer can sit in
//! `Active` briefly after that until its reader notices.

use crate::metrics;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a type consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConsumerState {
    /// No consumer exists for the type.
    Absent,
    /// Registry entry created, reader not yet running.
    Starting,
    /// Reader loop running.
    Active,
    /// Reader is exiting.
    Draining,
    /// Reader has exited.
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Absent => "absent",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared handle to one type consumer.
///
/// Cloned into the consumer's reader task. Two consumers created for the same
/// event type at different times have different ids.
#[derive(Clone)]
pub struct ConsumerHandle {
    id: u64,
    event_type: Arc<str>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConsumerState>>,
}

impl ConsumerHandle {
    pub(crate) fn new(id: u64, event_type: &str) -> Self {
        let (state, _) = watch::channel(ConsumerState::Starting);
        Self {
            id,
            event_type: Arc::from(event_type),
            cancel: CancellationToken::new(),
            state: Arc::new(state),
        }
    }

    /// Unique id of this consumer within its registry.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Event type this consumer reads.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Token fired when the consumer is told to stop.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the consumer has been told to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns `true` if the state changed.
    pub fn advance(&self, next: ConsumerState) -> bool {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the consumer has reached `target` (or a later state).
    pub async fn wait_for(&self, target: ConsumerState) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|state| *state >= target).await;
    }

    /// Mark the reader as running and return a guard that finishes the
    /// lifecycle when the reader exits, however it exits.
    #[must_use]
    pub fn enter_reader(&self, backend: &'static str) -> ReaderGuard {
        self.advance(ConsumerState::Active);
        metrics::record_consumer_delta(backend, 1.0);
        tracing::info!(event_type = %self.event_type, backend, "Type consumer started");
        ReaderGuard {
            handle: self.clone(),
            backend,
        }
    }

    /// Finish the lifecycle of a consumer that never had a reader task.
    pub fn retire(&self) {
        self.advance(ConsumerState::Active);
        self.advance(ConsumerState::Draining);
        self.advance(ConsumerState::Stopped);
    }
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Held by a reader task for its whole run. See [`ConsumerHandle::enter_reader`].
#[must_use = "dropping the guard marks the consumer as stopped"]
pub struct ReaderGuard {
    handle: ConsumerHandle,
    backend: &'static str,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.handle.advance(ConsumerState::Draining);
        metrics::record_consumer_delta(self.backend, -1.0);
        tracing::info!(
            event_type = %self.handle.event_type,
            backend = self.backend,
            cancelled = self.handle.is_cancelled(),
            "Type consumer stopped"
        );
        self.handle.advance(ConsumerState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        let handle = ConsumerHandle::new(1, "test");
        assert_eq!(handle.state(), ConsumerState::Starting);

        assert!(handle.advance(ConsumerState::Active));
        assert!(!handle.advance(ConsumerState::Starting));
        assert_eq!(handle.state(), ConsumerState::Active);
    }

    #[test]
    fn reader_guard_walks_through_draining_to_stopped() {
        let handle = ConsumerHandle::new(1, "test");
        let mut rx = handle.state.subscribe();

        let guard = handle.enter_reader("memory");
        assert_eq!(handle.state(), ConsumerState::Active);
        drop(guard);

        assert_eq!(handle.state(), ConsumerState::Stopped);
        assert!(rx.has_changed().unwrap_or(false));
    }

    #[tokio::test]
    async fn wait_for_returns_once_state_is_reached() {
        let handle = ConsumerHandle::new(1, "test");
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for(ConsumerState::Stopped).await })
        };

        handle.retire();

        let finished = tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await;
        assert!(finished.is_ok(), "wait_for did not return");
        assert_eq!(handle.state(), ConsumerState::Stopped);
    }
}
