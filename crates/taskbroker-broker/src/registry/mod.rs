//! In-memory registries: runners, requesters, offer queues and tasks.

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

pub mod offers;
pub mod requesters;
pub mod runners;
pub mod tasks;

pub use offers::{Matches, OfferQueue, PendingRequest, QueueDepth};
pub use requesters::{ConnectedRequester, RequesterRegistry};
pub use runners::{ConnectedRunner, RunnerRegistry, RunnerSummary};
pub use tasks::{TaskEntry, TaskRegistry, TaskSlot};

/// Identifies one connection, so the close of a superseded connection
/// cannot remove a newer registration under the same id.
pub type SessionId = u64;

/// Outbound side of a registered connection.
///
/// Messages are queued without waiting. A peer whose queue is full is
/// stalled: its closer fires and the transport drops the connection, which
/// runs the normal disconnect cleanup.
#[derive(Debug)]
pub struct PeerHandle<M> {
    pub tx: mpsc::Sender<M>,
    pub closer: CancellationToken,
}

impl<M> PeerHandle<M> {
    pub fn new(tx: mpsc::Sender<M>, closer: CancellationToken) -> Self {
        Self { tx, closer }
    }

    /// Queue a message for the peer.
    pub fn deliver(&self, msg: M) -> Delivery {
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
            Err(TrySendError::Full(_)) => {
                self.closer.cancel();
                Delivery::Stalled
            }
        }
    }
}

impl<M> Clone for PeerHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closer: self.closer.clone(),
        }
    }
}

impl<M> From<mpsc::Sender<M>> for PeerHandle<M> {
    fn from(tx: mpsc::Sender<M>) -> Self {
        Self::new(tx, CancellationToken::new())
    }
}

/// Result of [`PeerHandle::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The connection is gone.
    Closed,
    /// The peer stopped reading; it is being disconnected.
    Stalled,
}

impl Delivery {
    pub fn is_sent(self) -> bool {
        self == Delivery::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_marks_peer_stalled() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let peer = PeerHandle::from(tx);

        assert_eq!(peer.deliver(1), Delivery::Sent);
        assert!(!peer.closer.is_cancelled());
        assert_eq!(peer.deliver(2), Delivery::Stalled);
        assert!(peer.closer.is_cancelled());

        assert_eq!(rx.recv().await, Some(1));
        drop(rx);
        assert_eq!(peer.deliver(3), Delivery::Closed);
    }
}
