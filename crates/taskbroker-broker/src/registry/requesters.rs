//! Registry of connected requesters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use taskbroker_core::RequesterId;
use taskbroker_proto::BrokerToRequester;

use crate::registry::{PeerHandle, SessionId};

/// A connected requester.
#[derive(Debug)]
pub struct ConnectedRequester {
    pub session: SessionId,
    pub connected_at: DateTime<Utc>,
    pub peer: PeerHandle<BrokerToRequester>,
}

/// Connected requesters indexed by RequesterId.
#[derive(Default)]
pub struct RequesterRegistry {
    requesters: RwLock<HashMap<RequesterId, ConnectedRequester>>,
}

impl RequesterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a requester, returning the connection it replaces.
    pub async fn register(
        &self,
        requester_id: RequesterId,
        session: SessionId,
        peer: impl Into<PeerHandle<BrokerToRequester>>,
    ) -> Option<ConnectedRequester> {
        let connected = ConnectedRequester {
            session,
            connected_at: Utc::now(),
            peer: peer.into(),
        };
        self.requesters.write().await.insert(requester_id, connected)
    }

    /// Remove a requester if it is still registered by `session`.
    pub async fn remove(&self, requester_id: &RequesterId, session: SessionId) -> bool {
        let mut requesters = self.requesters.write().await;
        match requesters.get(requester_id) {
            Some(r) if r.session == session => requesters.remove(requester_id).is_some(),
            _ => false,
        }
    }

    /// Outbound side of a connected requester.
    pub async fn sender(&self, requester_id: &RequesterId) -> Option<PeerHandle<BrokerToRequester>> {
        self.requesters
            .read()
            .await
            .get(requester_id)
            .map(|r| r.peer.clone())
    }

    /// Check whether `requester_id` is registered by `session`.
    pub async fn is_registered(&self, requester_id: &RequesterId, session: SessionId) -> bool {
        self.requesters
            .read()
            .await
            .get(requester_id)
            .is_some_and(|r| r.session == session)
    }

    pub async fn contains(&self, requester_id: &RequesterId) -> bool {
        self.requesters.read().await.contains_key(requester_id)
    }

    /// Get the number of connected requesters.
    pub async fn count(&self) -> usize {
        self.requesters.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_stale_session_does_not_remove() {
        let registry = RequesterRegistry::new();
        let id = RequesterId::new("rq");
        let (tx1, _rx1) = mpsc::channel::<BrokerToRequester>(1);
        let (tx2, _rx2) = mpsc::channel::<BrokerToRequester>(1);

        registry.register(id.clone(), 1, tx1).await;
        assert!(registry.register(id.clone(), 2, tx2).await.is_some());

        assert!(!registry.remove(&id, 1).await);
        assert!(registry.contains(&id).await);
        assert!(registry.remove(&id, 2).await);
        assert_eq!(registry.count().await, 0);
    }
}
