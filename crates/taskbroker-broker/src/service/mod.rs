//! Per-connection protocol services.
//!
//! A service owns one peer connection: it decodes nothing itself, it only
//! dispatches already-decoded messages to the broker and cleans up when the
//! connection closes. Transports feed it frames through [`PeerConnection`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;

pub mod requester_service;
pub mod runner_service;

pub use requester_service::RequesterConnection;
pub use runner_service::RunnerConnection;

/// One side of a broker connection.
#[async_trait]
pub trait PeerConnection: Send {
    /// Messages this peer sends to the broker.
    type Inbound: DeserializeOwned + Send;

    /// Messages the broker sends to this peer.
    type Outbound: Serialize + Send + 'static;

    /// Peer identity, for logs.
    fn peer(&self) -> String;

    /// Fires when the broker drops this peer, for example after it stopped
    /// reading its messages.
    fn closer(&self) -> CancellationToken;

    /// Dispatch one message.
    async fn handle(&mut self, msg: Self::Inbound) -> Result<(), BrokerError>;

    /// Release everything the peer owns.
    async fn close(self);
}

/// Tracks consecutive protocol errors on a connection.
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    max: u32,
    consecutive: u32,
}

impl ErrorBudget {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            consecutive: 0,
        }
    }

    /// Record a well-formed, successfully handled message.
    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Record an error. Returns true once the connection should be closed.
    pub fn failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.max
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
