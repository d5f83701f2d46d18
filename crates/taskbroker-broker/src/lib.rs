//! Task Broker Library
//!
//! This crate provides the broker side of the task protocol: runner and
//! requester registries, offer/accept negotiation, the task lifecycle,
//! RPC relay, and the HTTP/WebSocket surface that carries it all.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod service;
pub mod state;

pub use config::Config;
pub use error::BrokerError;
pub use service::{PeerConnection, RequesterConnection, RunnerConnection};
pub use state::{AppState, Broker};
