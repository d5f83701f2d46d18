//! Protocol messages and codec for the task broker.
//!
//! This crate contains:
//! - The four message families exchanged between broker, runners and requesters
//! - The JSON text codec used on the wire
//! - Converters between messages and domain types

pub mod codec;
pub mod convert;
pub mod messages;

// Re-export commonly used types
pub use codec::{decode, decode_bytes, encode, ProtoError};
pub use messages::{BrokerToRequester, BrokerToRunner, RequesterToBroker, RunnerToBroker};
