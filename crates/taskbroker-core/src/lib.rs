//! Task Broker Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/transport
//! - Message encoding
//! - Runtime specifics
//!
//! All types here represent the core domain of the task broker: offers,
//! requests, the task state machine, and the RPC allow-list.

pub mod error;
pub mod failure;
pub mod ids;
pub mod offer;
pub mod rpc;
pub mod runner;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use failure::{FailureCode, TaskFailure};
pub use ids::{CallId, OfferId, RequestId, RequesterId, RunnerId, TaskId};
pub use offer::{TaskOffer, TaskRequest};
pub use rpc::{RpcAllowList, RpcStatus, DEFAULT_RPC_ALLOW_LIST};
pub use runner::RunnerInfo;
pub use status::TaskState;
pub use task::{StateChange, Task};
