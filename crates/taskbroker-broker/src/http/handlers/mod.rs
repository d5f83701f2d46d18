//! HTTP request handlers.

mod health;
mod runners;
mod tasks;

pub use health::{health_check, metrics_handler};
pub use runners::list_runners;
pub use tasks::list_tasks;
