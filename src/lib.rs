pub mod agent;
pub mod common;
pub mod config;
pub mod directive;
pub mod dw;
pub mod host;
pub mod lifecycle;
pub mod sched;
pub mod service;
pub mod state;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::DwError;
pub type Result<T> = std::result::Result<T, Error>;

/// Job id assigned by the host scheduler. 0 is never a valid job id; it marks
/// allocations that belong to a named persistent buffer.
pub type JobId = u32;
pub type UserId = u32;

pub use config::BufferConfig;
pub use service::{create_service, BbService};
