pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod kubectl;
pub mod pipeline;
pub mod provision;
pub mod readiness;
pub mod release;
pub mod rollout;
pub mod session;
pub mod stack;
pub mod state;
pub mod teardown;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, StackError};
