//! Cluster leader election and named distributed locks on Consul sessions.
//!
//! - [`Election`] keeps contending for one key and reports every change in
//!   leadership on an ordered channel.
//! - [`LockManager`] holds any number of named try-once locks under a
//!   common prefix.
//!
//! Both work against any [`Backend`]; [`ConsulClient`] is the one shipped
//! here.

mod error;

pub mod backend;
pub mod config;
pub mod consul;
pub mod election;
pub mod lock_manager;

pub use backend::{Backend, LockHandle, LockOptions, LossSignal};
pub use config::{ConsulConfig, ElectionConfig};
pub use consul::ConsulClient;
pub use election::Election;
pub use error::{BackendError, Error, Result};
pub use lock_manager::LockManager;

#[cfg(test)]
pub mod tests;
