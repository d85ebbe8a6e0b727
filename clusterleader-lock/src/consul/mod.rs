//! Consul backend
//!
//! Implements session-bound locks on top of the Consul HTTP API: a session
//! with a TTL is created and renewed for every acquisition, the key is taken
//! with `?acquire=` and watched with blocking queries so that losing it fires
//! the loss signal.

mod client;
mod lock;

pub use client::ConsulClient;
pub use lock::{ConsulLock, LOCK_FLAG_VALUE};

use crate::{
    backend::{Backend, LockOptions},
    error::BackendError,
};

impl Backend for ConsulClient {
    type Lock = ConsulLock;

    fn prepare_lock(&self, options: LockOptions) -> Result<ConsulLock, BackendError> {
        options.validate()?;
        Ok(ConsulLock::new(self.clone(), options))
    }
}
