//! Named try-once locks
//!
//! A [`LockManager`] holds any number of independently named locks against
//! one backend, all sharing a key prefix and a session TTL. Each name maps
//! to at most one held lock.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, LockHandle, LockOptions, LossSignal},
    consul::ConsulClient,
    error::{Error, Result},
};

struct Entry<L> {
    lock: L,
    /// Distinguishes this acquisition from later ones under the same name.
    generation: u64,
}

/// Inner state for the LockManager
struct Inner<L> {
    /// Currently held locks by name
    locks: HashMap<String, Entry<L>>,

    /// Counter for tagging entries
    generation_counter: u64,
}

impl<L> Inner<L> {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
            generation_counter: 0,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation_counter += 1;
        self.generation_counter
    }
}

/// Manages named exclusive locks under a common prefix.
///
/// The entry table is only locked while it is read or modified, never
/// while waiting on the backend.
pub struct LockManager<B: Backend> {
    backend: B,
    prefix: Arc<str>,
    session_ttl: Duration,
    inner: Arc<Mutex<Inner<B::Lock>>>,
}

impl<B: Backend> Clone for LockManager<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            prefix: self.prefix.clone(),
            session_ttl: self.session_ttl,
            inner: self.inner.clone(),
        }
    }
}

impl LockManager<ConsulClient> {
    /// Create a lock manager using a Consul client configured from the
    /// environment.
    pub fn with_default_client(prefix: &str, session_ttl: Duration) -> Result<Self> {
        Ok(Self::new(ConsulClient::from_env()?, prefix, session_ttl))
    }
}

impl<B: Backend> LockManager<B> {
    pub fn new(backend: B, prefix: &str, session_ttl: Duration) -> Self {
        Self {
            backend,
            prefix: prefix.trim_end_matches('/').into(),
            session_ttl,
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    /// Try once to acquire the lock `key`, waiting at most `lock_wait_time`
    /// for a current holder to let go.
    ///
    /// `value` is stored with the lock to identify the holder. The returned
    /// signal fires if the lock is later lost; the manager then forgets the
    /// entry but does not try to get it back.
    #[tracing::instrument(skip(self, value), fields(prefix = %self.prefix), err)]
    pub async fn lock(
        &self,
        key: &str,
        value: &str,
        lock_wait_time: Duration,
    ) -> Result<LossSignal> {
        if self.inner.lock().await.locks.contains_key(key) {
            return Err(Error::AlreadyHeld {
                key: key.to_owned(),
            });
        }

        let options = LockOptions::new(self.path(key), value, self.session_ttl)
            .try_once(lock_wait_time)
            .with_session_name(format!("{}-{}", self.prefix, key));
        let mut lock = self
            .backend
            .prepare_lock(options)
            .map_err(|e| Error::acquisition(key, e))?;

        let loss = match lock.acquire(CancellationToken::new()).await {
            Ok(Some(loss)) => loss,
            Ok(None) => {
                debug!(key, "already locked");
                return Err(Error::AlreadyHeld {
                    key: key.to_owned(),
                });
            }
            Err(e) => return Err(Error::acquisition(key, e)),
        };

        let mut inner = self.inner.lock().await;
        if inner.locks.contains_key(key) {
            // Another caller in this process recorded the same name while
            // the backend call was in flight.
            drop(inner);
            warn!(key, "lock recorded concurrently, giving this one back");
            let res = match lock.release().await {
                Ok(()) => lock.destroy().await,
                Err(e) => Err(e),
            };
            if let Err(err) = res {
                warn!(%err, key, "releasing duplicate lock");
            }
            return Err(Error::AlreadyHeld {
                key: key.to_owned(),
            });
        }
        let generation = inner.next_generation();
        inner
            .locks
            .insert(key.to_owned(), Entry { lock, generation });
        drop(inner);

        info!(key, generation, "locked");
        tokio::spawn(forget_on_loss(
            Arc::downgrade(&self.inner),
            key.to_owned(),
            generation,
            loss.clone(),
        ));
        Ok(loss)
    }

    /// Release the lock `key` and remove its key from the backend.
    ///
    /// The entry is forgotten even when the backend calls fail.
    #[tracing::instrument(skip(self), fields(prefix = %self.prefix), err)]
    pub async fn unlock(&self, key: &str) -> Result<()> {
        let mut entry = self
            .inner
            .lock()
            .await
            .locks
            .remove(key)
            .ok_or_else(|| Error::NotFound {
                key: key.to_owned(),
            })?;

        entry
            .lock
            .release()
            .await
            .map_err(|e| Error::release(key, e))?;
        entry
            .lock
            .destroy()
            .await
            .map_err(|e| Error::release(key, e))?;
        info!(key, "unlocked");
        Ok(())
    }

    /// Release every held lock, continuing past failures.
    ///
    /// The table is always empty afterwards. Failures are returned per key.
    #[tracing::instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn unlock_all(&self) -> Vec<(String, Error)> {
        let entries = std::mem::take(&mut self.inner.lock().await.locks);
        let mut failures = Vec::new();
        for (key, mut entry) in entries {
            let res = match entry.lock.release().await {
                Ok(()) => entry.lock.destroy().await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                warn!(err = %e, key, "releasing lock");
                let err = Error::release(&key, e);
                failures.push((key, err));
            }
        }
        failures
    }

    /// Whether `key` is currently recorded as held.
    pub async fn is_locked(&self, key: &str) -> bool {
        self.inner.lock().await.locks.contains_key(key)
    }

    /// Names of all held locks, sorted.
    pub async fn locked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().await.locks.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.locks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.locks.is_empty()
    }
}

/// Drop the entry for `key` once its lock is lost, unless it was already
/// unlocked or replaced.
async fn forget_on_loss<L>(
    inner: Weak<Mutex<Inner<L>>>,
    key: String,
    generation: u64,
    loss: LossSignal,
) {
    loss.cancelled().await;
    let inner = match inner.upgrade() {
        Some(inner) => inner,
        None => return,
    };
    let mut inner = inner.lock().await;
    if inner
        .locks
        .get(&key)
        .is_some_and(|entry| entry.generation == generation)
    {
        inner.locks.remove(&key);
        warn!(key, "lock lost");
    }
}
