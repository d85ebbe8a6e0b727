use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::client::{duration_param, ConsulClient, KvPair, SessionEntry};
use crate::{
    backend::{LockHandle, LockOptions, LossSignal},
    error::BackendError,
};

/// Flag stored with every lock key, marking it as written by this recipe.
pub const LOCK_FLAG_VALUE: u64 = 0x2ddccbc058a50c18;

const DEFAULT_SESSION_NAME: &str = "clusterleader lock";
const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);

/// Wait before retrying when an acquire fails on a free key, which means a
/// lock-delay is in effect.
const LOCK_RETRY_TIME: Duration = Duration::from_secs(5);

/// Blocking query wait used by the lock monitor.
const MONITOR_WAIT_TIME: Duration = Duration::from_secs(300);
const MONITOR_RETRY_TIME: Duration = Duration::from_secs(2);
const MONITOR_RETRIES: u32 = 3;

type BackendResult<T> = std::result::Result<T, BackendError>;

struct Held {
    session: String,
    /// Stops session renewal (which then destroys the session) and the monitor.
    session_done: CancellationToken,
    loss: LossSignal,
}

/// A lock on a single Consul key, bound to a session created on acquire.
pub struct ConsulLock {
    client: ConsulClient,
    options: LockOptions,
    held: Option<Held>,
}

impl ConsulLock {
    pub(crate) fn new(client: ConsulClient, options: LockOptions) -> Self {
        Self {
            client,
            options,
            held: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.options.key
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    async fn create_session(&self) -> BackendResult<String> {
        let entry = SessionEntry {
            name: self
                .options
                .session_name
                .clone()
                .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_owned()),
            ttl: duration_param(self.options.session_ttl),
            behavior: "release".to_owned(),
            lock_delay: duration_param(DEFAULT_LOCK_DELAY),
        };
        self.client.session_create(&entry).await
    }

    /// Run the acquisition protocol against an existing session.
    ///
    /// Returns `Ok(false)` when a try-once attempt gave up.
    async fn wait_and_acquire(
        &self,
        session: &str,
        abort: &CancellationToken,
    ) -> BackendResult<bool> {
        let key = &self.options.key;
        let start = Instant::now();
        let mut wait_time = self.options.lock_wait_time;
        let mut index = 0u64;
        let mut attempts = 0u32;
        loop {
            if self.options.try_once && attempts > 0 {
                let elapsed = start.elapsed();
                if elapsed >= self.options.lock_wait_time {
                    return Ok(false);
                }
                wait_time = self.options.lock_wait_time - elapsed;
            }
            attempts += 1;

            let (pair, last_index) = select! {
                _ = abort.cancelled() => return Err(BackendError::Aborted),
                res = self.client.kv_get(key, Some((index, wait_time))) => res?,
            };
            check_flags(pair.as_ref())?;
            match pair.as_ref().and_then(KvPair::held_by) {
                Some(holder) if holder == session => return Ok(true),
                Some(holder) => {
                    trace!(key, holder, "lock held elsewhere");
                    index = last_index;
                    continue;
                }
                None => {}
            }

            let acquired = select! {
                _ = abort.cancelled() => return Err(BackendError::Aborted),
                res = self.client.kv_acquire(key, session, &self.options.value, LOCK_FLAG_VALUE) => res?,
            };
            if acquired {
                return Ok(true);
            }

            // Find out why the acquire failed.
            let (pair, last_index) = select! {
                _ = abort.cancelled() => return Err(BackendError::Aborted),
                res = self.client.kv_get(key, None) => res?,
            };
            if pair.as_ref().and_then(KvPair::held_by).is_some() {
                index = last_index;
                continue;
            }
            // The key is free but a lock-delay is in effect.
            index = 0;
            select! {
                _ = abort.cancelled() => return Err(BackendError::Aborted),
                _ = sleep(LOCK_RETRY_TIME) => {}
            }
        }
    }
}

fn check_flags(pair: Option<&KvPair>) -> BackendResult<()> {
    match pair {
        Some(pair) if pair.flags != LOCK_FLAG_VALUE => Err(BackendError::Conflict),
        _ => Ok(()),
    }
}

impl LockHandle for ConsulLock {
    #[tracing::instrument(skip_all, fields(key = %self.options.key), err)]
    async fn acquire(&mut self, abort: CancellationToken) -> BackendResult<Option<LossSignal>> {
        if self.held.is_some() {
            return Err(BackendError::LockHeld);
        }

        let session = select! {
            _ = abort.cancelled() => return Err(BackendError::Aborted),
            res = self.create_session() => res?,
        };
        let session_done = CancellationToken::new();
        let loss = LossSignal::new();
        tokio::spawn(renew_session(
            self.client.clone(),
            session.clone(),
            self.options.session_ttl,
            session_done.clone(),
            loss.clone(),
        ));

        let acquired = match self.wait_and_acquire(&session, &abort).await {
            Ok(acquired) => acquired,
            Err(e) => {
                session_done.cancel();
                return Err(e);
            }
        };
        if !acquired {
            debug!(key = self.options.key, "lock not available");
            session_done.cancel();
            return Ok(None);
        }

        let held = Held {
            session,
            session_done,
            loss: loss.clone(),
        };
        if abort.is_cancelled() {
            // Aborted while the acquire was in flight; hand the key back.
            self.held = Some(held);
            if let Err(err) = self.release().await {
                warn!(?err, key = self.options.key, "releasing aborted lock");
            }
            return Err(BackendError::Aborted);
        }

        info!(key = self.options.key, session = held.session, "lock acquired");
        tokio::spawn(monitor_lock(
            self.client.clone(),
            self.options.key.clone(),
            held.session.clone(),
            held.session_done.clone(),
            loss.clone(),
        ));
        self.held = Some(held);
        Ok(Some(loss))
    }

    #[tracing::instrument(skip_all, fields(key = %self.options.key), err)]
    async fn release(&mut self) -> BackendResult<()> {
        let held = self.held.take().ok_or(BackendError::LockNotHeld)?;
        let res = self
            .client
            .kv_release(&self.options.key, &held.session, LOCK_FLAG_VALUE)
            .await;
        held.session_done.cancel();
        held.loss.cancel();
        res?;
        debug!(key = self.options.key, "lock released");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %self.options.key), err)]
    async fn destroy(&mut self) -> BackendResult<()> {
        if self.held.is_some() {
            return Err(BackendError::LockHeld);
        }
        let (pair, _) = self.client.kv_get(&self.options.key, None).await?;
        let pair = match pair {
            Some(pair) => pair,
            None => return Ok(()),
        };
        check_flags(Some(&pair))?;
        if pair.held_by().is_some() {
            return Err(BackendError::LockInUse);
        }
        if !self
            .client
            .kv_delete_cas(&self.options.key, pair.modify_index)
            .await?
        {
            return Err(BackendError::LockInUse);
        }
        debug!(key = self.options.key, "lock destroyed");
        Ok(())
    }
}

impl Drop for ConsulLock {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            // The session is destroyed by the renewer, which releases the key.
            held.session_done.cancel();
            held.loss.cancel();
        }
    }
}

/// Keep a session alive until `done` fires, then destroy it.
///
/// Transient renewal failures are retried until the TTL has run out; a
/// session the agent no longer knows fires `loss`.
async fn renew_session(
    client: ConsulClient,
    session: String,
    ttl: Duration,
    done: CancellationToken,
    loss: LossSignal,
) {
    let mut retry = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(1).min(ttl))
        .with_max_elapsed_time(Some(ttl))
        .build();
    let mut delay = ttl / 2;
    loop {
        select! {
            _ = done.cancelled() => break,
            _ = sleep(delay) => {}
        }
        match client.session_renew(&session).await {
            Ok(true) => {
                trace!(session, "session renewed");
                retry.reset();
                delay = ttl / 2;
            }
            Ok(false) => {
                warn!(session, "session expired");
                loss.cancel();
                return;
            }
            Err(err) => match retry.next_backoff() {
                Some(next) => {
                    warn!(?err, session, "renewing session");
                    delay = next;
                }
                None => {
                    warn!(?err, session, "giving up renewing session");
                    loss.cancel();
                    return;
                }
            },
        }
    }
    if let Err(err) = client.session_destroy(&session).await {
        warn!(?err, session, "destroying session");
    }
}

/// Watch a held key and fire `loss` once it is no longer owned by `session`.
async fn monitor_lock(
    client: ConsulClient,
    key: String,
    session: String,
    done: CancellationToken,
    loss: LossSignal,
) {
    let mut index = 0u64;
    let mut retries = MONITOR_RETRIES;
    loop {
        let res = select! {
            _ = done.cancelled() => return,
            _ = loss.cancelled() => return,
            res = client.kv_get(&key, Some((index, MONITOR_WAIT_TIME))) => res,
        };
        match res {
            Ok((Some(pair), last_index)) if pair.held_by() == Some(session.as_str()) => {
                retries = MONITOR_RETRIES;
                index = last_index;
            }
            Ok(_) => {
                info!(key, session, "lock lost");
                break;
            }
            Err(err) if retries > 0 => {
                warn!(?err, key, "monitoring lock");
                retries -= 1;
                select! {
                    _ = done.cancelled() => return,
                    _ = sleep(MONITOR_RETRY_TIME) => {}
                }
            }
            Err(err) => {
                warn!(?err, key, "lock monitor giving up");
                break;
            }
        }
    }
    loss.cancel();
}
