//! Leader election
//!
//! An [`Election`] repeatedly tries to take a blocking, session-bound lock on
//! a key. Holding the lock means being leader. Every change in leadership is
//! published, in order, on a rendezvous channel, and acquisition failures on
//! a separate error channel.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use backoff::backoff::{Backoff, Constant};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, LockHandle, LockOptions, LossSignal},
    config::ElectionConfig,
    consul::ConsulClient,
    error::{BackendError, Error, Result},
};

/// Elects one leader among the nodes contending for the same key.
///
/// An election runs once: after [`Election::stop`] or cancellation it cannot
/// be started again.
pub struct Election<B: Backend> {
    backend: B,
    config: ElectionConfig,
    leader: Arc<AtomicBool>,
    stop: CancellationToken,
    /// Termination signal of the started runner, a child of the caller's
    /// cancellation token.
    term: Mutex<Option<CancellationToken>>,
    done: CancellationToken,
    errors_tx: Mutex<Option<flume::Sender<Error>>>,
    errors_rx: flume::Receiver<Error>,
}

impl Election<ConsulClient> {
    /// Create an election using a Consul client configured from the
    /// environment.
    pub fn with_default_client(key: &str, node: &str, wait_time: Duration) -> Result<Self> {
        Ok(Self::new(ConsulClient::from_env()?, key, node, wait_time))
    }
}

impl<B: Backend> Election<B> {
    /// `wait_time` is both the session TTL and the delay between failed
    /// attempts.
    pub fn new(backend: B, key: &str, node: &str, wait_time: Duration) -> Self {
        Self::with_config(backend, ElectionConfig::new(key, node, wait_time))
    }

    pub fn with_config(backend: B, config: ElectionConfig) -> Self {
        let (errors_tx, errors_rx) = flume::bounded(config.error_capacity.max(1));
        Self {
            backend,
            config,
            leader: Arc::new(AtomicBool::new(false)),
            stop: CancellationToken::new(),
            term: Mutex::new(None),
            done: CancellationToken::new(),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx,
        }
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn node(&self) -> &str {
        &self.config.node
    }

    /// Start the election, returning the leadership notifications.
    ///
    /// The first value is always `false`. Each send waits for the receiver,
    /// so the engine does not move on until a transition has been observed.
    /// The channel closes when the election ends, either through
    /// [`Election::stop`] or `cancel`.
    #[tracing::instrument(skip_all, fields(key = %self.config.key, node = %self.config.node), err)]
    pub fn election(&self, cancel: CancellationToken) -> Result<flume::Receiver<bool>> {
        if self.config.wait_time.is_zero() {
            return Err(Error::InvalidConfig("wait time must be positive".to_owned()));
        }
        let errors_tx = self
            .errors_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadyStarted)?;
        let (notify_tx, notify_rx) = flume::bounded(0);

        // Cancelling the caller's token cancels the child in the same call,
        // so the runner never sees one without the other.
        let term = cancel.child_token();
        {
            let mut slot = self.term.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(term.clone());
            if self.stop.is_cancelled() {
                term.cancel();
            }
        }

        let runner = Runner {
            backend: self.backend.clone(),
            config: self.config.clone(),
            leader: self.leader.clone(),
            term: term.clone(),
            state: None,
            notify_tx,
            errors_tx,
            errors_rx: self.errors_rx.clone(),
        };
        let stop = self.stop.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            runner.run().await;
            term.cancel();
            stop.cancel();
            done.cancel();
        });
        Ok(notify_rx)
    }

    /// Acquisition failures, oldest first.
    ///
    /// Errors are buffered up to the configured capacity; when nobody reads
    /// them the oldest are dropped rather than stalling the election.
    pub fn errors(&self) -> flume::Receiver<Error> {
        self.errors_rx.clone()
    }

    /// Last published leadership state. May lag a transition in progress.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Ask the election to end, releasing the lock if held. Safe to call
    /// more than once.
    pub fn stop(&self) {
        self.stop.cancel();
        if let Some(term) = self
            .term
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            term.cancel();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the election loop has ended and both channels are
    /// closed.
    pub async fn terminated(&self) {
        self.done.cancelled().await
    }
}

/// The control loop of a started election, owned by its task.
struct Runner<B: Backend> {
    backend: B,
    config: ElectionConfig,
    leader: Arc<AtomicBool>,
    term: CancellationToken,
    /// Last value published, `None` before the first.
    state: Option<bool>,
    notify_tx: flume::Sender<bool>,
    errors_tx: flume::Sender<Error>,
    /// Used to evict the oldest error when the buffer is full.
    errors_rx: flume::Receiver<Error>,
}

impl<B: Backend> Runner<B> {
    #[tracing::instrument(skip_all, fields(key = %self.config.key, node = %self.config.node))]
    async fn run(mut self) {
        let mut retry = Constant::new(self.config.wait_time);
        loop {
            if !self.publish(false).await {
                break;
            }

            let (mut lock, loss) = match self.acquire().await {
                Ok(Some(held)) => held,
                Ok(None) => break,
                Err(err) => {
                    self.report(err);
                    let delay = retry.next_backoff().unwrap_or(self.config.wait_time);
                    select! {
                        biased;
                        _ = self.term.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                    continue;
                }
            };

            if !self.publish(true).await {
                release(&mut lock, &self.config.key).await;
                break;
            }

            select! {
                biased;
                _ = self.term.cancelled() => {
                    info!("stopping, releasing leadership");
                    release(&mut lock, &self.config.key).await;
                    break;
                }
                _ = loss.cancelled() => {
                    warn!("leadership lost");
                    release(&mut lock, &self.config.key).await;
                }
            }
        }
        self.leader.store(false, Ordering::Release);
        debug!("election ended");
    }

    /// Take the lock, blocking until it is ours or the election ends.
    ///
    /// `Ok(None)` means the election ended first.
    async fn acquire(&self) -> Result<Option<(B::Lock, LossSignal)>> {
        if self.term.is_cancelled() {
            return Ok(None);
        }
        let key = &self.config.key;
        let options = LockOptions::new(
            key.as_str(),
            self.config.node.as_bytes(),
            self.config.wait_time,
        )
        .with_session_name(self.config.node.as_str());
        let mut lock = self
            .backend
            .prepare_lock(options)
            .map_err(|e| Error::acquisition(key, e))?;

        match lock.acquire(self.term.clone()).await {
            Ok(Some(loss)) => {
                if self.term.is_cancelled() {
                    // Stopped while the acquire completed; never claim it.
                    release(&mut lock, key).await;
                    return Ok(None);
                }
                Ok(Some((lock, loss)))
            }
            Ok(None) => Err(Error::acquisition(key, BackendError::LockHeld)),
            Err(BackendError::Aborted) if self.term.is_cancelled() => Ok(None),
            Err(e) => Err(Error::acquisition(key, e)),
        }
    }

    /// Publish a leadership state if it differs from the last one.
    ///
    /// Returns `false` when the election ended or the receiver is gone.
    async fn publish(&mut self, is_leader: bool) -> bool {
        if self.state == Some(is_leader) {
            return true;
        }
        self.leader.store(is_leader, Ordering::Release);
        let sent = select! {
            biased;
            _ = self.term.cancelled() => false,
            res = self.notify_tx.send_async(is_leader) => res.is_ok(),
        };
        if !sent {
            if !self.term.is_cancelled() {
                warn!("notification receiver dropped");
            }
            return false;
        }
        info!(is_leader, "leadership changed");
        self.state = Some(is_leader);
        true
    }

    fn report(&self, err: Error) {
        warn!(%err, "election attempt failed");
        let mut err = err;
        loop {
            match self.errors_tx.try_send(err) {
                Ok(()) => return,
                Err(flume::TrySendError::Full(e)) => {
                    let _ = self.errors_rx.try_recv();
                    err = e;
                }
                Err(flume::TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Give up a held lock. Failures are logged; the session TTL reclaims the
/// key eventually.
async fn release<L: LockHandle>(lock: &mut L, key: &str) {
    if let Err(err) = lock.release().await {
        warn!(%err, key, "releasing lock");
    }
}
