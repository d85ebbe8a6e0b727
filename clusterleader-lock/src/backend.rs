use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

/// Fires once the lock it was returned with is no longer held: the session
/// expired, the key was removed or taken over, or the lock was released.
pub type LossSignal = CancellationToken;

pub const DEFAULT_LOCK_WAIT_TIME: Duration = Duration::from_secs(15);

/// Describes a session-bound lock before it is acquired.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub key: String,
    pub value: Vec<u8>,
    pub session_name: Option<String>,
    pub session_ttl: Duration,
    pub try_once: bool,
    pub lock_wait_time: Duration,
}

impl LockOptions {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, session_ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            session_name: None,
            session_ttl,
            try_once: false,
            lock_wait_time: DEFAULT_LOCK_WAIT_TIME,
        }
    }

    /// Give up after a single attempt, waiting at most `lock_wait_time` for
    /// a current holder to go away.
    pub fn try_once(mut self, lock_wait_time: Duration) -> Self {
        self.try_once = true;
        self.lock_wait_time = lock_wait_time;
        self
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BackendError> {
        if self.key.is_empty() {
            return Err(BackendError::InvalidOptions("missing key".to_owned()));
        }
        if self.session_ttl.is_zero() {
            return Err(BackendError::InvalidOptions(
                "session ttl must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A coordination service offering session-scoped exclusive locks.
///
/// Implementations are cheap to clone and shared read-only between lock
/// managers and election engines.
pub trait Backend: Clone + Send + Sync + 'static {
    type Lock: LockHandle;

    /// Construct a lock descriptor without acquiring it.
    fn prepare_lock(&self, options: LockOptions) -> Result<Self::Lock, BackendError>;
}

pub trait LockHandle: Send + Sync + 'static {
    /// Acquire the lock.
    ///
    /// A try-once lock returns `Ok(None)` when the key is still held
    /// elsewhere after the lock wait time. A blocking lock waits until it
    /// is acquired or `abort` fires, in which case
    /// [`BackendError::Aborted`] is returned.
    fn acquire(
        &mut self,
        abort: CancellationToken,
    ) -> impl Future<Output = Result<Option<LossSignal>, BackendError>> + Send;

    /// Give up the lock, leaving the key in place.
    fn release(&mut self) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Remove the key so the next acquirer does not wait out the session TTL.
    fn destroy(&mut self) -> impl Future<Output = Result<(), BackendError>> + Send;
}
