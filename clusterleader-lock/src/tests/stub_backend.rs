use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{select, sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, LockHandle, LockOptions, LossSignal},
    error::BackendError,
};

type BackendResult<T> = std::result::Result<T, BackendError>;

struct Held {
    session: u64,
    value: Vec<u8>,
    loss: LossSignal,
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Option<Held>>,
    next_session: u64,
}

/// In-memory lock service with the same contract as the Consul backend.
///
/// The `*_result` hooks run before each operation and may inject failures.
#[derive(Clone)]
pub struct StubBackend {
    state: Arc<Mutex<State>>,
    changed: Arc<watch::Sender<u64>>,

    pub prepare_result: Arc<Mutex<dyn Fn(&LockOptions) -> BackendResult<()> + Send + 'static>>,
    pub acquire_result: Arc<Mutex<dyn Fn(&str) -> BackendResult<()> + Send + 'static>>,
    pub release_result: Arc<Mutex<dyn Fn(&str) -> BackendResult<()> + Send + 'static>>,
    pub destroy_result: Arc<Mutex<dyn Fn(&str) -> BackendResult<()> + Send + 'static>>,
}

impl StubBackend {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        StubBackend {
            state: Arc::new(Mutex::new(State::default())),
            changed: Arc::new(changed),
            prepare_result: Arc::new(Mutex::new(|_options: &LockOptions| Ok(()))),
            acquire_result: Arc::new(Mutex::new(|_key: &str| Ok(()))),
            release_result: Arc::new(Mutex::new(|_key: &str| Ok(()))),
            destroy_result: Arc::new(Mutex::new(|_key: &str| Ok(()))),
        }
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v += 1);
    }

    /// Value stored by the current holder of `key`, if it is held.
    pub fn holder(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .keys
            .get(key)
            .and_then(|held| held.as_ref().map(|h| h.value.clone()))
    }

    /// Whether `key` exists at all, held or not.
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().keys.contains_key(key)
    }

    /// Simulate the holder's session expiring.
    pub fn expire(&self, key: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(Some(held)) = state.keys.get_mut(key).map(Option::take) {
                held.loss.cancel();
            }
        }
        self.notify();
    }

    /// Simulate the key being deleted out from under its holder.
    pub fn delete(&self, key: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(Some(held)) = state.keys.remove(key) {
                held.loss.cancel();
            }
        }
        self.notify();
    }
}

impl Backend for StubBackend {
    type Lock = StubLock;

    fn prepare_lock(&self, options: LockOptions) -> BackendResult<StubLock> {
        (*(self.prepare_result.lock().unwrap()))(&options)?;
        options.validate()?;
        Ok(StubLock {
            backend: self.clone(),
            options,
            session: None,
        })
    }
}

pub struct StubLock {
    backend: StubBackend,
    options: LockOptions,
    session: Option<u64>,
}

impl StubLock {
    /// Take the key if it is free.
    fn try_take(&mut self) -> Option<LossSignal> {
        let mut state = self.backend.state.lock().unwrap();
        let slot = state.keys.entry(self.options.key.clone()).or_insert(None);
        if slot.is_some() {
            return None;
        }
        let loss = LossSignal::new();
        let session = state.next_session;
        state.next_session += 1;
        state.keys.insert(
            self.options.key.clone(),
            Some(Held {
                session,
                value: self.options.value.clone(),
                loss: loss.clone(),
            }),
        );
        self.session = Some(session);
        Some(loss)
    }
}

impl LockHandle for StubLock {
    async fn acquire(&mut self, abort: CancellationToken) -> BackendResult<Option<LossSignal>> {
        (*(self.backend.acquire_result.lock().unwrap()))(&self.options.key)?;
        if self.session.is_some() {
            return Err(BackendError::LockHeld);
        }
        let deadline = Instant::now() + self.options.lock_wait_time;
        let mut changed = self.backend.changed.subscribe();
        loop {
            if abort.is_cancelled() {
                return Err(BackendError::Aborted);
            }
            if let Some(loss) = self.try_take() {
                self.backend.notify();
                return Ok(Some(loss));
            }
            if self.options.try_once && Instant::now() >= deadline {
                return Ok(None);
            }
            select! {
                _ = abort.cancelled() => return Err(BackendError::Aborted),
                _ = changed.changed() => {}
                _ = tokio::time::sleep_until(deadline), if self.options.try_once => {}
                // Blocking waiters re-check periodically in case a change
                // was published before they subscribed.
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    async fn release(&mut self) -> BackendResult<()> {
        let session = self.session.take().ok_or(BackendError::LockNotHeld)?;
        (*(self.backend.release_result.lock().unwrap()))(&self.options.key)?;
        {
            let mut state = self.backend.state.lock().unwrap();
            if let Some(slot) = state.keys.get_mut(&self.options.key) {
                if slot.as_ref().map(|h| h.session) == Some(session) {
                    if let Some(held) = slot.take() {
                        held.loss.cancel();
                    }
                }
            }
        }
        self.backend.notify();
        Ok(())
    }

    async fn destroy(&mut self) -> BackendResult<()> {
        if self.session.is_some() {
            return Err(BackendError::LockHeld);
        }
        (*(self.backend.destroy_result.lock().unwrap()))(&self.options.key)?;
        {
            let mut state = self.backend.state.lock().unwrap();
            match state.keys.get(&self.options.key) {
                None => return Ok(()),
                Some(Some(_)) => return Err(BackendError::LockInUse),
                Some(None) => {
                    state.keys.remove(&self.options.key);
                }
            }
        }
        self.backend.notify();
        Ok(())
    }
}

impl Drop for StubLock {
    fn drop(&mut self) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        if let Ok(mut state) = self.backend.state.lock() {
            if let Some(slot) = state.keys.get_mut(&self.options.key) {
                if slot.as_ref().map(|h| h.session) == Some(session) {
                    if let Some(held) = slot.take() {
                        held.loss.cancel();
                    }
                }
            }
        }
        self.backend.notify();
    }
}
