//! Async connection pool primitives.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};

struct IdleEntry<T> {
    value: T,
    since: Instant,
}

struct AsyncPoolState<T> {
    idle: Vec<IdleEntry<T>>,
}

pub type FactoryFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

/// An async bounded pool for reusable connection-like objects.
pub struct AsyncPool<T> {
    max: usize,
    max_idle: Option<Duration>,
    factory: Box<dyn Fn() -> FactoryFuture<T> + Send + Sync>,
    state: Mutex<AsyncPoolState<T>>,
    available: Notify,
    in_flight: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("timed out waiting for a pooled connection")]
    Timeout,
    #[error("connection acquire cancelled")]
    Cancelled,
    #[error("{0}")]
    Create(String),
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled async value that returns to the pool on drop.
///
/// A poisoned value is discarded on drop instead, freeing its slot so the
/// pool can create a replacement.
pub struct AsyncPooled<T> {
    pool: Arc<AsyncPool<T>>,
    value: Option<T>,
    poisoned: AtomicBool,
}

impl<T> AsyncPool<T> {
    pub fn new<F, Fut, E>(max: usize, max_idle: Option<Duration>, factory: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let factory = Box::new(move || {
            let fut = factory();
            Box::pin(async move { fut.await.map_err(|err| err.to_string()) }) as FactoryFuture<T>
        });
        Arc::new(Self {
            max: max.max(1),
            max_idle,
            factory,
            state: Mutex::new(AsyncPoolState { idle: Vec::new() }),
            available: Notify::new(),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<AsyncPooled<T>, AcquireError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(AcquireError::Cancelled);
                }
            }
            if let Some(item) = self.pop_idle() {
                return Ok(self.wrap(item));
            }
            if self.try_reserve() {
                match (self.factory)().await {
                    Ok(item) => return Ok(self.wrap(item)),
                    Err(err) => {
                        self.discard();
                        return Err(AcquireError::Create(err));
                    }
                }
            }

            let wait = match deadline {
                None => None,
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AcquireError::Timeout);
                    }
                    Some(limit - now)
                }
            };

            match (cancel, wait) {
                (Some(token), Some(duration)) => {
                    tokio::select! {
                        _ = self.available.notified() => {},
                        _ = token.cancelled() => return Err(AcquireError::Cancelled),
                        _ = sleep(duration) => return Err(AcquireError::Timeout),
                    }
                }
                (Some(token), None) => {
                    tokio::select! {
                        _ = self.available.notified() => {},
                        _ = token.cancelled() => return Err(AcquireError::Cancelled),
                    }
                }
                (None, Some(duration)) => {
                    tokio::select! {
                        _ = self.available.notified() => {},
                        _ = sleep(duration) => return Err(AcquireError::Timeout),
                    }
                }
                (None, None) => {
                    self.available.notified().await;
                }
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn wrap(self: &Arc<Self>, item: T) -> AsyncPooled<T> {
        AsyncPooled {
            pool: Arc::clone(self),
            value: Some(item),
            poisoned: AtomicBool::new(false),
        }
    }

    fn try_reserve(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.max).then_some(count + 1)
            })
            .is_ok()
    }

    /// Pops the most recently released idle value, dropping any that sat
    /// idle for longer than `max_idle`.
    fn pop_idle(&self) -> Option<T> {
        let mut expired = Vec::new();
        let item = {
            let mut state = self.state.lock();
            loop {
                let Some(entry) = state.idle.pop() else {
                    break None;
                };
                match self.max_idle {
                    Some(limit) if entry.since.elapsed() > limit => expired.push(entry.value),
                    _ => break Some(entry.value),
                }
            }
        };
        for value in expired {
            drop(value);
            self.discard();
        }
        item
    }

    fn release(&self, item: T) {
        self.state.lock().idle.push(IdleEntry {
            value: item,
            since: Instant::now(),
        });
        self.available.notify_one();
    }

    fn discard(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> AsyncPooled<T> {
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }

    /// Marks the value as unusable; it is discarded when the last owner drops it.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }
}

impl<T> AsRef<T> for AsyncPooled<T> {
    fn as_ref(&self) -> &T {
        self.value
            .as_ref()
            .expect("AsyncPooled value missing (already released)")
    }
}

impl<T> Deref for AsyncPooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.as_ref()
    }
}

impl<T> Drop for AsyncPooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            if *self.poisoned.get_mut() {
                drop(item);
                self.pool.discard();
            } else {
                self.pool.release(item);
            }
        }
    }
}
