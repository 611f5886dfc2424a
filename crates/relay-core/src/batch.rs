//! Time- and size-bounded coalescing buffer.
//!
//! Callers enqueue items one at a time. The buffer is handed to the batch
//! processor as soon as it reaches `batch_size` items, or when a single
//! timer, armed by the first item to land in an empty buffer, fires after
//! `batch_timeout`. The processor runs as a spawned task, never on the
//! enqueuing caller, and a failing processor is logged and forgotten.
//!
//! The swap of the buffer and the disarming of the timer happen under the
//! same lock as the size check, so a buffer handed to the processor is
//! never touched by later enqueues, and a stale timer can't flush a buffer
//! that a later item started.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::error;

type BatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Processor<T> = Box<dyn Fn(Vec<T>) -> BatchFuture + Send + Sync>;

/// A buffer that hands items to a processor in bursts.
pub struct BatchedQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    processor: Processor<T>,
    handle: Handle,
}

struct State<T> {
    buffer: Vec<T>,
    batch_size: usize,
    timeout: Duration,
    process_once: bool,
    /// Bumped on every swap. A timer only flushes the buffer generation it
    /// was armed for.
    epoch: u64,
    timer: Option<AbortHandle>,
}

impl<T> State<T> {
    fn take(&mut self) -> Vec<T> {
        self.epoch = self.epoch.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size))
    }
}

impl<T: Send + 'static> BatchedQueue<T> {
    /// Creates a queue that spawns `processor` on `handle` for each burst.
    ///
    /// A `batch_size` of zero is treated as one.
    pub fn new<F, Fut>(batch_size: usize, timeout: Duration, handle: Handle, processor: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let batch_size = batch_size.max(1);
        let processor: Processor<T> = Box::new(move |batch| Box::pin(processor(batch)));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buffer: Vec::with_capacity(batch_size),
                    batch_size,
                    timeout,
                    process_once: false,
                    epoch: 0,
                    timer: None,
                }),
                processor,
                handle,
            }),
        }
    }

    /// Adds an item, flushing if the buffer is full or a one-shot flush
    /// was requested.
    pub fn enqueue(&self, item: T) {
        let batch = {
            let mut state = self.inner.lock();
            state.buffer.push(item);
            let flush = state.buffer.len() >= state.batch_size || state.process_once;
            state.process_once = false;
            if flush {
                Some(state.take())
            } else {
                if state.buffer.len() == 1 {
                    self.arm_timer(&mut state);
                }
                None
            }
        };
        if let Some(batch) = batch {
            self.inner.dispatch(batch);
        }
    }

    /// Makes the next `enqueue` flush regardless of buffer size.
    pub fn set_process_once(&self) {
        self.inner.lock().process_once = true;
    }

    /// Changes the timeout. A changed timeout flushes whatever is buffered.
    pub fn set_batch_timeout(&self, timeout: Duration) {
        let batch = {
            let mut state = self.inner.lock();
            if state.timeout == timeout {
                return;
            }
            state.timeout = timeout;
            state.take()
        };
        self.inner.dispatch(batch);
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        self.inner.lock().batch_size = batch_size.max(1);
    }

    pub fn batch_size(&self) -> usize {
        self.inner.lock().batch_size
    }

    pub fn batch_timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    /// Number of items waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Hands whatever is buffered to the processor now.
    pub fn flush(&self) {
        let batch = self.inner.lock().take();
        self.inner.dispatch(batch);
    }

    fn arm_timer(&self, state: &mut State<T>) {
        let epoch = state.epoch;
        let timeout = state.timeout;
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let task = self.inner.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_epoch(epoch);
            }
        });
        state.timer = Some(task.abort_handle());
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush_epoch(self: &Arc<Self>, epoch: u64) {
        let batch = {
            let mut state = self.lock();
            if state.epoch != epoch || state.buffer.is_empty() {
                return;
            }
            // the timer task is the caller here, don't abort it
            state.timer = None;
            state.take()
        };
        self.dispatch(batch);
    }

    fn dispatch(self: &Arc<Self>, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        let task = self
            .handle
            .spawn(async move { (inner.processor)(batch).await });
        self.handle.spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("batch processor panicked: {e}");
                }
            }
        });
    }
}

impl<T> Drop for BatchedQueue<T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}
