//! # Bounded Queue
//!
//! A fixed-capacity FIFO hand-off between producers and consumers. It is the
//! only synchronization point shared by workers: backpressure comes from `put`
//! waiting for room, end-of-stream from a closed queue that has been drained.
//!
//! The queue is multi-producer and multi-consumer. State lives behind a
//! `parking_lot::Mutex` that is never held across an `.await`; waiters park on
//! `tokio::sync::Notify` and re-check the state when woken.
//!
//! A capacity of 0 models a rendezvous: an item is only accepted while a
//! consumer is parked in [`BoundedQueue::take`] waiting for it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Kind of a failed insertion, without the rejected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueErrorKind {
    Closed,
    Full,
    Interrupted,
}

/// A rejected insertion. The item is always handed back to the caller.
#[derive(Error)]
pub enum PutError<T> {
    #[error("queue is closed")]
    Closed(T),

    #[error("queue is full")]
    Full(T),

    #[error("put was interrupted before the queue had room")]
    Interrupted(T),
}

impl<T> PutError<T> {
    pub fn kind(&self) -> QueueErrorKind {
        match self {
            PutError::Closed(_) => QueueErrorKind::Closed,
            PutError::Full(_) => QueueErrorKind::Full,
            PutError::Interrupted(_) => QueueErrorKind::Interrupted,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            PutError::Closed(item) | PutError::Full(item) | PutError::Interrupted(item) => item,
        }
    }
}

impl<T> std::fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PutError").field(&self.kind()).finish()
    }
}

/// Outcome of a non-blocking [`BoundedQueue::try_take`].
#[derive(Debug, PartialEq, Eq)]
pub enum TryTake<T> {
    Item(T),
    /// Nothing buffered yet, but producers may still put.
    Empty,
    /// Closed and drained.
    EndOfStream,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Consumers currently parked in `take`. Drives the rendezvous mode.
    parked_takers: usize,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
}

impl<T> Shared<T> {
    fn has_room(&self, state: &State<T>) -> bool {
        if self.capacity == 0 {
            state.items.len() < state.parked_takers
        } else {
            state.items.len() < self.capacity
        }
    }
}

/// Handle to a bounded FIFO queue. Clones refer to the same queue.
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.shared.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Keeps `parked_takers` accurate even if a `take` future is dropped mid-wait.
struct ParkedTaker<'a, T> {
    shared: &'a Shared<T>,
    parked: bool,
}

impl<T> ParkedTaker<'_, T> {
    fn unpark(&mut self, state: &mut State<T>) {
        if self.parked {
            state.parked_takers -= 1;
            self.parked = false;
        }
    }
}

impl<T> Drop for ParkedTaker<'_, T> {
    fn drop(&mut self) {
        if self.parked {
            self.shared.state.lock().parked_takers -= 1;
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items. `0` is a rendezvous.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.min(1024)),
                    closed: false,
                    parked_takers: 0,
                }),
                capacity,
                item_ready: Notify::new(),
                space_ready: Notify::new(),
            }),
        }
    }

    /// Whether two handles refer to the identical queue object.
    pub fn same_queue(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Insert an item, waiting while the queue is full.
    pub async fn put(&self, item: T) -> Result<(), PutError<T>> {
        self.put_until(item, std::future::pending::<()>()).await
    }

    /// Insert an item, giving up once `token` is cancelled.
    ///
    /// A put that can complete immediately still succeeds after cancellation;
    /// only a put that would have to wait is interrupted.
    pub async fn put_cancellable(
        &self,
        item: T,
        token: &CancellationToken,
    ) -> Result<(), PutError<T>> {
        self.put_until(item, token.cancelled()).await
    }

    /// Insert an item, waiting at most `timeout` for room.
    pub async fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), PutError<T>> {
        self.put_until(item, tokio::time::sleep(timeout)).await
    }

    /// Insert an item, waiting for room until `stop` completes.
    pub async fn put_until<F>(&self, item: T, stop: F) -> Result<(), PutError<T>>
    where
        F: Future,
    {
        let mut stop = pin!(stop);
        loop {
            let mut space_ready = pin!(self.shared.space_ready.notified());
            space_ready.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(PutError::Closed(item));
                }
                if self.shared.has_room(&state) {
                    state.items.push_back(item);
                    drop(state);
                    self.shared.item_ready.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                biased;
                _ = &mut space_ready => {}
                _ = &mut stop => return Err(PutError::Interrupted(item)),
            }
        }
    }

    /// Insert an item without waiting.
    pub fn try_put(&self, item: T) -> Result<(), PutError<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(PutError::Closed(item));
        }
        if !self.shared.has_room(&state) {
            return Err(PutError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.shared.item_ready.notify_waiters();
        Ok(())
    }

    /// Remove the oldest item, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained. Dropping the
    /// returned future before it completes loses no item.
    pub async fn take(&self) -> Option<T> {
        let mut parked = ParkedTaker {
            shared: &self.shared,
            parked: false,
        };

        loop {
            let mut item_ready = pin!(self.shared.item_ready.notified());
            item_ready.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.items.pop_front() {
                    parked.unpark(&mut state);
                    drop(state);
                    self.shared.space_ready.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    parked.unpark(&mut state);
                    return None;
                }
                if !parked.parked {
                    state.parked_takers += 1;
                    parked.parked = true;
                    if self.shared.capacity == 0 {
                        drop(state);
                        // A rendezvous producer may be waiting for a taker.
                        self.shared.space_ready.notify_waiters();
                    }
                }
            }

            item_ready.await;
        }
    }

    /// Remove the oldest item without waiting.
    pub fn try_take(&self) -> TryTake<T> {
        let mut state = self.shared.state.lock();
        match state.items.pop_front() {
            Some(item) => {
                drop(state);
                self.shared.space_ready.notify_waiters();
                TryTake::Item(item)
            }
            None if state.closed => TryTake::EndOfStream,
            None => TryTake::Empty,
        }
    }

    /// Close the queue for writing.
    ///
    /// Buffered items stay available to consumers. Returns `true` only for
    /// the call that performed the transition.
    pub fn close(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        drop(state);
        self.shared.item_ready.notify_waiters();
        self.shared.space_ready.notify_waiters();
        true
    }
}
