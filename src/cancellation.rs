//! Session teardown token.
//!
//! A bootstrap only needs a flat, idempotent teardown signal: no nested tokens, no callbacks. The
//! token is shared between the activation which owns the sessions and the pending bootstraps
//! which race every suspension point against [`CancellationToken::cancelled`].

use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

struct State {
    cancelled: bool,
    next_slot: u64,
    // One waker per pending `cancelled()` future, removed when that future is dropped.
    wakers: BTreeMap<u64, Waker>,
}

/// The cancellation token.
///
/// Clone it to listen to the same teardown event.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<Mutex<State>>,
}

impl CancellationToken {
    /// Creates a new, live, cancellation token.
    pub fn new() -> Self {
        CancellationToken {
            state: Arc::new(Mutex::new(State {
                cancelled: false,
                next_slot: 0,
                wakers: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Wakers and a flag cannot be left inconsistent by a panicking holder.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signals cancellation and wakes up all the waiters.
    ///
    /// Returns `true` for the call which actually cancelled, `false` if the token was already
    /// cancelled. Cancelling twice is harmless.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.cancelled {
            return false;
        }
        state.cancelled = true;

        for (_, waker) in std::mem::take(&mut state.wakers) {
            waker.wake();
        }
        true
    }

    /// Checks the cancellation status synchronously.
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Returns a future which completes when cancellation is requested.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        CancelledFuture {
            state: Arc::clone(&self.state),
            slot: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.lock().wakers.len()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct CancelledFuture {
    state: Arc<Mutex<State>>,
    slot: Option<u64>,
}

impl Future for CancelledFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.cancelled {
            if let Some(slot) = this.slot.take() {
                state.wakers.remove(&slot);
            }
            return Poll::Ready(());
        }

        let current_waker = cx.waker();
        match this.slot {
            Some(slot) => {
                let registered = state.wakers.get(&slot);
                if !registered.is_some_and(|waker| current_waker.will_wake(waker)) {
                    state.wakers.insert(slot, current_waker.clone());
                }
            }
            None => {
                let slot = state.next_slot;
                state.next_slot += 1;
                state.wakers.insert(slot, current_waker.clone());
                this.slot = Some(slot);
            }
        }

        Poll::Pending
    }
}

impl Drop for CancelledFuture {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .wakers
                .remove(&slot);
        }
    }
}
