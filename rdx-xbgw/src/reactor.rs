//! The readiness wait primitive used by the dispatcher.
//!
//! A [`Reactor`] lets the dispatcher thread block until either something
//! interesting happens or a timeout elapses. Anything that can make a handle
//! ready (a radio receive path, the cross-thread queue, a shutdown request)
//! holds a cloned [`Waker`] and calls [`Waker::wake`].
//!
//! Wakeups are latched: a wake that arrives while the dispatcher is busy is not
//! lost, the next [`Reactor::wait`] returns immediately.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Signal {
    woken: Mutex<bool>,
    cond: Condvar,
}

#[derive(Debug, Default)]
pub struct Reactor {
    signal: Arc<Signal>,
}

/// A cloneable, thread-safe handle that interrupts [`Reactor::wait`].
#[derive(Debug, Clone)]
pub struct Waker {
    signal: Arc<Signal>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waker(&self) -> Waker {
        Waker {
            signal: self.signal.clone(),
        }
    }

    /// Blocks for at most `timeout`, returning early if woken.
    ///
    /// Returns `true` if a wakeup was consumed, `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut woken = self.signal.woken.lock();
        while !*woken {
            if self.signal.cond.wait_until(&mut woken, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *woken, false)
    }
}

impl Waker {
    pub fn wake(&self) {
        let mut woken = self.signal.woken.lock();
        *woken = true;
        self.signal.cond.notify_one();
    }
}
