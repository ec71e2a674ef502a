use core::mem::size_of;
use std::time::{Duration, Instant};

use crate::sync::{AtomicU32, Ordering, thread};

/// Process-shared counting semaphore (8 bytes).
///
/// Lives directly inside a shared mapping. Every `post` is consumed by exactly
/// one successful `wait`; posts made while nobody waits are kept in the count.
/// All-zero bytes are a valid semaphore with a count of 0.
#[repr(C)]
pub struct Semaphore {
    /// Pending posts. Also the futex word waiters sleep on.
    count: AtomicU32,
    /// Number of threads currently blocked (any process).
    waiters: AtomicU32,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(size_of::<Semaphore>() == 8);

impl Semaphore {
    #[cfg(not(feature = "loom"))]
    pub const fn new(initial: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
            waiters: AtomicU32::new(0),
        }
    }

    #[cfg(feature = "loom")]
    pub fn new(initial: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
            waiters: AtomicU32::new(0),
        }
    }

    /// Size of the in-memory representation.
    pub const fn layout_size() -> usize {
        size_of::<Self>()
    }

    /// Current count.
    #[inline]
    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Drop any pending posts.
    ///
    /// Only sound when no other party can post or wait concurrently.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    /// Release one waiter (or bank the post for the next one).
    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            wake_one(&self.count);
        }
    }

    /// Consume one post if one is pending.
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Block until a post is consumed.
    pub fn wait(&self) {
        while !self.try_wait() {
            self.block(None);
        }
    }

    /// Block until a post is consumed or `timeout` elapses.
    ///
    /// Returns `true` if a post was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now().checked_add(timeout))
    }

    /// Block until a post is consumed or `deadline` passes (`None` = forever).
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.try_wait() {
                return true;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.block(remaining);
        }
    }

    fn block(&self, timeout: Option<Duration>) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        sleep_while_zero(&self.count, timeout);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count.load(Ordering::Relaxed))
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(not(feature = "loom"))]
fn sleep_while_zero(word: &AtomicU32, timeout: Option<Duration>) {
    if crate::futex::futex_wait(word, 0, timeout).is_err() {
        thread::yield_now();
    }
}

#[cfg(feature = "loom")]
fn sleep_while_zero(_word: &AtomicU32, _timeout: Option<Duration>) {
    thread::yield_now();
}

#[cfg(not(feature = "loom"))]
fn wake_one(word: &AtomicU32) {
    crate::futex::futex_wake(word, 1);
}

#[cfg(feature = "loom")]
fn wake_one(_word: &AtomicU32) {}
