use portable_atomic::{AtomicU32, Ordering};

use crate::port::Scheduler;

/// Opaque token that can be used to release an [`OperationLock`].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[must_use = "the operation lock stays held until the token is released"]
pub struct LockToken {
    held: bool,
}

impl LockToken {
    pub(crate) const fn bypassed() -> Self {
        Self { held: false }
    }

    /// Returns `true` if the lock was actually taken, `false` if acquisition
    /// was skipped because the scheduler was not running yet.
    pub fn is_held(&self) -> bool {
        self.held
    }
}

/// Serializes flash operations across all cores.
///
/// The lock is not reentrant and is not owned by a core: a second acquisition
/// from the same task waits forever. Waiting yields to the scheduler, so it
/// must only be acquired before any core has been parked.
pub struct OperationLock {
    holders: AtomicU32,
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLock {
    /// Create a new lock.
    pub const fn new() -> Self {
        Self {
            holders: AtomicU32::new(0),
        }
    }

    /// Acquires the lock, waiting as long as it takes.
    ///
    /// Before the scheduler has started no other context can contend for
    /// the lock, so acquisition is skipped and the returned token releases
    /// nothing.
    pub fn acquire(&self, scheduler: &impl Scheduler) -> LockToken {
        if !scheduler.is_started() {
            return LockToken::bypassed();
        }

        while self
            .holders
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            scheduler.yield_now();
        }

        LockToken { held: true }
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// `token` must come from [`OperationLock::acquire`] on this lock, and
    /// the context that acquired it must be the one releasing it.
    pub unsafe fn release(&self, token: LockToken) {
        if token.held {
            debug_assert_eq!(
                self.holders.load(Ordering::Relaxed),
                1,
                "released an operation lock that is not held"
            );
            self.holders.store(0, Ordering::Release);
        }
    }

    /// Number of contexts currently holding the lock: `0` or `1`.
    pub fn holders(&self) -> u32 {
        self.holders.load(Ordering::Relaxed)
    }

    /// Runs the callback with this lock held.
    pub fn lock<R>(&self, scheduler: &impl Scheduler, f: impl FnOnce() -> R) -> R {
        struct Guard<'a> {
            lock: &'a OperationLock,
            token: Option<LockToken>,
        }

        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                if let Some(token) = self.token.take() {
                    unsafe { self.lock.release(token) };
                }
            }
        }

        let _guard = Guard {
            lock: self,
            token: Some(self.acquire(scheduler)),
        };

        f()
    }
}
