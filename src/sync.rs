//! Spin locks and lock-order instrumentation
//!
//! Component tables are protected by a fair ticket lock. Owner and next
//! ticket share one word, low half owner, high half next, the same way
//! the arm64 kernel lays out `arch_spinlock_t`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

const TICKET_SHIFT: u32 = 16;
const TICKET_ONE: u32 = 1 << TICKET_SHIFT;
const OWNER_MASK: u32 = TICKET_ONE - 1;

#[inline]
fn owner(word: u32) -> u16 {
    (word & OWNER_MASK) as u16
}

#[inline]
fn next(word: u32) -> u16 {
    (word >> TICKET_SHIFT) as u16
}

pub struct SpinLock<T> {
    tickets: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

/// Held lock. Unlocks on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            tickets: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let ticket = next(self.tickets.fetch_add(TICKET_ONE, Ordering::Acquire));
        while owner(self.tickets.load(Ordering::Acquire)) != ticket {
            core::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Take the lock only if nobody holds or waits for it.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let word = self.tickets.load(Ordering::Relaxed);
        if owner(word) != next(word) {
            return None;
        }
        self.tickets
            .compare_exchange(word, word.wrapping_add(TICKET_ONE), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        let word = self.tickets.load(Ordering::Relaxed);
        owner(word) != next(word)
    }
}

impl<T> core::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Only the holder moves the owner half, so a plain increment of
        // the low 16 bits is enough as long as it does not carry.
        let mut word = self.lock.tickets.load(Ordering::Relaxed);
        loop {
            let bumped = (word & !OWNER_MASK) | (owner(word).wrapping_add(1) as u32);
            match self
                .lock
                .tickets
                .compare_exchange_weak(word, bumped, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(seen) => word = seen,
            }
        }
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe { core::arch::asm!("sev", options(nostack, nomem)) };
    }
}

// ── Lock ordering ────────────────────────────────────────────────────

/// Component lock classes, in the only order they may be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockClass {
    Host,
    Hyp,
    Guest,
}

/// Receives every component lock acquire and release.
///
/// Installed by test harnesses to verify that no code path ever takes a
/// lower class while holding a higher one.
pub trait LockObserver: Send + Sync {
    fn acquired(&self, class: LockClass);
    fn released(&self, class: LockClass);
}
