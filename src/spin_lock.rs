// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adaptive-backoff spinning. Every polling wait in the runtime (slot fences,
// distributed locks, exchange barriers) funnels through `adaptive_yield` so
// the backoff behaviour is uniform.

use std::sync::atomic::{AtomicU32, Ordering};

/// Backoff ladder: busy spin, then CPU pause hint, then thread yield, then
/// a 1 ms sleep once the wait is clearly not short.
///
/// - k < 4:  busy spin
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A word-sized spin lock with adaptive backoff.
///
/// The lock word lives wherever the struct is placed, which may be shared
/// mapped memory; all state is a single `AtomicU32` so a zero-filled region
/// is a valid unlocked lock.
#[repr(transparent)]
pub struct SpinLock {
    word: AtomicU32,
}

impl SpinLock {
    /// Create a new unlocked spin lock.
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Acquire the lock, spinning with adaptive backoff.
    pub fn lock(&self) {
        let mut k = 0u32;
        while self.word.swap(1, Ordering::Acquire) != 0 {
            adaptive_yield(&mut k);
        }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    pub fn unlock(&self) {
        self.word.store(0, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the lock word is designed for concurrent access.
unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_unlock() {
        let l = SpinLock::new();
        l.lock();
        assert!(!l.try_lock());
        l.unlock();
        assert!(l.try_lock());
        l.unlock();
    }

    #[test]
    fn contended_counter() {
        let lock = Arc::new(SpinLock::new());
        let count = Arc::new(std::cell::UnsafeCell::new(0u64));

        struct SharedCell(Arc<std::cell::UnsafeCell<u64>>);
        unsafe impl Send for SharedCell {}

        let mut threads = Vec::new();
        for _ in 0..4 {
            let l = Arc::clone(&lock);
            let c = SharedCell(Arc::clone(&count));
            threads.push(std::thread::spawn(move || {
                let c = c;
                for _ in 0..1000 {
                    l.lock();
                    unsafe { *c.0.get() += 1 };
                    l.unlock();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(unsafe { *count.get() }, 4000);
    }
}
