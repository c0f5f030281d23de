// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux futex wrapper for inter-process wakeups on memfile words.
//!
//! Uses `FUTEX_WAIT` / `FUTEX_WAKE`, never the `_PRIVATE` variants: the
//! words live in shared memory and waiters sit in other processes.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

const FUTEX_WAIT: i32 = 0;
const FUTEX_WAKE: i32 = 1;

/// Block while `*addr == expected`, at most `timeout`.
///
/// Returns 0 on wake (or spurious wakeup), -1 on value mismatch, timeout
/// or error. Callers always re-check the word.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a live reference for the duration of the call;
    // the kernel only reads the word and the optional timespec.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake up to `count` waiters blocked on `addr`.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: same word the waiters use; wake does not dereference timespec
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}

// Non-Linux fallback: bounded sleep, callers poll
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> i32 {
    let sleep_time = timeout.unwrap_or(Duration::from_millis(1));
    std::thread::sleep(sleep_time.min(Duration::from_millis(10)));
    0
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    0
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn futex_wake_all(_addr: &AtomicU32) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wake_without_waiters() {
        let val = AtomicU32::new(0);
        assert!(futex_wake_all(&val) >= 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_wait_value_mismatch_returns_immediately() {
        let val = AtomicU32::new(42);
        let start = std::time::Instant::now();
        assert_eq!(futex_wait(&val, 0, Some(Duration::from_millis(500))), -1);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_wait_times_out() {
        let val = AtomicU32::new(7);
        let start = std::time::Instant::now();
        let _ = futex_wait(&val, 7, Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[test]
    fn test_wake_waiter() {
        let val = Arc::new(AtomicU32::new(0));
        let val_clone = Arc::clone(&val);

        let handle = thread::spawn(move || {
            while val_clone.load(Ordering::Acquire) == 0 {
                futex_wait(&val_clone, 0, Some(Duration::from_millis(200)));
            }
            val_clone.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(10));
        val.store(3, Ordering::Release);
        futex_wake_all(&val);

        assert_eq!(handle.join().expect("Failed to join waiter"), 3);
    }
}
